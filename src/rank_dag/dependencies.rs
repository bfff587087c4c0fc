//! Cross-threadblock dependency inference.
//!
//! Must run after threadblock assignment has given every reachable op a
//! final `tb`/`step` (a dependency is only meaningful once we know which
//! threadblock executes each side). Runtime execution order within a
//! single threadblock is already sequential, so only dependencies that
//! cross a threadblock boundary need to be tracked explicitly.

use std::collections::HashMap;

use crate::op::{Instruction, OpId};

use super::RankDag;

/// For every op, keeps one predecessor per distinct threadblock among its
/// `prev` set (the one with the highest `step`, since a later op in the
/// same threadblock already implies everything before it happened), and
/// drops `start` phantom roots entirely — they carry no runtime cost to
/// wait on.
pub(crate) fn infer_dependencies(dag: &mut RankDag) {
    for id in 0..dag.arena.len() {
        let prevs: Vec<OpId> = dag.arena[id].prev.iter().copied().collect();
        let mut best: HashMap<i32, OpId> = HashMap::new();
        for prev in prevs {
            let prev_op = &dag.arena[prev];
            if prev_op.inst == Instruction::Start {
                continue;
            }
            let slot = best.entry(prev_op.tb).or_insert(prev);
            if dag.arena[*slot].step < prev_op.step {
                *slot = prev;
            }
        }
        let mut depends: Vec<OpId> = best.into_values().collect();
        depends.sort_unstable();
        dag.arena[id].depends = depends;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferName;
    use crate::op::ChunkRef;

    #[test]
    fn start_predecessors_are_excluded() {
        let mut dag = RankDag::new(1);
        let r = ChunkRef::new(0, BufferName::Input, 0, 1);
        let start = dag.add_start(0, r.clone());
        let out = ChunkRef::new(0, BufferName::Output, 0, 1);
        let copy = dag.add_copy(0, r, out, 0, 0, 0);
        dag.op_mut(copy).tb = 1;
        dag.op_mut(copy).step = 0;
        dag.op_mut(start).tb = -1;

        infer_dependencies(&mut dag);
        assert!(dag.op(copy).depends.is_empty());
    }

    #[test]
    fn keeps_only_highest_step_per_threadblock() {
        let mut dag = RankDag::new(1);
        let a = ChunkRef::new(0, BufferName::Input, 0, 1);
        let scratch = ChunkRef::new(0, BufferName::Scratch("s".into()), 0, 1);
        let dst = ChunkRef::new(0, BufferName::Output, 0, 1);
        // two non-start predecessors sharing a threadblock, different steps
        let early = dag.add_copy(0, a.clone(), scratch.clone(), 0, 0, 0);
        let late = dag.add_copy(0, a, scratch.clone(), 1, 0, 0);
        dag.op_mut(early).tb = 0;
        dag.op_mut(early).step = 0;
        dag.op_mut(late).tb = 0;
        dag.op_mut(late).step = 3;

        let op = dag.add_copy(0, scratch, dst, 2, 0, 2);
        dag.op_mut(op).tb = 2;
        dag.op_mut(op).step = 0;
        dag.op_mut(op).prev.insert(early);
        dag.op_mut(op).prev.insert(late);
        dag.op_mut(early).next.insert(op);
        dag.op_mut(late).next.insert(op);

        infer_dependencies(&mut dag);
        assert_eq!(dag.op(op).depends, vec![late]);
    }
}
