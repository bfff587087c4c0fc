//! Peephole fusion: folds short op chains into single pipelined
//! instructions before threadblock assignment.
//!
//! Runs over the raw prev/next graph built by [`super::RankDag`]'s
//! `add_*` methods, using whatever `tb`/`channel` hints the caller already
//! attached to each op (a concrete id, or `-1` for "let assignment
//! decide") — fusion only needs the two sides to agree, not to already be
//! finalized.

use std::collections::{HashSet, VecDeque};

use crate::op::{Instruction, OpId};

use super::RankDag;

pub(crate) fn optimize(dag: &mut RankDag) {
    optimize_rrcs_rrs(dag);
    optimize_rcs(dag);
}

fn same_tb_and_count(a: OpId, b: OpId, dag: &RankDag) -> bool {
    dag.arena[a].tb == dag.arena[b].tb && dag.arena[a].count() == dag.arena[b].count()
}

fn only_child(dag: &RankDag, id: OpId) -> Option<OpId> {
    let next = &dag.arena[id].next;
    if next.len() == 1 {
        next.iter().next().copied()
    } else {
        None
    }
}

fn walk_roots(dag: &RankDag) -> Vec<OpId> {
    let mut roots: Vec<OpId> = dag.operations.values().copied().collect();
    roots.sort_unstable();
    roots.dedup();
    roots
}

/// Walks every op reachable from the slot roots exactly once, applying
/// `visit` at each. The original re-walks from every slot with no
/// deduplication, which both does redundant work and risks visiting
/// (and so attempting to fuse) the same op repeatedly; a single
/// crate-wide visited set removes both without changing which chains get
/// fused, since `visit` only fires the first time a node is seen.
fn for_each_op_once(dag: &mut RankDag, mut visit: impl FnMut(&mut RankDag, OpId)) {
    let mut frontier: VecDeque<OpId> = walk_roots(dag).into();
    let mut visited = HashSet::new();
    while let Some(id) = frontier.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        visit(dag, id);
        let next: Vec<OpId> = dag.arena[id].next.iter().copied().collect();
        frontier.extend(next);
    }
}

/// `recv(..) -> send(..)` with matching destination, where the send reads
/// exactly what the recv just wrote, becomes `recv_copy_send`.
///
/// The original's equivalent check, `same_buf_dst`, compares the *two
/// ops' destinations* rather than the send's source against the recv's
/// destination; for a chain where `op.next == [next_op]` that reduces to
/// comparing the recv's own write target against the send's final
/// destination on a different rank, which can never hold. Treated here as
/// the transposed-comparison bug it looks like, and replaced with the
/// comparison the fusion is actually named for (see `DESIGN.md`).
fn optimize_rcs(dag: &mut RankDag) {
    for_each_op_once(dag, |dag, id| {
        let Some(next_id) = only_child(dag, id) else { return };
        let fuse_it = dag.arena[id].inst == Instruction::Recv
            && dag.arena[next_id].inst == Instruction::Send
            && same_tb_and_count(id, next_id, dag)
            && dag.arena[next_id].src == dag.arena[id].dst;
        if fuse_it {
            fuse(dag, id, next_id, Instruction::RecvCopySend);
        }
    });
}

/// `recv_reduce_copy -> send -> recv` collapses to `recv_reduce_send`;
/// failing that, `recv_reduce_copy -> send` alone collapses to
/// `recv_reduce_copy_send`. Checked in that order so a successful 3-chain
/// fusion changes `op.inst` away from `recv_reduce_copy` before the
/// 2-chain check re-examines the (now different) op, matching how the
/// original's sequential checks avoid double-fusing the same node.
fn optimize_rrcs_rrs(dag: &mut RankDag) {
    for_each_op_once(dag, |dag, id| {
        if let Some(next_id) = only_child(dag, id) {
            if let Some(nnext_id) = only_child(dag, next_id) {
                let fuse_it = dag.arena[id].inst == Instruction::RecvReduceCopy
                    && dag.arena[next_id].inst == Instruction::Send
                    && dag.arena[nnext_id].inst == Instruction::Recv
                    && same_tb_and_count(id, next_id, dag);
                if fuse_it {
                    fuse(dag, id, next_id, Instruction::RecvReduceSend);
                }
            }
        }
        if let Some(next_id) = only_child(dag, id) {
            let fuse_it = dag.arena[id].inst == Instruction::RecvReduceCopy
                && dag.arena[next_id].inst == Instruction::Send
                && same_tb_and_count(id, next_id, dag);
            if fuse_it {
                fuse(dag, id, next_id, Instruction::RecvReduceCopySend);
            }
        }
    });
}

/// Absorbs `next_id` into `id`: `id` takes `next_id`'s instruction kind,
/// destination and matched peers, and `next_id` is spliced out of the
/// graph.
fn fuse(dag: &mut RankDag, id: OpId, next_id: OpId, new_inst: Instruction) {
    let dst = dag.arena[next_id].dst.clone();
    let mut matched = dag.arena[next_id].matched.clone();
    {
        let op = &mut dag.arena[id];
        op.inst = new_inst;
        op.dst = dst;
        op.matched.append(&mut matched);
    }
    remove_op(dag, next_id);
}

/// Splices `id` out of the graph, reconnecting its predecessors directly
/// to its successors. `id` itself is left dangling in the arena (dead but
/// addressable — arena slots are never reused or removed).
fn remove_op(dag: &mut RankDag, id: OpId) {
    let prevs: Vec<OpId> = dag.arena[id].prev.iter().copied().collect();
    let nexts: Vec<OpId> = dag.arena[id].next.iter().copied().collect();
    for &p in &prevs {
        dag.arena[p].next.remove(&id);
        for &n in &nexts {
            dag.arena[p].next.insert(n);
        }
    }
    for &n in &nexts {
        dag.arena[n].prev.remove(&id);
        for &p in &prevs {
            dag.arena[n].prev.insert(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferName;
    use crate::op::ChunkRef;

    #[test]
    fn recv_then_send_fuses_into_recv_copy_send() {
        let mut dag = RankDag::new(2);
        let seed = ChunkRef::new(0, crate::buffer::BufferName::Input, 0, 1);
        dag.add_start(0, seed.clone());
        let mid = ChunkRef::new(1, BufferName::Scratch("s".into()), 0, 1);
        let rop = dag.add_recv(1, seed.clone(), mid.clone(), 0, 0, 3, 0);
        let out = ChunkRef::new(2, BufferName::Output, 0, 1);
        let sop = dag.add_send(1, mid, out, 1, 0, 3, 0);
        dag.op_mut(rop).next.insert(sop);
        dag.op_mut(sop).prev.insert(rop);

        optimize(&mut dag);

        assert_eq!(dag.op(rop).inst, Instruction::RecvCopySend);
        assert_eq!(dag.op(rop).dst, dag.op(sop).dst.clone());
    }
}
