//! Replication and final emission: turns a validated [`RankDag`] into the
//! typed [`Program`] artifact — the last stage still in scope here; its
//! serialization to a wire format is not.

use std::convert::TryFrom;

use crate::buffer::{BufferName, RankBuffers};
use crate::error::{CompileError, Rank, Result, TbId};
use crate::op::{ChunkRef, Instruction, OpId};
use crate::rank_dag::RankDag;

/// Which of the three wire protocols a program targets. Purely a tag
/// carried through to the emitted artifact; this crate does not interpret
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Simple,
    LL,
    LL128,
}

impl TryFrom<&str> for Protocol {
    type Error = CompileError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "Simple" => Ok(Protocol::Simple),
            "LL" => Ok(Protocol::LL),
            "LL128" => Ok(Protocol::LL128),
            other => Err(CompileError::UnknownProtocol(other.to_string())),
        }
    }
}

/// A buffer reference as it appears in the emitted program: the named
/// scratch distinction has already been erased into one global scratch
/// region with a baked-in offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitBuffer {
    Input,
    Output,
    Scratch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitRef {
    pub rank: Rank,
    pub buffer: EmitBuffer,
    pub index: u32,
    pub size: u32,
}

/// One row of an emitted threadblock's program. `depends` is at most one
/// `(threadblock id, step)` pair; ops that originally needed more than one
/// predecessor have the rest pushed onto preceding `nop` rows by
/// [`expand_and_prune`].
#[derive(Debug, Clone)]
pub struct EmitOp {
    pub inst: Instruction,
    pub src: Option<EmitRef>,
    pub dst: Option<EmitRef>,
    pub cnt: u32,
    pub depends: Option<(TbId, u32)>,
    /// Whether some other op, in this tb or another, waits on this one.
    pub has_dependents: bool,
}

#[derive(Debug, Clone)]
pub struct ProgramThreadblock {
    pub id: TbId,
    pub send: i32,
    pub recv: i32,
    pub channel: i32,
    pub ops: Vec<EmitOp>,
}

#[derive(Debug, Clone)]
pub struct Gpu {
    pub rank: Rank,
    pub input_chunks: u32,
    pub output_chunks: u32,
    pub scratch_chunks: u32,
    pub threadblocks: Vec<ProgramThreadblock>,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub collective: String,
    pub inplace: bool,
    pub protocol: Protocol,
    pub gpus: Vec<Gpu>,
}

/// One scheduled op, already lowered to global indices, pre-expansion.
struct PrunedOp {
    inst: Instruction,
    src: Option<EmitRef>,
    dst: Option<EmitRef>,
    cnt: u32,
    /// `(final instanced threadblock id, original step within it)`.
    depends: Vec<(TbId, u32)>,
}

struct ReplicatedTb {
    send: i32,
    recv: i32,
    channel: i32,
    ops: Vec<PrunedOp>,
}

fn lower_ref(buffers: &RankBuffers, r: &ChunkRef) -> EmitRef {
    match &r.buffer {
        BufferName::Input => EmitRef { rank: r.rank, buffer: EmitBuffer::Input, index: r.index, size: r.size },
        BufferName::Output => EmitRef { rank: r.rank, buffer: EmitBuffer::Output, index: r.index, size: r.size },
        BufferName::Scratch(name) => {
            let offset = buffers.scratch_offset(name).unwrap_or(0);
            EmitRef { rank: r.rank, buffer: EmitBuffer::Scratch, index: offset + r.index, size: r.size }
        },
    }
}

fn is_scratch(buffer: &BufferName) -> bool {
    !matches!(buffer, BufferName::Input | BufferName::Output)
}

/// Index within the (pre-replication) global buffer of size `size`,
/// for replica `i` of `instances`. Scratch buffers are always batched
/// (`i * instance_size + index`); input/output follow the caller's
/// `interleaved` choice.
fn replicated_index(
    buffers: &RankBuffers,
    r: &ChunkRef,
    instances: u32,
    interleaved: bool,
    i: u32,
) -> u32 {
    if is_scratch(&r.buffer) {
        let instance_len = buffers.scratch_instance_size(match &r.buffer {
            BufferName::Scratch(name) => name,
            _ => unreachable!(),
        });
        instance_len * i + r.index
    } else if interleaved {
        r.index * instances + i * r.size
    } else {
        let whole_len = match &r.buffer {
            BufferName::Input => buffers.input_len(),
            BufferName::Output => buffers.output_len(),
            _ => unreachable!(),
        };
        whole_len * i + r.index
    }
}

fn replicate_ref(buffers: &RankBuffers, r: &ChunkRef, instances: u32, interleaved: bool, i: u32) -> ChunkRef {
    let index = replicated_index(buffers, r, instances, interleaved, i);
    ChunkRef::new(r.rank, r.buffer.clone(), index, r.size)
}

/// Builds one [`ReplicatedTb`] per `(rank, original tb, instance)`, with
/// refs already rewritten to per-instance indices and global scratch
/// offsets, and dependencies resolved to the matching instance's
/// threadblock id. Instances never share an edge; dependency analysis
/// is simply repeated identically for each one.
fn replicate(
    dag: &RankDag,
    buffers: &[RankBuffers],
    instances: u32,
    interleaved: bool,
) -> Vec<Vec<ReplicatedTb>> {
    let mut per_rank: Vec<Vec<ReplicatedTb>> = Vec::with_capacity(dag.num_ranks() as usize);
    for rank in 0..dag.num_ranks() {
        let rank_buffers = &buffers[rank as usize];
        let orig_tbs = &dag.tbs[rank as usize];
        // Indexed so that original tb `t`, instance `i` lands at `t *
        // instances + i` — the same addressing `replicate_op` uses to
        // resolve a dependency's instanced threadblock id.
        let mut instanced: Vec<ReplicatedTb> = Vec::with_capacity(orig_tbs.len() * instances as usize);
        for tb in orig_tbs {
            for i in 0..instances {
                let mut ops = Vec::with_capacity(tb.ops.len());
                for &op_id in &tb.ops {
                    ops.push(replicate_op(dag, rank_buffers, op_id, instances, interleaved, i));
                }
                instanced.push(ReplicatedTb { send: tb.send, recv: tb.recv, channel: tb.channel, ops });
            }
        }
        per_rank.push(instanced);
    }
    per_rank
}

fn replicate_op(
    dag: &RankDag,
    buffers: &RankBuffers,
    op_id: OpId,
    instances: u32,
    interleaved: bool,
    i: u32,
) -> PrunedOp {
    let op = dag.op(op_id);
    let src = op.src.as_ref().map(|r| lower_ref(buffers, &replicate_ref(buffers, r, instances, interleaved, i)));
    let dst = op.dst.as_ref().map(|r| lower_ref(buffers, &replicate_ref(buffers, r, instances, interleaved, i)));
    let depends = op
        .depends
        .iter()
        .map(|&dep_id| {
            let dep = dag.op(dep_id);
            let final_tb = dep.tb as u32 * instances + i;
            (final_tb as TbId, dep.step as u32)
        })
        .collect();
    PrunedOp { inst: op.inst, src, dst, cnt: op.count(), depends }
}

/// Drops dependencies already implied by an earlier op in the same
/// threadblock (if op A at step 3 already waited on target T, any later
/// op in the same tb that also lists T is already ordered after it by
/// the tb's own sequential execution) and splits any op left with more
/// than one dependency into `nop` carriers plus a single real dependency,
/// returning the emitted ops alongside a map from this tb's original step
/// to its final index (needed by other tbs' dependency references).
fn expand_and_prune(ops: Vec<PrunedOp>) -> (Vec<EmitOp>, Vec<u32>) {
    let mut running = std::collections::HashSet::new();
    let mut pruned: Vec<PrunedOp> = Vec::with_capacity(ops.len());
    for mut op in ops {
        op.depends.retain(|d| running.insert(*d));
        pruned.push(op);
    }

    let mut expanded = Vec::with_capacity(pruned.len());
    let mut posmap = Vec::with_capacity(pruned.len());
    for op in pruned {
        let mut deps = op.depends;
        let primary = deps.pop();
        for extra in deps {
            expanded.push(EmitOp {
                inst: Instruction::Nop,
                src: None,
                dst: None,
                cnt: 0,
                depends: Some(extra),
                has_dependents: false,
            });
        }
        expanded.push(EmitOp {
            inst: op.inst,
            src: op.src,
            dst: op.dst,
            cnt: op.cnt,
            depends: primary,
            has_dependents: false,
        });
        posmap.push((expanded.len() - 1) as u32);
    }
    (expanded, posmap)
}

/// Runs [`expand_and_prune`] per threadblock, then rewrites every cross-tb
/// dependency to the target's final (post-expansion) step and marks
/// `has_dependents` on the targets, since dependencies never cross ranks
/// (every `prev` edge is built from the same rank's own slot chain).
fn finalize_rank(tbs: Vec<ReplicatedTb>) -> Vec<ProgramThreadblock> {
    let mut expanded_per_tb = Vec::with_capacity(tbs.len());
    let mut posmaps = Vec::with_capacity(tbs.len());
    let mut headers = Vec::with_capacity(tbs.len());
    for tb in tbs {
        headers.push((tb.send, tb.recv, tb.channel));
        let (expanded, posmap) = expand_and_prune(tb.ops);
        expanded_per_tb.push(expanded);
        posmaps.push(posmap);
    }

    let mut has_dependents: Vec<Vec<bool>> = expanded_per_tb.iter().map(|e| vec![false; e.len()]).collect();
    for ops in expanded_per_tb.iter_mut() {
        for op in ops.iter_mut() {
            if let Some((target_tb, orig_step)) = op.depends {
                let final_step = posmaps[target_tb as usize][orig_step as usize];
                op.depends = Some((target_tb, final_step));
                has_dependents[target_tb as usize][final_step as usize] = true;
            }
        }
    }

    expanded_per_tb
        .into_iter()
        .zip(has_dependents)
        .zip(headers)
        .enumerate()
        .map(|(id, ((mut ops, deps_hit), (send, recv, channel)))| {
            for (op, hit) in ops.iter_mut().zip(deps_hit) {
                op.has_dependents = hit;
            }
            ProgramThreadblock { id: id as TbId, send, recv, channel, ops }
        })
        .collect()
}

/// Runs the full replication + dependency-finalization pipeline and
/// assembles the typed [`Program`]. Must be called after
/// [`crate::validate::validate`].
pub fn emit(
    dag: &RankDag,
    buffers: &[RankBuffers],
    instances: u32,
    interleaved: bool,
    name: String,
    collective: String,
    inplace: bool,
    protocol: Protocol,
) -> Program {
    let replicated = replicate(dag, buffers, instances, interleaved);
    let mut gpus = Vec::with_capacity(dag.num_ranks() as usize);
    for (rank, tbs) in replicated.into_iter().enumerate() {
        let threadblocks = finalize_rank(tbs);
        let rank_buffers = &buffers[rank];
        gpus.push(Gpu {
            rank: rank as Rank,
            input_chunks: rank_buffers.input_len(),
            output_chunks: rank_buffers.output_len(),
            scratch_chunks: rank_buffers.scratch_names().map(|n| rank_buffers.scratch_instance_size(n)).sum::<u32>()
                * instances,
            threadblocks,
        });
    }
    Program { name, collective, inplace, protocol, gpus }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RankBuffers;

    #[test]
    fn protocol_parses_known_names() {
        assert_eq!(Protocol::try_from("LL128").unwrap(), Protocol::LL128);
        assert!(Protocol::try_from("bogus").is_err());
    }

    #[test]
    fn expand_and_prune_splits_multi_dependency_ops() {
        let ops = vec![
            PrunedOp { inst: Instruction::Copy, src: None, dst: None, cnt: 1, depends: vec![] },
            PrunedOp {
                inst: Instruction::Send,
                src: None,
                dst: None,
                cnt: 1,
                depends: vec![(0, 0), (1, 2)],
            },
        ];
        let (expanded, posmap) = expand_and_prune(ops);
        assert_eq!(expanded.len(), 3); // copy, nop(carrying first dep), send(carrying second dep)
        assert_eq!(expanded[1].inst, Instruction::Nop);
        assert_eq!(posmap.len(), 2);
        assert_eq!(posmap[1], 2);
    }

    #[test]
    fn redundant_dependency_is_pruned() {
        let ops = vec![
            PrunedOp { inst: Instruction::Copy, src: None, dst: None, cnt: 1, depends: vec![(0, 0)] },
            PrunedOp { inst: Instruction::Copy, src: None, dst: None, cnt: 1, depends: vec![(0, 0)] },
        ];
        let (expanded, _) = expand_and_prune(ops);
        assert!(expanded[0].depends.is_some());
        assert!(expanded[1].depends.is_none());
    }

    #[test]
    fn scratch_lowering_adds_global_offset() {
        let mut buffers = RankBuffers::new(0, 0);
        buffers.append_scratch_slab("a", 4);
        buffers.append_scratch_slab("b", 4);
        buffers.lower_scratch_layout(1);
        let r = ChunkRef::new(0, BufferName::Scratch("b".into()), 1, 1);
        let lowered = lower_ref(&buffers, &r);
        assert_eq!(lowered.buffer, EmitBuffer::Scratch);
        assert_eq!(lowered.index, 5);
    }
}
