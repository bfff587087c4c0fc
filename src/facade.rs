//! The front end: the script-facing chunk-ref operations and the ambient
//! program under construction.
//!
//! A program is built by calling [`begin_program`], issuing a sequence of
//! [`split`], [`group`], [`send`] and [`reduce`] calls against the
//! [`ChunkRef`]s they return, then [`end_program`] to run the full
//! lowering pipeline and get back a [`Program`]. Exactly one program can
//! be under construction per thread at a time — the binding lives in a
//! `thread_local!`, a statically-typed stand-in for a single process-wide
//! "current program".

use std::cell::RefCell;
use std::convert::TryFrom;

use log::{debug, info, warn};

use crate::buffer::{check_in_range, BufferName, RankBuffers};
use crate::chunk::{Chunk, ChunkValue};
use crate::chunk_dag::ChunkDag;
use crate::collective::Collective;
use crate::error::{CompileError, Rank, Result};
use crate::op::ChunkRef;
use crate::program::{self, Program, Protocol};
use crate::rank_dag::{dependencies, fusion, RankDag};
use crate::threadblock;
use crate::topology::Topology;
use crate::validate;

struct ActiveProgram {
    name: String,
    collective_name: String,
    inplace: bool,
    protocol: Protocol,
    buffers: Vec<RankBuffers>,
    chunk_dag: ChunkDag,
    instances: u32,
    interleaved: bool,
    links: Vec<Vec<bool>>,
}

thread_local! {
    static CURRENT: RefCell<Option<ActiveProgram>> = const { RefCell::new(None) };
}

/// Starts a new program: seeds every rank's input buffer from `collective`
/// and records a `start` chunk-DAG op for each seeded chunk. Fails with
/// [`CompileError::NestedProgramRegion`] if a program is already under
/// construction on this thread.
pub fn begin_program(
    name: impl Into<String>,
    protocol: &str,
    inplace: bool,
    instances: u32,
    interleaved: bool,
    topology: &dyn Topology,
    collective: &dyn Collective,
) -> Result<()> {
    let name = name.into();
    let protocol = Protocol::try_from(protocol)?;
    let num_ranks = topology.num_ranks();
    let sizes = collective.init_buffers(num_ranks);

    let mut buffers: Vec<RankBuffers> = sizes.iter().map(|&(i, o)| RankBuffers::new(i, o)).collect();
    let mut chunk_dag = ChunkDag::new();
    for rank in 0..num_ranks {
        let rb = &mut buffers[rank as usize];
        for index in 0..rb.input_len() {
            let value = ChunkValue::Chunk(Chunk::new(rank, index));
            rb.seed_input(index, value.clone());
            chunk_dag.init_chunk(&value, ChunkRef::new(rank, BufferName::Input, index, 1));
        }
    }

    let links: Vec<Vec<bool>> =
        (0..num_ranks).map(|src| (0..num_ranks).map(|dst| topology.has_link(src, dst)).collect()).collect();

    info!("starting program '{}' for collective '{}' over {} ranks", name, collective.name(), num_ranks);
    CURRENT.with(|cell| {
        if cell.borrow().is_some() {
            return Err(CompileError::NestedProgramRegion);
        }
        *cell.borrow_mut() = Some(ActiveProgram {
            name,
            collective_name: collective.name().to_string(),
            inplace,
            protocol,
            buffers,
            chunk_dag,
            instances,
            interleaved,
            links,
        });
        Ok(())
    })
}

/// Runs chunk-DAG completion, rank-DAG lowering, fusion, threadblock
/// assignment, dependency inference, validation and replication, in that
/// order, and returns the emitted [`Program`].
pub fn end_program() -> Result<Program> {
    let active = CURRENT.with(|cell| cell.borrow_mut().take()).ok_or(CompileError::NoActiveProgram)?;
    let ActiveProgram { name, collective_name, inplace, protocol, mut buffers, mut chunk_dag, instances, interleaved, .. } =
        active;
    let num_ranks = buffers.len() as u32;

    debug!("completing chunk-dag metadata for '{}'", name);
    chunk_dag.complete_metadata();

    let mut rank_dag = RankDag::new(num_ranks);
    chunk_dag.lower_rank_dag(&mut rank_dag)?;

    debug!("running peephole fusion");
    fusion::optimize(&mut rank_dag);

    debug!("assigning threadblocks");
    threadblock::assign_threadblocks(&mut rank_dag)?;

    debug!("inferring cross-threadblock dependencies");
    dependencies::infer_dependencies(&mut rank_dag);

    for rb in &mut buffers {
        rb.lower_scratch_layout(instances);
    }

    validate::validate(&rank_dag)?;

    info!("emitting program '{}' ({} ranks, {} instance(s))", name, num_ranks, instances);
    Ok(program::emit(&rank_dag, &buffers, instances, interleaved, name, collective_name, inplace, protocol))
}

/// Checks `program` against `collective`'s correctness oracle, logging a
/// warning (not an error) if it fails — the oracle answers "does this
/// schedule actually implement the collective", a question orthogonal to
/// whether the schedule is structurally well-formed.
pub fn check_program(program: &Program, collective: &dyn Collective) -> bool {
    let ok = collective.check(program);
    if !ok {
        warn!("program '{}' failed the '{}' correctness oracle", program.name, collective.name());
    }
    ok
}

/// Allocates `size` fresh scratch slots on `rank` in buffer `name` and
/// returns a ref to them.
pub fn alloc_scratch(rank: Rank, name: &str, size: u32) -> Result<ChunkRef> {
    with_active(|active| {
        let rb = &mut active.buffers[rank as usize];
        rb.ensure_scratch(name);
        let index = rb.append_scratch_slab(name, size);
        Ok(ChunkRef::new(rank, BufferName::Scratch(name.to_string()), index, size))
    })
}

/// Splits `r` into `parts` equally-sized, contiguous sub-refs.
pub fn split(r: &ChunkRef, parts: u32) -> Result<Vec<ChunkRef>> {
    if parts == 0 || r.size % parts != 0 {
        return Err(CompileError::NotDivisible { size: r.size, parts });
    }
    let part_size = r.size / parts;
    Ok((0..parts).map(|i| ChunkRef::new(r.rank, r.buffer.clone(), r.index + i * part_size, part_size)).collect())
}

/// Returns a ref spanning the union of same-rank, same-buffer refs.
/// Members need not be contiguous or given in order — the result simply
/// covers `[min(index), max(index+size))`; any slots in that span nobody
/// ever wrote are left unpopulated and cause a later [`send`]/[`reduce`]
/// over them to fail with [`CompileError::MissingSlots`], rather than
/// failing here.
pub fn group(refs: &[ChunkRef]) -> Result<ChunkRef> {
    let first = refs.first().expect("group() requires at least one ref");
    let mut start = first.index;
    let mut end = first.end();
    for r in refs {
        if r.rank != first.rank {
            return Err(CompileError::GroupRankMismatch { a: first.rank, b: r.rank });
        }
        if r.buffer != first.buffer {
            return Err(CompileError::GroupBufferMismatch { rank: first.rank, a: first.buffer.clone(), b: r.buffer.clone() });
        }
        start = start.min(r.index);
        end = end.max(r.end());
    }
    Ok(ChunkRef::new(first.rank, first.buffer.clone(), start, end - start))
}

/// Moves the chunks at `src` to `dst`, recording the move in the chunk
/// DAG. `dst.rank == src.rank` lowers to a local copy; otherwise to a
/// send/recv pair. Fails with [`CompileError::NoLink`] if the topology
/// passed to [`begin_program`] has no link between the two ranks.
pub fn send(src: &ChunkRef, dst: &ChunkRef, sendtb: i32, recvtb: i32, channel: i32) -> Result<ChunkRef> {
    with_active(|active| {
        if src.rank != dst.rank && !active.links[src.rank as usize][dst.rank as usize] {
            return Err(CompileError::NoLink { src: src.rank, dst: dst.rank });
        }
        check_in_range(&active.buffers[src.rank as usize], src.rank, &src.buffer, src.index, src.size)?;
        check_in_range(&active.buffers[dst.rank as usize], dst.rank, &dst.buffer, dst.index, dst.size)?;

        let missing = active.buffers[src.rank as usize].missing_in_range(&src.buffer, src.index, src.size);
        if !missing.is_empty() {
            return Err(CompileError::MissingSlots { r: src.clone(), count: missing.len() });
        }
        let values: Vec<ChunkValue> =
            src.slots().map(|i| active.buffers[src.rank as usize].get(&src.buffer, i).cloned().unwrap()).collect();

        active.chunk_dag.add_send(&values, src.clone(), dst.clone(), sendtb, recvtb, channel)?;
        for (i, value) in values.into_iter().enumerate() {
            active.buffers[dst.rank as usize].set(&dst.buffer, dst.index + i as u32, value)?;
        }
        Ok(dst.clone())
    })
}

/// Reduces the chunks currently at `src` into the chunks currently at
/// `dst` (which must already hold a value — reduce always combines with
/// an existing occupant), recording the combination in the chunk DAG.
pub fn reduce(src: &ChunkRef, dst: &ChunkRef, sendtb: i32, recvtb: i32, channel: i32) -> Result<ChunkRef> {
    with_active(|active| {
        if src.rank != dst.rank && !active.links[src.rank as usize][dst.rank as usize] {
            return Err(CompileError::NoLink { src: src.rank, dst: dst.rank });
        }
        let src_missing = active.buffers[src.rank as usize].missing_in_range(&src.buffer, src.index, src.size);
        if !src_missing.is_empty() {
            return Err(CompileError::MissingSlots { r: src.clone(), count: src_missing.len() });
        }
        let dst_missing = active.buffers[dst.rank as usize].missing_in_range(&dst.buffer, dst.index, dst.size);
        if !dst_missing.is_empty() {
            return Err(CompileError::MissingSlots { r: dst.clone(), count: dst_missing.len() });
        }

        let src_values: Vec<ChunkValue> =
            src.slots().map(|i| active.buffers[src.rank as usize].get(&src.buffer, i).cloned().unwrap()).collect();
        let dst_values: Vec<ChunkValue> =
            dst.slots().map(|i| active.buffers[dst.rank as usize].get(&dst.buffer, i).cloned().unwrap()).collect();

        let mut results = Vec::with_capacity(src_values.len());
        for (s, d) in src_values.iter().zip(dst_values.iter()) {
            let id = active.chunk_dag.fresh_reduce_id();
            results.push(d.clone().reduce(s.clone(), id));
        }

        active.chunk_dag.add_reduce(&src_values, &dst_values, &results, src.clone(), dst.clone(), sendtb, recvtb, channel)?;
        for (i, value) in results.into_iter().enumerate() {
            active.buffers[dst.rank as usize].set(&dst.buffer, dst.index + i as u32, value)?;
        }
        Ok(dst.clone())
    })
}

/// The rank that originally produced the single chunk at `r`; `None` for
/// a multi-chunk range, an empty slot, or a reduce result.
pub fn origin_rank(r: &ChunkRef) -> Option<Rank> {
    peek(r, ChunkValue::origin_rank)
}

pub fn origin_index(r: &ChunkRef) -> Option<u32> {
    peek(r, ChunkValue::origin_index)
}

pub fn dst_rank(r: &ChunkRef) -> Option<Rank> {
    peek(r, ChunkValue::dst_rank)
}

pub fn dst_index(r: &ChunkRef) -> Option<u32> {
    peek(r, ChunkValue::dst_index)
}

fn peek<T>(r: &ChunkRef, f: impl FnOnce(&ChunkValue) -> Option<T>) -> Option<T> {
    CURRENT.with(|cell| {
        let guard = cell.borrow();
        let active = guard.as_ref()?;
        active.buffers[r.rank as usize].get(&r.buffer, r.index).and_then(f)
    })
}

fn with_active<T>(f: impl FnOnce(&mut ActiveProgram) -> Result<T>) -> Result<T> {
    CURRENT.with(|cell| {
        let mut guard = cell.borrow_mut();
        let active = guard.as_mut().ok_or(CompileError::NoActiveProgram)?;
        f(active)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FullyConnected, TrivialCollective};

    #[test]
    fn split_then_group_roundtrips() {
        let topo = FullyConnected::new(2, 1);
        let coll = TrivialCollective { chunks_per_rank: 4 };
        begin_program("t", "Simple", false, 1, false, &topo, &coll).unwrap();
        let whole = ChunkRef::new(0, BufferName::Input, 0, 4);
        let parts = split(&whole, 2).unwrap();
        let rejoined = group(&parts).unwrap();
        assert_eq!(rejoined, whole);
        end_program().unwrap();
    }

    #[test]
    fn nested_begin_program_is_rejected() {
        let topo = FullyConnected::new(1, 1);
        let coll = TrivialCollective { chunks_per_rank: 1 };
        begin_program("a", "Simple", false, 1, false, &topo, &coll).unwrap();
        let err = begin_program("b", "Simple", false, 1, false, &topo, &coll).unwrap_err();
        assert_eq!(err, CompileError::NestedProgramRegion);
        end_program().unwrap();
    }

    #[test]
    fn send_without_link_is_rejected() {
        struct Disconnected;
        impl Topology for Disconnected {
            fn num_ranks(&self) -> u32 {
                2
            }
            fn has_link(&self, src: Rank, dst: Rank) -> bool {
                src == dst
            }
            fn num_channels(&self, src: Rank, dst: Rank) -> u32 {
                if self.has_link(src, dst) {
                    1
                } else {
                    0
                }
            }
        }
        let coll = TrivialCollective { chunks_per_rank: 1 };
        begin_program("t", "Simple", false, 1, false, &Disconnected, &coll).unwrap();
        let src = ChunkRef::new(0, BufferName::Input, 0, 1);
        let dst = ChunkRef::new(1, BufferName::Output, 0, 1);
        let err = send(&src, &dst, -1, -1, -1).unwrap_err();
        assert_eq!(err, CompileError::NoLink { src: 0, dst: 1 });
        end_program().unwrap();
    }
}
