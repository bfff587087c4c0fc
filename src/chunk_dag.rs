//! The chunk-level data-flow DAG, built as the front end's user script
//! executes, and its lowering to the rank DAG.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::chunk::{ChunkValue, ProvenanceKey};
use crate::error::{CompileError, Rank, Result};
use crate::op::ChunkRef;
use crate::rank_dag::RankDag;

pub type ChunkOpId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInstruction {
    Start,
    Send,
    Reduce,
}

/// A node in the chunk DAG: one data-movement step at the level of logical
/// chunks, before lowering to per-rank primitive instructions.
#[derive(Debug, Clone)]
pub struct ChunkOp {
    pub inst: ChunkInstruction,
    pub src: Option<ChunkRef>,
    pub dst: ChunkRef,
    pub sendtb: i32,
    pub recvtb: i32,
    pub ch: i32,
    pub steps_from_start: i64,
    pub steps_to_end: i64,
    pub prev: Vec<ChunkOpId>,
    pub next: Vec<ChunkOpId>,
}

pub struct ChunkDag {
    arena: Vec<ChunkOp>,
    chunk_paths: HashMap<ProvenanceKey, ChunkOpId>,
    next_reduce_id: u64,
}

impl ChunkDag {
    pub fn new() -> Self {
        ChunkDag { arena: Vec::new(), chunk_paths: HashMap::new(), next_reduce_id: 0 }
    }

    /// Hands out a fresh identity for a newly-created [`crate::chunk::ReduceChunk`]
    /// so it can be tracked in `chunk_paths` distinctly from any other
    /// reduce result with the same membership.
    pub fn fresh_reduce_id(&mut self) -> u64 {
        let id = self.next_reduce_id;
        self.next_reduce_id += 1;
        id
    }

    /// One `start` op per seeded input chunk.
    pub fn init_chunk(&mut self, value: &ChunkValue, dst: ChunkRef) {
        let id = self.arena.len();
        self.arena.push(ChunkOp {
            inst: ChunkInstruction::Start,
            src: None,
            dst,
            sendtb: -1,
            recvtb: -1,
            ch: -1,
            steps_from_start: -1,
            steps_to_end: -1,
            prev: Vec::new(),
            next: Vec::new(),
        });
        self.chunk_paths.insert(value.provenance_key(), id);
    }

    /// Walks forward from the op that produced `value`, through its `next`
    /// chain, to find the one whose `dst` overlaps `at` — i.e. the most
    /// recent place this chunk was copied to. Visited tracking bounds the
    /// walk in diamond subgraphs; since the chunk DAG is acyclic this only
    /// changes how much redundant work is done, never the result.
    fn find_prev_op(&self, value: &ChunkValue, at: &ChunkRef) -> Option<ChunkOpId> {
        let root = *self.chunk_paths.get(&value.provenance_key())?;
        let mut frontier = vec![root];
        let mut visited = HashSet::new();
        let mut found = None;
        while let Some(id) = frontier.pop() {
            if !visited.insert(id) {
                continue;
            }
            let op = &self.arena[id];
            if op.dst.overlaps(at) {
                found = Some(id);
            }
            frontier.extend(op.next.iter().copied());
        }
        found
    }

    pub fn add_send(
        &mut self,
        chunks: &[ChunkValue],
        src: ChunkRef,
        dst: ChunkRef,
        sendtb: i32,
        recvtb: i32,
        ch: i32,
    ) -> Result<ChunkOpId> {
        let mut prev_ops = Vec::new();
        let mut steps_from_start = 0i64;
        for chunk in chunks {
            let prev_id = self.find_prev_op(chunk, &src).ok_or_else(|| unreachable_slot(&src))?;
            steps_from_start = steps_from_start.max(self.arena[prev_id].steps_from_start);
            prev_ops.push(prev_id);
        }
        let id = self.arena.len();
        self.arena.push(ChunkOp {
            inst: ChunkInstruction::Send,
            src: Some(src),
            dst,
            sendtb,
            recvtb,
            ch,
            steps_from_start: steps_from_start + 1,
            steps_to_end: -1,
            prev: prev_ops.clone(),
            next: Vec::new(),
        });
        for prev_id in prev_ops {
            self.arena[prev_id].next.push(id);
        }
        Ok(id)
    }

    pub fn add_reduce(
        &mut self,
        src_chunks: &[ChunkValue],
        dst_chunks: &[ChunkValue],
        result_values: &[ChunkValue],
        src: ChunkRef,
        dst: ChunkRef,
        sendtb: i32,
        recvtb: i32,
        ch: i32,
    ) -> Result<ChunkOpId> {
        let mut prev_ops = Vec::new();
        let mut steps_from_start = 0i64;
        for (src_chunk, dst_chunk) in src_chunks.iter().zip(dst_chunks.iter()) {
            let prev_src = self.find_prev_op(src_chunk, &src).ok_or_else(|| unreachable_slot(&src))?;
            let prev_dst = self.find_prev_op(dst_chunk, &dst).ok_or_else(|| unreachable_slot(&dst))?;
            steps_from_start =
                steps_from_start.max(self.arena[prev_src].steps_from_start).max(self.arena[prev_dst].steps_from_start);
            prev_ops.push(prev_src);
            prev_ops.push(prev_dst);
        }
        let id = self.arena.len();
        self.arena.push(ChunkOp {
            inst: ChunkInstruction::Reduce,
            src: Some(src),
            dst,
            sendtb,
            recvtb,
            ch,
            steps_from_start: steps_from_start + 1,
            steps_to_end: -1,
            prev: prev_ops.clone(),
            next: Vec::new(),
        });
        for prev_id in prev_ops {
            self.arena[prev_id].next.push(id);
        }
        for result in result_values {
            self.chunk_paths.insert(result.provenance_key(), id);
        }
        Ok(id)
    }

    /// Depth-first: `steps_to_end = 0` at leaves, else `1 + max(children)`.
    /// Must be called once, after the script finishes issuing sends/reduces
    /// and before [`ChunkDag::lower_rank_dag`].
    pub fn complete_metadata(&mut self) {
        let roots: Vec<ChunkOpId> = self
            .chunk_paths
            .values()
            .copied()
            .filter(|&id| self.arena[id].inst == ChunkInstruction::Start)
            .collect();
        let mut memo = HashMap::new();
        for root in roots {
            self.steps_to_end(root, &mut memo);
        }
        for (id, v) in memo {
            self.arena[id].steps_to_end = v;
        }
    }

    fn steps_to_end(&self, id: ChunkOpId, memo: &mut HashMap<ChunkOpId, i64>) -> i64 {
        if let Some(&v) = memo.get(&id) {
            return v;
        }
        let next = self.arena[id].next.clone();
        let value = if next.is_empty() {
            0
        } else {
            next.iter().map(|&n| 1 + self.steps_to_end(n, memo)).max().unwrap_or(0)
        };
        memo.insert(id, value);
        value
    }

    /// Traverses the chunk DAG in topological order using a min-heap keyed
    /// by `steps_from_start` (ties broken by arena insertion order, for
    /// reproducible compilation), lowering each [`ChunkOp`] to its rank-DAG
    /// counterpart.
    pub fn lower_rank_dag(&mut self, rank_dag: &mut RankDag) -> Result<()> {
        let mut heap: BinaryHeap<Reverse<(i64, ChunkOpId)>> = BinaryHeap::new();
        for (id, op) in self.arena.iter().enumerate() {
            if op.prev.is_empty() {
                heap.push(Reverse((op.steps_from_start, id)));
            }
        }

        let mut visited = HashSet::new();
        while let Some(Reverse((_, id))) = heap.pop() {
            if !visited.insert(id) {
                continue;
            }
            let op = self.arena[id].clone();
            match op.inst {
                ChunkInstruction::Start => {
                    rank_dag.add_start(op.dst.rank, op.dst.clone());
                },
                ChunkInstruction::Send => {
                    let src = op.src.clone().expect("send chunk op always has a src");
                    if src.rank == op.dst.rank {
                        rank_dag.add_copy(
                            src.rank,
                            src,
                            op.dst.clone(),
                            op.steps_from_start * 2,
                            op.steps_to_end * 2,
                            op.sendtb,
                        );
                    } else {
                        let sop = rank_dag.add_send(
                            src.rank,
                            src.clone(),
                            op.dst.clone(),
                            op.steps_from_start * 2,
                            op.steps_to_end * 2 + 1,
                            op.sendtb,
                            op.ch,
                        );
                        let rop = rank_dag.add_recv(
                            op.dst.rank,
                            src,
                            op.dst.clone(),
                            op.steps_from_start * 2 + 1,
                            op.steps_to_end * 2,
                            op.recvtb,
                            op.ch,
                        );
                        rank_dag.link_match(sop, rop);
                    }
                },
                ChunkInstruction::Reduce => {
                    let src = op.src.clone().expect("reduce chunk op always has a src");
                    if src.rank == op.dst.rank {
                        rank_dag.add_reduce(
                            src.rank,
                            src,
                            op.dst.clone(),
                            op.steps_from_start * 2,
                            op.steps_to_end * 2,
                            op.sendtb,
                        );
                    } else {
                        let sop = rank_dag.add_send(
                            src.rank,
                            src.clone(),
                            op.dst.clone(),
                            op.steps_from_start * 2,
                            op.steps_to_end * 2 + 1,
                            op.sendtb,
                            op.ch,
                        );
                        let rop = rank_dag.add_recv_reduce_copy(
                            op.dst.rank,
                            src,
                            op.dst.clone(),
                            op.steps_from_start * 2 + 1,
                            op.steps_to_end * 2,
                            op.recvtb,
                            op.ch,
                        );
                        rank_dag.link_match(sop, rop);
                    }
                },
            }
            for next_id in op.next {
                heap.push(Reverse((self.arena[next_id].steps_from_start, next_id)));
            }
        }
        Ok(())
    }
}

impl Default for ChunkDag {
    fn default() -> Self {
        Self::new()
    }
}

fn unreachable_slot(r: &ChunkRef) -> CompileError {
    CompileError::UnreachableSlot {
        rank: r.rank as Rank,
        buffer: r.buffer.clone(),
        index: r.index,
        inst: crate::op::Instruction::Start,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferName;
    use crate::chunk::Chunk;

    #[test]
    fn start_then_local_send_lowers_to_copy() {
        let mut dag = ChunkDag::new();
        let mut rank_dag = RankDag::new(1);
        let value = ChunkValue::Chunk(Chunk::new(0, 0));
        let r0 = ChunkRef::new(0, BufferName::Input, 0, 1);
        dag.init_chunk(&value, r0.clone());
        let r1 = ChunkRef::new(0, BufferName::Output, 0, 1);
        dag.add_send(&[value], r0, r1, -1, -1, -1).unwrap();
        dag.complete_metadata();
        dag.lower_rank_dag(&mut rank_dag).unwrap();
        assert_eq!(rank_dag.op_count(), 2); // start + copy
    }
}
