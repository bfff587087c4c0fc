//! Per-rank operation graph, built by lowering the chunk DAG.
//!
//! One [`RankDag`] tracks every rank's operations: nodes are primitive
//! [`Op`]s, edges are slot-based (buffer-index) read-after-write
//! dependencies. Ops are stored in a single arena and addressed by
//! [`OpId`] rather than `Rc`/`RefCell`, so the cyclic adjacency between
//! ops never needs reference-counted cycles.

pub mod dependencies;
pub mod fusion;

use std::collections::{HashMap, HashSet, VecDeque};

use crate::buffer::BufferName;
use crate::error::Rank;
use crate::op::{ChunkRef, Instruction, Op, OpId};
use crate::threadblock::Threadblock;

/// A single `(rank, buffer, index)` triple — re-exported here under the
/// name the rank DAG's own methods use it by.
pub type Slot = (Rank, BufferName, u32);

pub struct RankDag {
    pub(crate) num_ranks: u32,
    pub(crate) arena: Vec<Op>,
    /// slot -> the first op that ever referenced it (the root of its chain).
    operations: HashMap<Slot, OpId>,
    /// per-rank threadblock list; populated by threadblock assignment.
    pub(crate) tbs: Vec<Vec<Threadblock>>,
}

impl RankDag {
    pub fn new(num_ranks: u32) -> Self {
        RankDag {
            num_ranks,
            arena: Vec::new(),
            operations: HashMap::new(),
            tbs: (0..num_ranks).map(|_| Vec::new()).collect(),
        }
    }

    pub fn op_count(&self) -> usize {
        self.arena.len()
    }

    pub fn op(&self, id: OpId) -> &Op {
        &self.arena[id]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Op {
        &mut self.arena[id]
    }

    pub fn ops_len(&self) -> usize {
        self.arena.len()
    }

    fn new_op(&mut self, op: Op) -> OpId {
        let id = self.arena.len();
        self.arena.push(op);
        id
    }

    fn link(&mut self, prev: OpId, next: OpId) {
        if prev == next {
            return;
        }
        self.arena[prev].next.insert(next);
        self.arena[next].prev.insert(prev);
    }

    /// Records the cross-rank pairing between a send op and its matching
    /// recv-family op, bidirectionally: both `matched` lists reference
    /// each other (see `DESIGN.md`).
    pub fn link_match(&mut self, send: OpId, recv: OpId) {
        self.arena[send].matched.push(recv);
        self.arena[recv].matched.push(send);
    }

    fn slot_of(rank: Rank, buffer: &BufferName, index: u32) -> Slot {
        (rank, buffer.clone(), index)
    }

    fn register_root(&mut self, slot: Slot, id: OpId) {
        self.operations.entry(slot).or_insert(id);
    }

    fn slot_exists(&self, slot: &Slot) -> bool {
        self.operations.contains_key(slot)
    }

    /// An op writes the slot iff its destination range contains it (see
    /// `DESIGN.md` for why this differs from a naive index comparison).
    fn writes_to_slot(op: &Op, rank: Rank, buffer: &BufferName, index: u32) -> bool {
        match op.inst {
            Instruction::Copy | Instruction::Reduce => op
                .dst
                .as_ref()
                .map(|d| d.contains_slot(rank, buffer, index))
                .unwrap_or(false),
            _ => op.inst != Instruction::Send,
        }
    }

    /// DFS seeking a leaf that writes `slot`, falling back to an internal
    /// writer with no writing descendants. Memoized per call since the
    /// rank DAG can have diamond subgraphs; the memo changes nothing
    /// about the result (it is a pure function of the subtree) but
    /// avoids exponential re-walks.
    fn find_last_recv(&self, slot: &Slot) -> OpId {
        let root = self.operations[slot];
        let mut memo: HashMap<OpId, (bool, OpId)> = HashMap::new();
        self.find_last_recv_rec(slot, root, &mut memo).1
    }

    fn find_last_recv_rec(&self, slot: &Slot, id: OpId, memo: &mut HashMap<OpId, (bool, OpId)>) -> (bool, OpId) {
        if let Some(&cached) = memo.get(&id) {
            return cached;
        }
        let op = &self.arena[id];
        let result = if op.next.is_empty() {
            (Self::writes_to_slot(op, slot.0, &slot.1, slot.2), id)
        } else {
            let mut any_child_last = false;
            let mut found = None;
            for &child in &op.next {
                let (is_last, rop) = self.find_last_recv_rec(slot, child, memo);
                if is_last {
                    found = Some((true, rop));
                    break;
                }
                any_child_last = any_child_last || is_last;
            }
            found.unwrap_or_else(|| {
                if Self::writes_to_slot(op, slot.0, &slot.1, slot.2) && !any_child_last {
                    (true, id)
                } else {
                    (false, id)
                }
            })
        };
        memo.insert(id, result);
        result
    }

    /// BFS over `next` to every leaf reachable from `slot`'s root op (spec
    /// §4.4 `find_last_ops`; "there may be multiple as sends can happen in
    /// parallel"). Visited tracking added on top of the original (see
    /// `find_prev_op` in `chunk_dag.rs` for the same rationale).
    fn find_last_ops(&self, slot: &Slot) -> Vec<OpId> {
        let root = self.operations[slot];
        let mut frontier = VecDeque::from([root]);
        let mut visited = HashSet::new();
        let mut last_ops = Vec::new();
        while let Some(id) = frontier.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let op = &self.arena[id];
            if op.next.is_empty() {
                last_ops.push(id);
            } else {
                frontier.extend(op.next.iter().copied());
            }
        }
        last_ops
    }

    pub fn add_start(&mut self, rank: Rank, dst: ChunkRef) -> OpId {
        let id = self.new_op(Op::new(Instruction::Start, rank, Some(dst.clone()), Some(dst.clone())));
        for index in dst.slots() {
            self.register_root(Self::slot_of(rank, &dst.buffer, index), id);
        }
        id
    }

    fn link_src_range(&mut self, rank: Rank, buffer: &BufferName, index: u32, size: u32, op_id: OpId) {
        for i in index..index + size {
            let slot = Self::slot_of(rank, buffer, i);
            let prev = self.find_last_recv(&slot);
            self.link(prev, op_id);
        }
    }

    /// Links destination-range predecessors for an op that *creates* a new
    /// value at `dst` rather than reading it (send/recv/recv_reduce_copy):
    /// every current leaf touching the range becomes a predecessor, or (if
    /// the slot is unseen) this op becomes its root.
    fn link_dst_range_fresh(&mut self, rank: Rank, buffer: &BufferName, index: u32, size: u32, op_id: OpId) {
        let mut prevs = HashSet::new();
        for i in index..index + size {
            let slot = Self::slot_of(rank, buffer, i);
            if self.slot_exists(&slot) {
                prevs.extend(self.find_last_ops(&slot));
            } else {
                self.register_root(slot, op_id);
            }
        }
        for prev in prevs {
            self.link(prev, op_id);
        }
    }

    /// Same idea, but for ops that *combine* with an existing occupant
    /// (copy/local-reduce): both the "could this slot already exist" branch
    /// and the fresh-slot branch are exercised, matching `add_copy`/
    /// `add_reduce` in the original (whose set/list mismatch on the dst
    /// side is treated here as the evident bug it looks like — see
    /// `DESIGN.md` — and fixed by flattening the same way `add_reduce`
    /// already did it correctly).
    fn link_dst_range_combine(&mut self, rank: Rank, buffer: &BufferName, index: u32, size: u32, op_id: OpId) {
        self.link_dst_range_fresh(rank, buffer, index, size, op_id)
    }

    pub fn add_copy(&mut self, rank: Rank, send_ref: ChunkRef, recv_ref: ChunkRef, step: i64, priority: i64, tb: i32) -> OpId {
        let mut op = Op::new(Instruction::Copy, rank, Some(send_ref.clone()), Some(recv_ref.clone()));
        op.chunk_step = step;
        op.priority = priority;
        op.tb = tb;
        let id = self.new_op(op);
        self.link_src_range(rank, &send_ref.buffer, send_ref.index, send_ref.size, id);
        self.link_dst_range_combine(rank, &recv_ref.buffer, recv_ref.index, recv_ref.size, id);
        id
    }

    pub fn add_reduce(&mut self, rank: Rank, send_ref: ChunkRef, recv_ref: ChunkRef, step: i64, priority: i64, tb: i32) -> OpId {
        let mut op = Op::new(Instruction::Reduce, rank, Some(send_ref.clone()), Some(recv_ref.clone()));
        op.chunk_step = step;
        op.priority = priority;
        op.tb = tb;
        let id = self.new_op(op);
        self.link_src_range(rank, &send_ref.buffer, send_ref.index, send_ref.size, id);
        self.link_dst_range_combine(rank, &recv_ref.buffer, recv_ref.index, recv_ref.size, id);
        id
    }

    pub fn add_send(
        &mut self,
        rank: Rank,
        send_ref: ChunkRef,
        recv_ref: ChunkRef,
        step: i64,
        priority: i64,
        tb: i32,
        ch: i32,
    ) -> OpId {
        let mut op = Op::new(Instruction::Send, rank, Some(send_ref.clone()), Some(recv_ref));
        op.chunk_step = step;
        op.priority = priority;
        op.tb = tb;
        op.channel = ch;
        let id = self.new_op(op);
        self.link_src_range(rank, &send_ref.buffer, send_ref.index, send_ref.size, id);
        id
    }

    pub fn add_recv(
        &mut self,
        rank: Rank,
        send_ref: ChunkRef,
        recv_ref: ChunkRef,
        step: i64,
        priority: i64,
        tb: i32,
        ch: i32,
    ) -> OpId {
        let mut op = Op::new(Instruction::Recv, rank, Some(send_ref), Some(recv_ref.clone()));
        op.chunk_step = step;
        op.priority = priority;
        op.tb = tb;
        op.channel = ch;
        let id = self.new_op(op);
        self.link_dst_range_fresh(rank, &recv_ref.buffer, recv_ref.index, recv_ref.size, id);
        id
    }

    pub fn add_recv_reduce_copy(
        &mut self,
        rank: Rank,
        send_ref: ChunkRef,
        recv_ref: ChunkRef,
        step: i64,
        priority: i64,
        tb: i32,
        ch: i32,
    ) -> OpId {
        let mut op = Op::new(Instruction::RecvReduceCopy, rank, Some(send_ref), Some(recv_ref.clone()));
        op.chunk_step = step;
        op.priority = priority;
        op.tb = tb;
        op.channel = ch;
        let id = self.new_op(op);
        self.link_dst_range_fresh(rank, &recv_ref.buffer, recv_ref.index, recv_ref.size, id);
        id
    }

    pub fn num_ranks(&self) -> u32 {
        self.num_ranks
    }

    pub fn all_op_ids(&self) -> impl Iterator<Item = OpId> {
        0..self.arena.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferName;

    fn rf(rank: Rank, buf: BufferName, index: u32, size: u32) -> ChunkRef {
        ChunkRef::new(rank, buf, index, size)
    }

    #[test]
    fn send_then_recv_are_matched_bidirectionally() {
        let mut dag = RankDag::new(2);
        let start = rf(0, BufferName::Input, 0, 1);
        dag.add_start(0, start.clone());
        let dst = rf(1, BufferName::Output, 0, 1);
        let sop = dag.add_send(0, start.clone(), dst.clone(), 0, 1, -1, -1);
        let rop = dag.add_recv(1, start, dst, 1, 0, -1, -1);
        dag.link_match(sop, rop);
        assert_eq!(dag.op(sop).matched, vec![rop]);
        assert_eq!(dag.op(rop).matched, vec![sop]);
    }

    #[test]
    fn recv_creates_raw_edge_from_prior_writer() {
        let mut dag = RankDag::new(1);
        let r = rf(0, BufferName::Output, 0, 1);
        let id1 = dag.add_recv(0, rf(0, BufferName::Input, 0, 1), r.clone(), 0, 0, -1, -1);
        let id2 = dag.add_recv(0, rf(0, BufferName::Input, 1, 1), r, 2, 0, -1, -1);
        assert!(dag.op(id1).next.contains(&id2));
        assert!(dag.op(id2).prev.contains(&id1));
    }
}
