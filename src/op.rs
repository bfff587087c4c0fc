//! Primitive scheduled operations and the addressable ranges ([`ChunkRef`])
//! they read and write.
//!
//! `prev`/`next`/`match`/`depends` are sets of arena indices (`OpId`), not
//! owned references, so that the rank DAG's cyclic adjacency can be
//! modeled without a cycle of `Rc`/`RefCell`.

use std::collections::BTreeSet;

use crate::buffer::BufferName;
use crate::error::{Rank, TbId};

/// Index of an [`Op`] inside a [`crate::rank_dag::RankDag`]'s arena. Stable
/// for the lifetime of the arena; never reused.
pub type OpId = usize;

/// Primitive instruction kinds (short codes in parens, used by the
/// emitted artifact).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instruction {
    /// `nop` — a dependency-carrier row with no effect, inserted by
    /// [`crate::rank_dag::dependencies::expand_multi_deps`].
    Nop,
    /// `st` — phantom root marking where a chunk was seeded.
    Start,
    /// `s`
    Send,
    /// `r`
    Recv,
    /// `cpy`
    Copy,
    /// `re`
    Reduce,
    /// `rcs`
    RecvCopySend,
    /// `rrs`
    RecvReduceSend,
    /// `rrc`
    RecvReduceCopy,
    /// `rrcs`
    RecvReduceCopySend,
    /// `d`
    Delete,
}

impl Instruction {
    /// Short code used by the emitted artifact; kept here since it is a
    /// property of the instruction kind, not of serialization.
    pub fn short_code(self) -> &'static str {
        match self {
            Instruction::Nop => "nop",
            Instruction::Start => "st",
            Instruction::Send => "s",
            Instruction::Recv => "r",
            Instruction::Copy => "cpy",
            Instruction::Reduce => "re",
            Instruction::RecvCopySend => "rcs",
            Instruction::RecvReduceSend => "rrs",
            Instruction::RecvReduceCopy => "rrc",
            Instruction::RecvReduceCopySend => "rrcs",
            Instruction::Delete => "d",
        }
    }

    pub fn is_send(self) -> bool {
        matches!(
            self,
            Instruction::Send
                | Instruction::RecvReduceCopySend
                | Instruction::RecvCopySend
                | Instruction::RecvReduceSend
        )
    }

    pub fn is_recv(self) -> bool {
        matches!(
            self,
            Instruction::Recv
                | Instruction::RecvReduceCopy
                | Instruction::RecvReduceCopySend
                | Instruction::RecvCopySend
                | Instruction::RecvReduceSend
        )
    }

    /// Whether this instruction's `src` lives on the executing rank.
    pub fn local_src(self) -> bool {
        matches!(self, Instruction::Send | Instruction::Copy | Instruction::Reduce)
    }

    /// Whether this instruction's `dst` lives on the executing rank.
    pub fn local_dst(self) -> bool {
        matches!(
            self,
            Instruction::Recv
                | Instruction::RecvCopySend
                | Instruction::RecvReduceSend
                | Instruction::RecvReduceCopy
                | Instruction::Copy
                | Instruction::Reduce
                | Instruction::RecvReduceCopySend
        )
    }
}

/// An addressable range of consecutive slots: `(rank, buffer, index, size)`.
/// Values, not owners — they are created by `get_ref` and passed around.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkRef {
    pub rank: Rank,
    pub buffer: BufferName,
    pub index: u32,
    pub size: u32,
}

impl ChunkRef {
    pub fn new(rank: Rank, buffer: BufferName, index: u32, size: u32) -> Self {
        ChunkRef { rank, buffer, index, size }
    }

    pub fn end(&self) -> u32 {
        self.index + self.size
    }

    pub fn slots(&self) -> impl Iterator<Item = u32> {
        self.index..self.end()
    }

    fn same_location(&self, other: &ChunkRef) -> bool {
        self.rank == other.rank && self.buffer == other.buffer
    }

    /// True iff one ref's index range contains the other's, at the same
    /// `(rank, buffer)`.
    pub fn overlaps(&self, other: &ChunkRef) -> bool {
        if !self.same_location(other) {
            return false;
        }
        let contains_other = self.index <= other.index && other.end() <= self.end();
        let contains_self = other.index <= self.index && self.end() <= other.end();
        contains_other || contains_self
    }

    /// True iff `index` falls within this ref's range at the same slot
    /// location as `slot`.
    pub fn contains_slot(&self, rank: Rank, buffer: &BufferName, index: u32) -> bool {
        self.rank == rank && &self.buffer == buffer && self.index <= index && index < self.end()
    }
}

/// A primitive scheduled instruction. Identity is by arena address
/// (`OpId`), never by structural equality — two distinct ops are never
/// considered equal even with identical fields.
#[derive(Debug, Clone)]
pub struct Op {
    pub inst: Instruction,
    pub rank: Rank,
    pub src: Option<ChunkRef>,
    pub dst: Option<ChunkRef>,
    /// Monotonic distance from a `start` in the chunk DAG.
    pub chunk_step: i64,
    /// Distance-to-end in the chunk DAG.
    pub priority: i64,
    /// Final index within the owning threadblock; `-1` until assigned.
    pub step: i32,
    /// Index into the owning rank's threadblock list; `-1` until assigned.
    pub tb: i32,
    /// `-1` means "auto-assign".
    pub channel: i32,
    pub prev: BTreeSet<OpId>,
    pub next: BTreeSet<OpId>,
    /// The matched send<->recv-family op(s) on the peer rank.
    pub matched: Vec<OpId>,
    /// The final, pruned list of cross-threadblock dependencies.
    pub depends: Vec<OpId>,
}

impl Op {
    pub fn new(inst: Instruction, rank: Rank, src: Option<ChunkRef>, dst: Option<ChunkRef>) -> Self {
        Op {
            inst,
            rank,
            src,
            dst,
            chunk_step: -1,
            priority: -1,
            step: -1,
            tb: -1,
            channel: -1,
            prev: BTreeSet::new(),
            next: BTreeSet::new(),
            matched: Vec::new(),
            depends: Vec::new(),
        }
    }

    /// Element count moved by this op: `src.size` if present, else
    /// `dst.size`, else `0` (a bare `nop`).
    pub fn count(&self) -> u32 {
        match (&self.src, &self.dst) {
            (Some(src), Some(dst)) => {
                debug_assert_eq!(src.size, dst.size);
                src.size
            },
            (Some(src), None) => src.size,
            (None, Some(dst)) => dst.size,
            (None, None) => 0,
        }
    }

    /// `(chunk_step asc, priority desc, src.index asc)`. Ops without a
    /// `src` (bare nops) sort after every op with one at the same
    /// `(chunk_step, priority)`, and ties beyond that are broken by
    /// `op_id` (arena insertion order) for reproducible compilation.
    pub fn scheduling_key(&self, op_id: OpId) -> (i64, i64, u32, OpId) {
        let src_index = self.src.as_ref().map(|r| r.index).unwrap_or(u32::MAX);
        (self.chunk_step, -self.priority, src_index, op_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rf(rank: Rank, index: u32, size: u32) -> ChunkRef {
        ChunkRef::new(rank, BufferName::Input, index, size)
    }

    #[test]
    fn overlap_requires_same_location() {
        let a = rf(0, 0, 4);
        let b = ChunkRef::new(1, BufferName::Input, 0, 4);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn overlap_detects_containment_either_direction() {
        let whole = rf(0, 0, 8);
        let half = rf(0, 2, 4);
        assert!(whole.overlaps(&half));
        assert!(half.overlaps(&whole));
    }

    #[test]
    fn disjoint_ranges_do_not_overlap() {
        let a = rf(0, 0, 4);
        let b = rf(0, 4, 4);
        assert!(!a.overlaps(&b));
    }
}
