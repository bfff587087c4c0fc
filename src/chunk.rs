//! The two-variant `Chunk` / `ReduceChunk` value sum.

use crate::error::Rank;

/// An immutable unit of data, identified by where it was first placed.
///
/// Chunks never move: they are copied between buffer slots and compared
/// purely by their origin, never by where they currently live. `dst_rank`/
/// `dst_index` are optional hints recorded by the front end so that
/// `get_dst_rank`/`get_dst_index` can answer provenance queries; they do not
/// participate in equality.
#[derive(Debug, Clone, Copy)]
pub struct Chunk {
    pub origin_rank: Rank,
    pub origin_index: u32,
    pub dst_rank: Option<Rank>,
    pub dst_index: Option<u32>,
}

impl Chunk {
    pub fn new(origin_rank: Rank, origin_index: u32) -> Self {
        Chunk { origin_rank, origin_index, dst_rank: None, dst_index: None }
    }

    pub fn with_dst(mut self, dst_rank: Rank, dst_index: u32) -> Self {
        self.dst_rank = Some(dst_rank);
        self.dst_index = Some(dst_index);
        self
    }

    fn origin(&self) -> (Rank, u32) {
        (self.origin_rank, self.origin_index)
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.origin() == other.origin()
    }
}
impl Eq for Chunk {}

/// The commutative, associative combination of an unordered multiset of
/// [`Chunk`]s. Equality is multiset equality over member origins.
///
/// `id` is a synthetic, monotonically-assigned identity used only so the
/// chunk DAG can tell apart two structurally-equal reduce results produced
/// by distinct ops; it plays no part in [`PartialEq`].
#[derive(Debug, Clone, Default)]
pub struct ReduceChunk {
    members: Vec<Chunk>,
    id: u64,
}

impl ReduceChunk {
    pub fn members(&self) -> &[Chunk] {
        &self.members
    }

    fn sorted_origins(&self) -> Vec<(Rank, u32)> {
        let mut origins: Vec<_> = self.members.iter().map(Chunk::origin).collect();
        origins.sort_unstable();
        origins
    }
}

impl PartialEq for ReduceChunk {
    fn eq(&self, other: &Self) -> bool {
        self.members.len() == other.members.len() && self.sorted_origins() == other.sorted_origins()
    }
}
impl Eq for ReduceChunk {}

/// Identifies which [`crate::chunk_dag::ChunkOp`] produced a given value,
/// for provenance lookups in the chunk DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvenanceKey {
    Origin(Rank, u32),
    Reduce(u64),
}

/// The value actually occupying a buffer slot at a point in the chunk DAG's
/// simulation: either a single chunk or the reduction of several.
#[derive(Debug, Clone)]
pub enum ChunkValue {
    Chunk(Chunk),
    Reduce(ReduceChunk),
}

impl ChunkValue {
    /// Combines `self` (already occupying the destination slot) with an
    /// `incoming` value arriving via a reduce op: `reduce(Chunk)` appends,
    /// `reduce(ReduceChunk)` concatenates. `id` becomes the provenance
    /// identity of the resulting [`ReduceChunk`].
    pub fn reduce(self, incoming: ChunkValue, id: u64) -> ChunkValue {
        let mut members = self.into_members();
        members.extend(incoming.into_members());
        ChunkValue::Reduce(ReduceChunk { members, id })
    }

    fn into_members(self) -> Vec<Chunk> {
        match self {
            ChunkValue::Chunk(c) => vec![c],
            ChunkValue::Reduce(r) => r.members,
        }
    }

    /// Key used by the chunk DAG to find the op that produced this value:
    /// a Chunk's origin pair for plain chunks, or the synthetic id for
    /// reduce results.
    pub fn provenance_key(&self) -> ProvenanceKey {
        match self {
            ChunkValue::Chunk(c) => ProvenanceKey::Origin(c.origin_rank, c.origin_index),
            ChunkValue::Reduce(r) => ProvenanceKey::Reduce(r.id),
        }
    }

    pub fn origin_rank(&self) -> Option<Rank> {
        match self {
            ChunkValue::Chunk(c) => Some(c.origin_rank),
            ChunkValue::Reduce(_) => None,
        }
    }

    pub fn origin_index(&self) -> Option<u32> {
        match self {
            ChunkValue::Chunk(c) => Some(c.origin_index),
            ChunkValue::Reduce(_) => None,
        }
    }

    pub fn dst_rank(&self) -> Option<Rank> {
        match self {
            ChunkValue::Chunk(c) => c.dst_rank,
            ChunkValue::Reduce(_) => None,
        }
    }

    pub fn dst_index(&self) -> Option<u32> {
        match self {
            ChunkValue::Chunk(c) => c.dst_index,
            ChunkValue::Reduce(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_equality_ignores_dst_hint() {
        let a = Chunk::new(0, 3);
        let b = Chunk::new(0, 3).with_dst(2, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn reduce_chunk_equality_is_multiset() {
        let a = ChunkValue::Chunk(Chunk::new(0, 0));
        let b = ChunkValue::Chunk(Chunk::new(1, 0));
        let c = ChunkValue::Chunk(Chunk::new(2, 0));

        let left = a.clone().reduce(b.clone(), 1).reduce(c.clone(), 2);
        let right = c.reduce(a, 3).reduce(b, 4);

        match (left, right) {
            (ChunkValue::Reduce(l), ChunkValue::Reduce(r)) => assert_eq!(l, r),
            _ => panic!("expected reduce chunks"),
        }
    }

    #[test]
    fn reduce_reduce_concatenates() {
        let rc1 = ChunkValue::Chunk(Chunk::new(0, 0)).reduce(ChunkValue::Chunk(Chunk::new(1, 0)), 1);
        let rc2 = ChunkValue::Chunk(Chunk::new(2, 0)).reduce(ChunkValue::Chunk(Chunk::new(3, 0)), 2);
        let combined = rc1.reduce(rc2, 3);
        match combined {
            ChunkValue::Reduce(r) => assert_eq!(r.members().len(), 4),
            _ => panic!("expected reduce chunk"),
        }
    }
}
