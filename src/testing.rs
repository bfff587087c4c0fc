//! Mock [`Topology`]/[`Collective`] implementations for the test suite and
//! `demos/`, gated behind the `testing` feature so they never leak into a
//! default build.

use crate::collective::Collective;
use crate::error::Rank;
use crate::program::Program;
use crate::topology::Topology;

/// A fully-connected topology: every rank can reach every other rank over
/// a fixed channel count.
pub struct FullyConnected {
    num_ranks: u32,
    channels: u32,
}

impl FullyConnected {
    pub fn new(num_ranks: u32, channels: u32) -> Self {
        FullyConnected { num_ranks, channels }
    }
}

impl Topology for FullyConnected {
    fn num_ranks(&self) -> u32 {
        self.num_ranks
    }

    fn has_link(&self, src: Rank, dst: Rank) -> bool {
        src < self.num_ranks && dst < self.num_ranks
    }

    fn num_channels(&self, src: Rank, dst: Rank) -> u32 {
        if self.has_link(src, dst) { self.channels } else { 0 }
    }
}

/// A trivial collective with a fixed per-rank chunk count, accepting any
/// schedule (its `check` always passes). Useful for exercising the
/// pipeline without pulling in a real collective's semantics.
pub struct TrivialCollective {
    pub chunks_per_rank: u32,
}

impl Collective for TrivialCollective {
    fn name(&self) -> &str {
        "trivial"
    }

    fn init_buffers(&self, num_ranks: u32) -> Vec<(u32, u32)> {
        (0..num_ranks).map(|_| (self.chunks_per_rank, self.chunks_per_rank)).collect()
    }

    fn check(&self, _program: &Program) -> bool {
        true
    }
}

/// A reference allgather: every rank starts with `chunks_per_rank` input
/// chunks and should end up with `num_ranks * chunks_per_rank` output
/// chunks, one slab contributed by each rank. `check` only verifies the
/// structural shape (every GPU's output buffer is sized for the full
/// gather and owns at least one threadblock moving data); it does not
/// replay the schedule against the chunk DAG, unlike the structural
/// invariants [`crate::validate::validate`] already enforces.
pub struct AllGather {
    pub chunks_per_rank: u32,
}

impl Collective for AllGather {
    fn name(&self) -> &str {
        "allgather"
    }

    fn init_buffers(&self, num_ranks: u32) -> Vec<(u32, u32)> {
        (0..num_ranks).map(|_| (self.chunks_per_rank, self.chunks_per_rank * num_ranks)).collect()
    }

    fn check(&self, program: &Program) -> bool {
        let num_ranks = program.gpus.len() as u32;
        program.gpus.iter().all(|gpu| {
            gpu.output_chunks == self.chunks_per_rank * num_ranks && !gpu.threadblocks.is_empty()
        })
    }
}
