//! Fatal compile-time errors, grouped by kind: structural, shape, resource,
//! graph.
//!
//! `check()` (the correctness oracle) is deliberately not represented here:
//! a failing oracle is not fatal, it is surfaced to the caller as `bool`.

use std::fmt;

use crate::buffer::BufferName;
use crate::op::{ChunkRef, Instruction};

/// Rank identifier. Ranks are dense integers in `0..num_ranks`.
pub type Rank = u32;

/// Identifier for a threadblock within a rank's threadblock list.
pub type TbId = u32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    // -- Structural --------------------------------------------------------
    #[error("no program is currently under construction")]
    NoActiveProgram,

    #[error("a program is already under construction; nested program regions are not allowed")]
    NestedProgramRegion,

    #[error("no link from rank {src} to rank {dst}")]
    NoLink { src: Rank, dst: Rank },

    #[error("unknown collective '{0}'")]
    UnknownCollective(String),

    #[error("invalid protocol '{0}'; expected one of Simple, LL, LL128")]
    UnknownProtocol(String),

    // -- Shape ---------------------------------------------------------------
    #[error("cannot split a ref of size {size} into {parts} parts: {size} is not divisible by {parts}")]
    NotDivisible { size: u32, parts: u32 },

    #[error("cannot group refs on rank {rank}: buffers {a:?} and {b:?} differ")]
    GroupBufferMismatch {
        rank: Rank,
        a: BufferName,
        b: BufferName,
    },

    #[error("cannot group refs on different ranks ({a} and {b})")]
    GroupRankMismatch { a: Rank, b: Rank },

    #[error("cannot send ref {r:?}: {count} slot(s) in its range were never written")]
    MissingSlots { r: ChunkRef, count: usize },

    // -- Resource --------------------------------------------------------
    #[error(
        "threadblock {tb} on rank {rank} already has {direction} peer {existing}; cannot also bind peer {requested}"
    )]
    ThreadblockPeerConflict {
        rank: Rank,
        tb: TbId,
        direction: PeerDirection,
        existing: Rank,
        requested: Rank,
    },

    #[error("threadblock {tb} on rank {rank} already has an op at step {step}")]
    DuplicateStep { rank: Rank, tb: TbId, step: u32 },

    // -- Graph -------------------------------------------------------------
    #[error("slot (rank {rank}, {buffer:?}, {index}) was read by a {inst:?} op before anything wrote to it")]
    UnreachableSlot {
        rank: Rank,
        buffer: BufferName,
        index: u32,
        inst: Instruction,
    },

    #[error("dependency cycle detected across threadblocks, starting at rank {rank} tb {tb}")]
    DependencyCycle { rank: Rank, tb: TbId },

    #[error("send op on rank {src_rank} has no matching recv-family op on rank {dst_rank}")]
    UnmatchedSend { src_rank: Rank, dst_rank: Rank },

    #[error("send/recv ordering between rank {a_rank} tb {a_tb} and rank {b_rank} tb {b_tb} is inconsistent")]
    OrderingViolation {
        a_rank: Rank,
        a_tb: TbId,
        b_rank: Rank,
        b_tb: TbId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    Send,
    Recv,
}

impl fmt::Display for PeerDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerDirection::Send => write!(f, "send"),
            PeerDirection::Recv => write!(f, "recv"),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
