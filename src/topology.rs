//! The injected description of the physical machine a program targets.
//!
//! This crate never discovers topology itself — callers supply an
//! implementation, typically backed by NVML/NCCL enumeration or a
//! hand-written test fixture (see [`crate::testing`] behind the `testing`
//! feature).

use crate::error::Rank;

/// What the compiler needs to know about inter-rank connectivity to
/// validate a program: which ranks can reach which, and over how many
/// independent channels.
pub trait Topology {
    fn num_ranks(&self) -> u32;

    /// Whether `src` can send directly to `dst`. Ranks are always
    /// considered linked to themselves.
    fn has_link(&self, src: Rank, dst: Rank) -> bool;

    /// Number of independent channels available between `src` and `dst`;
    /// `0` if unlinked.
    fn num_channels(&self, src: Rank, dst: Rank) -> u32;
}
