//! Lowers a script describing a collective-communication algorithm, issued
//! as a sequence of per-rank chunk movements, into a validated, per-rank,
//! per-threadblock instruction schedule.
//!
//! The pipeline, in order:
//!
//! 1. [`facade::begin_program`] seeds every rank's buffers from a
//!    [`collective::Collective`] and opens the ambient chunk DAG.
//! 2. [`facade::split`], [`facade::group`], [`facade::send`] and
//!    [`facade::reduce`] record chunk-level data movement as the script
//!    runs ([`chunk_dag`]).
//! 3. [`facade::end_program`] lowers the chunk DAG to a per-rank operation
//!    graph ([`rank_dag`]), fuses adjacent send/recv chains
//!    ([`rank_dag::fusion`]), assigns threadblocks ([`threadblock`]),
//!    infers cross-threadblock dependencies ([`rank_dag::dependencies`]),
//!    validates the result ([`validate`]) and replicates/emits the typed
//!    artifact ([`program`]).
//!
//! [`facade::check_program`] then asks the [`collective::Collective`]
//! whether the emitted [`program::Program`] actually implements it — a
//! non-fatal oracle, since a failing check means "wrong algorithm", not
//! "malformed schedule".

pub mod buffer;
pub mod chunk;
pub mod chunk_dag;
pub mod collective;
pub mod error;
pub mod facade;
pub mod op;
pub mod program;
pub mod rank_dag;
#[cfg(feature = "testing")]
pub mod testing;
pub mod threadblock;
pub mod topology;
pub mod validate;

pub use collective::Collective;
pub use error::{CompileError, Rank, Result, TbId};
pub use facade::{
    alloc_scratch, begin_program, check_program, dst_index, dst_rank, end_program, group, origin_index, origin_rank,
    reduce, send, split,
};
pub use op::ChunkRef;
pub use program::Program;
pub use topology::Topology;
