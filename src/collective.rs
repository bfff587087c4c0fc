//! The injected description of which collective a program implements.
//!
//! A [`Collective`] is consulted twice: once up front, to size each rank's
//! input/output buffers, and once at the end, as a non-fatal correctness
//! oracle over the emitted [`crate::program::Program`] — a failing check
//! is a compile-time signal, not a [`crate::error::CompileError`], since it
//! means "this schedule doesn't implement what it claims to", not "this
//! schedule is structurally broken".

use crate::program::Program;

pub trait Collective {
    fn name(&self) -> &str;

    /// Whether the algorithm's output overwrites its input buffer in
    /// place, for programs that declare `inplace`.
    fn is_inplace(&self) -> bool {
        false
    }

    /// `(input_len, output_len)` for each of `num_ranks` ranks.
    fn init_buffers(&self, num_ranks: u32) -> Vec<(u32, u32)>;

    /// Checks that `program` actually realizes this collective's data
    /// movement. Returning `false` does not produce a [`crate::error::CompileError`];
    /// callers decide what to do with a failed oracle.
    fn check(&self, program: &Program) -> bool;
}
