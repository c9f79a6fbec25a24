//! Control-flow outcomes of the dispatch loop.
//!
//! Early return travels as `Ok(ControlFlow::Return)` and stops at the call
//! boundary that owns the body. Faults travel as `Err(VmError)` and keep
//! unwinding to the host.

/// Outcome of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Advance to the next instruction
    Continue,
    /// Leave the current body
    Return,
}

/// How an instruction sequence finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// `pc` reached the end of the sequence
    FellThrough,
    /// A `return` instruction ended the sequence early
    Returned,
}
