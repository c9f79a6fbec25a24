use std::fmt;

use super::ops::Instruction;

/// Faults raised while building or running a machine.
///
/// Every variant aborts the current call chain. Early return is not an
/// error and never appears here; see [`ControlFlow`](super::ControlFlow).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Push onto a full stack
    StackOverflow { capacity: usize },
    /// Pop from an empty stack
    StackUnderflow,
    /// Heap access outside `0..capacity`
    InvalidAddress { addr: i32, capacity: usize },
    /// Fetched instruction has no meaning
    UnknownOpcode(Instruction),
    /// Argument count differs from the declared arity
    ArityMismatch {
        function: String,
        expected: usize,
        got: usize,
    },
    /// Call through an index outside the function table
    InvalidFunctionIndex { index: i32, len: usize },
    /// Callee declared a result but left none on the stack
    MissingReturnValue(String),
    /// Local-variable instruction outside of a function call
    NoLocalFrame,
    /// Local-variable slot outside the current frame
    InvalidLocalIndex { index: i32, len: usize },
    /// Integer division or remainder by zero
    DivideByZero,
    /// Stack or heap capacity of zero at construction
    InvalidCapacity { stack: usize, heap: usize },
    /// Instruction budget used up
    FuelExhausted { limit: u64 },
    /// Nested calls deeper than the configured limit
    CallDepthExceeded { limit: usize },
}

impl VmError {
    /// Whether the fault gets a diagnostic at every call boundary it crosses.
    pub fn is_diagnosed(&self) -> bool {
        matches!(
            self,
            VmError::UnknownOpcode(_) | VmError::MissingReturnValue(_)
        )
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::StackOverflow { capacity } => {
                write!(f, "stack overflow (capacity {})", capacity)
            }
            VmError::StackUnderflow => write!(f, "stack underflow"),
            VmError::InvalidAddress { addr, capacity } => write!(
                f,
                "invalid heap address {} (capacity {})",
                addr, capacity
            ),
            VmError::UnknownOpcode(instruction) => {
                write!(f, "unknown opcode {} in {:?}", instruction.opcode, instruction)
            }
            VmError::ArityMismatch {
                function,
                expected,
                got,
            } => write!(
                f,
                "function '{}' expects {} arguments, got {}",
                function, expected, got
            ),
            VmError::InvalidFunctionIndex { index, len } => write!(
                f,
                "invalid function index {} ({} functions registered)",
                index, len
            ),
            VmError::MissingReturnValue(name) => {
                write!(f, "function '{}' returned without a value", name)
            }
            VmError::NoLocalFrame => write!(f, "no local frame is active"),
            VmError::InvalidLocalIndex { index, len } => {
                write!(f, "local slot {} out of range (frame size {})", index, len)
            }
            VmError::DivideByZero => write!(f, "division by zero"),
            VmError::InvalidCapacity { stack, heap } => write!(
                f,
                "invalid capacity: stack {} and heap {} must both be positive",
                stack, heap
            ),
            VmError::FuelExhausted { limit } => {
                write!(f, "fuel exhausted after {} instructions", limit)
            }
            VmError::CallDepthExceeded { limit } => {
                write!(f, "call depth exceeded (limit {})", limit)
            }
        }
    }
}

impl std::error::Error for VmError {}
