mod error;
mod function;
mod heap;
mod ops;
mod signal;
mod stack;
mod vm;

pub use error::VmError;
pub use function::{Function, FunctionBody, NativeContext, NativeFn};
pub use heap::Heap;
pub use ops::{Instruction, Opcode};
pub use signal::{Completion, ControlFlow};
pub use stack::Stack;
pub use vm::{ExecStats, Machine};
