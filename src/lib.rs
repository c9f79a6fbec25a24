//! stackvm - A minimal stack-based bytecode virtual machine
//!
//! Executes fixed-width instructions against a bounded operand stack and a
//! flat heap, with scripted and host-native functions.

pub mod config;
pub mod demo;
pub mod vm;

// Re-export commonly used types
pub use config::MachineConfig;
pub use vm::{Function, Instruction, Machine, Opcode, VmError};
