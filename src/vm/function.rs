use std::fmt;

use super::error::VmError;
use super::ops::Instruction;
use super::stack::Stack;

/// Host callback behind a native function.
///
/// Receives the arguments in push order and a handle that can only push
/// onto the machine's stack. A result, if the function declares one, is
/// communicated by pushing it.
pub type NativeFn = Box<dyn Fn(&[i32], &mut NativeContext<'_>) -> Result<(), VmError>>;

/// The only view of the machine a native function gets.
pub struct NativeContext<'a> {
    stack: &'a mut Stack,
}

impl<'a> NativeContext<'a> {
    pub(crate) fn new(stack: &'a mut Stack) -> Self {
        Self { stack }
    }

    /// Push a value onto the caller's stack.
    pub fn push(&mut self, value: i32) -> Result<(), VmError> {
        self.stack.push(value)
    }
}

/// What runs when a function is called.
pub enum FunctionBody {
    /// Bytecode executed by the machine with its own local frame
    Scripted(Vec<Instruction>),
    /// Host callback
    Native(NativeFn),
}

/// An entry in the machine's function table.
pub struct Function {
    pub name: String,
    /// Number of arguments popped off the caller's stack
    pub arity: usize,
    /// Whether the call leaves exactly one result for the caller
    pub has_return: bool,
    pub body: FunctionBody,
}

impl Function {
    pub fn scripted(
        name: impl Into<String>,
        arity: usize,
        has_return: bool,
        code: Vec<Instruction>,
    ) -> Self {
        Self {
            name: name.into(),
            arity,
            has_return,
            body: FunctionBody::Scripted(code),
        }
    }

    pub fn native<F>(name: impl Into<String>, arity: usize, has_return: bool, callback: F) -> Self
    where
        F: Fn(&[i32], &mut NativeContext<'_>) -> Result<(), VmError> + 'static,
    {
        Self {
            name: name.into(),
            arity,
            has_return,
            body: FunctionBody::Native(Box::new(callback)),
        }
    }
}

impl fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionBody::Scripted(code) => f.debug_tuple("Scripted").field(code).finish(),
            FunctionBody::Native(_) => f.write_str("Native(<host>)"),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("has_return", &self.has_return)
            .field("body", &self.body)
            .finish()
    }
}
