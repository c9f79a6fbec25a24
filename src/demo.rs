//! Hand-assembled demonstration program.
//!
//! Adds 5 and 6 with a scripted function, stores the sum at heap cell 1,
//! feeds it back through a second function that returns early, stores that
//! at heap cell 5, then prints both cells through a native function.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use crate::config::MachineConfig;
use crate::vm::{ExecStats, Function, Instruction, Machine, Opcode, VmError};

/// Heap cell receiving `add(5, 6)`
pub const SUM_ADDR: i32 = 1;

/// Heap cell receiving `add_return(11, heap[1])`
pub const DOUBLED_ADDR: i32 = 5;

/// Function table indices
pub const ADD: i32 = 0;
pub const ADD_RETURN: i32 = 1;
pub const PRINT: i32 = 2;

/// Outcome of a demo run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DemoReport {
    pub sum: i32,
    pub doubled: i32,
    /// Values received by the native print function, in call order
    pub printed: Vec<i32>,
    /// Stack pointer after the program finished
    pub final_sp: usize,
    pub stats: ExecStats,
}

/// `[add, add_return, print]`; print appends its argument to `sink`.
pub fn functions(sink: Rc<RefCell<Vec<i32>>>) -> Vec<Function> {
    vec![
        Function::scripted(
            "add",
            2,
            true,
            vec![
                Instruction::local_get(0),
                Instruction::local_get(1),
                Instruction::op(Opcode::Add),
            ],
        ),
        Function::scripted(
            "add_return",
            2,
            true,
            vec![
                Instruction::local_get(0),
                Instruction::local_get(1),
                Instruction::op(Opcode::Add),
                Instruction::op(Opcode::Return),
            ],
        ),
        Function::native("print", 1, false, move |args, _| {
            sink.borrow_mut().push(args[0]);
            Ok(())
        }),
    ]
}

pub fn program() -> Vec<Instruction> {
    vec![
        Instruction::push(DOUBLED_ADDR),
        Instruction::push(SUM_ADDR),
        Instruction::push(5),
        Instruction::push(6),
        Instruction::call(ADD),
        // heap[SUM_ADDR] = 11
        Instruction::op(Opcode::Store),
        Instruction::push(11),
        Instruction::push(SUM_ADDR),
        Instruction::op(Opcode::Load),
        Instruction::call(ADD_RETURN),
        // heap[DOUBLED_ADDR] = 22
        Instruction::op(Opcode::Store),
        Instruction::push(SUM_ADDR),
        Instruction::op(Opcode::Load),
        Instruction::call(PRINT),
        Instruction::push(DOUBLED_ADDR),
        Instruction::op(Opcode::Load),
        Instruction::call(PRINT),
    ]
}

/// Build a machine from `config` and run the demo program on it.
pub fn run(config: &MachineConfig) -> Result<DemoReport, VmError> {
    let printed = Rc::new(RefCell::new(Vec::new()));
    let mut machine = Machine::with_config(functions(Rc::clone(&printed)), config)?;
    machine.execute(&program(), None)?;

    let printed = printed.borrow().clone();
    Ok(DemoReport {
        sum: machine.load(SUM_ADDR)?,
        doubled: machine.load(DOUBLED_ADDR)?,
        printed,
        final_sp: machine.sp(),
        stats: machine.stats().clone(),
    })
}
