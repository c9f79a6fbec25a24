use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, error, trace};

use crate::config::MachineConfig;
use crate::vm::{
    Completion, ControlFlow, Function, FunctionBody, Heap, Instruction, NativeContext, Opcode,
    Stack, VmError,
};

/// Execution statistics, accumulated across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecStats {
    /// Instructions executed
    pub instructions: u64,
    /// Calls dispatched (scripted and native)
    pub calls: u64,
    /// Calls that reached a native function
    pub native_calls: u64,
    /// Highest stack pointer observed
    pub max_stack_depth: usize,
}

/// Limits applied while a host entry point runs.
#[derive(Debug, Clone, Copy)]
struct Limits {
    fuel: Option<u64>,
    max_call_depth: usize,
    trace: bool,
}

/// The stack machine.
///
/// Owns the operand stack, the flat heap and the function table. Nested
/// calls share the stack and heap; each scripted call gets its own local
/// frame.
pub struct Machine {
    stack: Stack,
    heap: Heap,
    /// Shared with running bodies so they can borrow code while `self` is mutated
    functions: Rc<[Function]>,
    limits: Limits,
    /// Remaining instruction budget for the current entry point
    fuel_left: Option<u64>,
    /// Current call nesting
    depth: usize,
    stats: ExecStats,
}

impl Machine {
    /// Create a machine with the given capacities and default limits.
    pub fn new(
        functions: Vec<Function>,
        stack_capacity: usize,
        heap_capacity: usize,
    ) -> Result<Self, VmError> {
        let config = MachineConfig {
            stack_capacity,
            heap_capacity,
            ..MachineConfig::default()
        };
        Self::with_config(functions, &config)
    }

    /// Create a machine from a full configuration.
    pub fn with_config(functions: Vec<Function>, config: &MachineConfig) -> Result<Self, VmError> {
        if config.stack_capacity == 0 || config.heap_capacity == 0 {
            return Err(VmError::InvalidCapacity {
                stack: config.stack_capacity,
                heap: config.heap_capacity,
            });
        }

        Ok(Self {
            stack: Stack::new(config.stack_capacity),
            heap: Heap::new(config.heap_capacity),
            functions: functions.into(),
            limits: Limits {
                fuel: config.fuel,
                max_call_depth: config.max_call_depth,
                trace: config.trace,
            },
            fuel_left: config.fuel,
            depth: 0,
            stats: ExecStats::default(),
        })
    }

    // ========================================
    // Host inspection
    // ========================================

    pub fn push(&mut self, value: i32) -> Result<(), VmError> {
        self.stack.push(value)
    }

    pub fn pop(&mut self) -> Result<i32, VmError> {
        self.stack.pop()
    }

    pub fn load(&self, addr: i32) -> Result<i32, VmError> {
        self.heap.load(addr)
    }

    pub fn store(&mut self, addr: i32, value: i32) -> Result<(), VmError> {
        self.heap.store(addr, value)
    }

    /// Current stack pointer.
    pub fn sp(&self) -> usize {
        self.stack.sp()
    }

    /// Live stack values, bottom first.
    pub fn stack(&self) -> &[i32] {
        self.stack.as_slice()
    }

    /// Raw stack cell, including slots above the stack pointer.
    pub fn stack_slot(&self, index: usize) -> Option<i32> {
        self.stack.slot(index)
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Look up a function's table index by name.
    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn stats(&self) -> &ExecStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ExecStats::default();
    }

    // ========================================
    // Entry points
    // ========================================

    /// Run an instruction sequence directly.
    ///
    /// `locals` is the frame seen by `local-get`/`local-set`; top-level
    /// scripts usually pass `None`. A `return` ends the sequence normally.
    pub fn execute(
        &mut self,
        code: &[Instruction],
        locals: Option<&mut [i32]>,
    ) -> Result<Completion, VmError> {
        self.arm();
        let functions = Rc::clone(&self.functions);
        self.run(&functions, code, locals)
    }

    /// Call a function from the host with explicit arguments.
    ///
    /// Returns the function's result if it declares one. The result is
    /// taken off the stack.
    pub fn call(&mut self, index: usize, args: &[i32]) -> Result<Option<i32>, VmError> {
        self.arm();
        let functions = Rc::clone(&self.functions);
        let function = functions.get(index).ok_or(VmError::InvalidFunctionIndex {
            index: i32::try_from(index).unwrap_or(i32::MAX),
            len: functions.len(),
        })?;
        self.invoke(&functions, function, args.to_vec())
    }

    fn arm(&mut self) {
        self.fuel_left = self.limits.fuel;
        self.depth = 0;
    }

    // ========================================
    // Dispatch loop
    // ========================================

    fn run(
        &mut self,
        functions: &[Function],
        code: &[Instruction],
        mut locals: Option<&mut [i32]>,
    ) -> Result<Completion, VmError> {
        let mut pc = 0;
        while pc < code.len() {
            let instruction = &code[pc];
            self.consume_fuel()?;
            self.stats.instructions += 1;

            if self.limits.trace {
                trace!(pc, %instruction, sp = self.stack.sp(), "exec");
            }

            let flow = self.execute_op(functions, instruction, locals.as_deref_mut());
            self.stats.max_stack_depth = self.stats.max_stack_depth.max(self.stack.sp());
            let flow = flow?;

            if flow == ControlFlow::Return {
                return Ok(Completion::Returned);
            }
            pc += 1;
        }

        Ok(Completion::FellThrough)
    }

    fn consume_fuel(&mut self) -> Result<(), VmError> {
        if let (Some(left), Some(limit)) = (self.fuel_left.as_mut(), self.limits.fuel) {
            if *left == 0 {
                return Err(VmError::FuelExhausted { limit });
            }
            *left -= 1;
        }
        Ok(())
    }

    fn execute_op(
        &mut self,
        functions: &[Function],
        instruction: &Instruction,
        locals: Option<&mut [i32]>,
    ) -> Result<ControlFlow, VmError> {
        let op = instruction
            .decode()
            .ok_or(VmError::UnknownOpcode(*instruction))?;

        match op {
            Opcode::PushConst => {
                self.stack.push(instruction.arg0)?;
            }
            Opcode::Load => {
                let addr = self.stack.pop()?;
                let value = self.heap.load(addr)?;
                self.stack.push(value)?;
            }
            Opcode::Store => {
                // Stack order: [addr, value] with value on top
                let value = self.stack.pop()?;
                let addr = self.stack.pop()?;
                self.heap.store(addr, value)?;
            }
            Opcode::Call => {
                let index = instruction.arg0;
                let function = usize::try_from(index)
                    .ok()
                    .and_then(|i| functions.get(i))
                    .ok_or(VmError::InvalidFunctionIndex {
                        index,
                        len: functions.len(),
                    })?;
                let args = self.stack.pop_n(function.arity)?;
                if let Some(result) = self.invoke(functions, function, args)? {
                    self.stack.push(result)?;
                }
            }
            Opcode::LocalGet => {
                let frame = locals.ok_or(VmError::NoLocalFrame)?;
                let slot = local_slot(frame, instruction.arg0)?;
                let value = frame[slot];
                self.stack.push(value)?;
            }
            Opcode::LocalSet => {
                let frame = locals.ok_or(VmError::NoLocalFrame)?;
                let slot = local_slot(frame, instruction.arg0)?;
                frame[slot] = self.stack.pop()?;
            }
            Opcode::Return => return Ok(ControlFlow::Return),
            Opcode::Add => self.binary_op(|l, r| Ok(l.wrapping_add(r)))?,
            Opcode::Sub => self.binary_op(|l, r| Ok(l.wrapping_sub(r)))?,
            Opcode::Mul => self.binary_op(|l, r| Ok(l.wrapping_mul(r)))?,
            Opcode::Div => self.binary_op(|l, r| {
                if r == 0 {
                    return Err(VmError::DivideByZero);
                }
                Ok(l.wrapping_div(r))
            })?,
            Opcode::And => self.binary_op(|l, r| Ok(l & r))?,
            Opcode::Or => self.binary_op(|l, r| Ok(l | r))?,
            Opcode::Xor => self.binary_op(|l, r| Ok(l ^ r))?,
            Opcode::Rem => self.binary_op(|l, r| {
                if r == 0 {
                    return Err(VmError::DivideByZero);
                }
                Ok(l.wrapping_rem(r))
            })?,
            Opcode::Eq => self.compare(|l, r| l == r)?,
            Opcode::Ne => self.compare(|l, r| l != r)?,
            Opcode::Lt => self.compare(|l, r| l < r)?,
            Opcode::Le => self.compare(|l, r| l <= r)?,
            Opcode::Gt => self.compare(|l, r| l > r)?,
            Opcode::Ge => self.compare(|l, r| l >= r)?,
            // Shift counts are taken modulo 32
            Opcode::Shl => self.binary_op(|l, r| Ok(l.wrapping_shl(r as u32)))?,
            Opcode::Shr => self.binary_op(|l, r| Ok(l.wrapping_shr(r as u32)))?,
        }

        Ok(ControlFlow::Continue)
    }

    /// Pop `L` (top) then `R` and push `f(L, R)`.
    fn binary_op(
        &mut self,
        f: impl FnOnce(i32, i32) -> Result<i32, VmError>,
    ) -> Result<(), VmError> {
        let left = self.stack.pop()?;
        let right = self.stack.pop()?;
        self.stack.push(f(left, right)?)
    }

    fn compare(&mut self, f: impl FnOnce(i32, i32) -> bool) -> Result<(), VmError> {
        self.binary_op(|l, r| Ok(if f(l, r) { 1 } else { 0 }))
    }

    // ========================================
    // Calls
    // ========================================

    /// Run `function` with already-gathered arguments and collect its result.
    ///
    /// This is the call boundary: an early return inside the body ends here,
    /// faults are logged if diagnosed and passed on.
    fn invoke(
        &mut self,
        functions: &[Function],
        function: &Function,
        mut args: Vec<i32>,
    ) -> Result<Option<i32>, VmError> {
        if args.len() != function.arity {
            return Err(VmError::ArityMismatch {
                function: function.name.clone(),
                expected: function.arity,
                got: args.len(),
            });
        }
        if self.depth >= self.limits.max_call_depth {
            return Err(VmError::CallDepthExceeded {
                limit: self.limits.max_call_depth,
            });
        }

        debug!(function = %function.name, ?args, depth = self.depth, "call");
        self.stats.calls += 1;
        self.depth += 1;

        let outcome = match &function.body {
            FunctionBody::Scripted(code) => self
                .run(functions, code, Some(args.as_mut_slice()))
                .map(|completion| {
                    debug!(function = %function.name, ?completion, "return");
                }),
            FunctionBody::Native(callback) => {
                self.stats.native_calls += 1;
                callback(args.as_slice(), &mut NativeContext::new(&mut self.stack))
            }
        };
        self.depth -= 1;
        self.stats.max_stack_depth = self.stats.max_stack_depth.max(self.stack.sp());

        let result = outcome.and_then(|()| self.take_result(function));
        if let Err(e) = &result
            && e.is_diagnosed()
        {
            error!(function = %function.name, error = %e, "call failed");
        }
        result
    }

    /// Pop the callee's result if it declares one.
    ///
    /// The result is whatever is on top of the shared stack, so a callee may
    /// consume values its caller left behind. Only an empty stack is a fault.
    fn take_result(&mut self, function: &Function) -> Result<Option<i32>, VmError> {
        if !function.has_return {
            return Ok(None);
        }
        self.stack
            .pop()
            .map(Some)
            .map_err(|_| VmError::MissingReturnValue(function.name.clone()))
    }
}

fn local_slot(frame: &[i32], index: i32) -> Result<usize, VmError> {
    usize::try_from(index)
        .ok()
        .filter(|&slot| slot < frame.len())
        .ok_or(VmError::InvalidLocalIndex {
            index,
            len: frame.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn op(opcode: Opcode) -> Instruction {
        Instruction::op(opcode)
    }

    fn machine(functions: Vec<Function>) -> Machine {
        Machine::new(functions, 64, 64).unwrap()
    }

    fn run_code(code: Vec<Instruction>) -> Result<Vec<i32>, VmError> {
        let mut vm = machine(vec![]);
        vm.execute(&code, None)?;
        Ok(vm.stack().to_vec())
    }

    fn binop(x: i32, y: i32, opcode: Opcode) -> Result<Vec<i32>, VmError> {
        run_code(vec![Instruction::push(x), Instruction::push(y), op(opcode)])
    }

    /// add(a, b) = a + b
    fn add_function() -> Function {
        Function::scripted(
            "add",
            2,
            true,
            vec![
                Instruction::local_get(0),
                Instruction::local_get(1),
                op(Opcode::Add),
            ],
        )
    }

    #[test]
    fn test_push_const() {
        assert_eq!(run_code(vec![Instruction::push(42)]).unwrap(), vec![42]);
    }

    #[test]
    fn test_add() {
        assert_eq!(binop(1, 2, Opcode::Add).unwrap(), vec![3]);
    }

    #[test]
    fn test_sub_uses_top_of_stack_as_left_operand() {
        assert_eq!(binop(5, 3, Opcode::Sub).unwrap(), vec![-2]);
    }

    #[test]
    fn test_lt_uses_top_of_stack_as_left_operand() {
        assert_eq!(binop(5, 3, Opcode::Lt).unwrap(), vec![1]);
        assert_eq!(binop(3, 5, Opcode::Lt).unwrap(), vec![0]);
    }

    #[test]
    fn test_non_commutative_ops() {
        assert_eq!(binop(2, 10, Opcode::Div).unwrap(), vec![5]);
        assert_eq!(binop(3, 10, Opcode::Rem).unwrap(), vec![1]);
        assert_eq!(binop(3, 1, Opcode::Shl).unwrap(), vec![8]);
        assert_eq!(binop(2, -16, Opcode::Shr).unwrap(), vec![-4]);
        assert_eq!(binop(4, 4, Opcode::Le).unwrap(), vec![1]);
        assert_eq!(binop(4, 9, Opcode::Gt).unwrap(), vec![1]);
        assert_eq!(binop(9, 4, Opcode::Ge).unwrap(), vec![0]);
    }

    #[test]
    fn test_bitwise_and_equality() {
        assert_eq!(binop(0b1100, 0b1010, Opcode::And).unwrap(), vec![0b1000]);
        assert_eq!(binop(0b1100, 0b1010, Opcode::Or).unwrap(), vec![0b1110]);
        assert_eq!(binop(0b1100, 0b1010, Opcode::Xor).unwrap(), vec![0b0110]);
        assert_eq!(binop(7, 7, Opcode::Eq).unwrap(), vec![1]);
        assert_eq!(binop(7, 7, Opcode::Ne).unwrap(), vec![0]);
    }

    #[test]
    fn test_arithmetic_wraps() {
        assert_eq!(binop(1, i32::MAX, Opcode::Add).unwrap(), vec![i32::MIN]);
        assert_eq!(binop(-1, i32::MIN, Opcode::Div).unwrap(), vec![i32::MIN]);
        assert_eq!(binop(33, 1, Opcode::Shl).unwrap(), vec![2]);
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(binop(0, 1, Opcode::Div), Err(VmError::DivideByZero));
        assert_eq!(binop(0, 1, Opcode::Rem), Err(VmError::DivideByZero));
    }

    #[test]
    fn test_binary_op_underflow() {
        assert_eq!(
            run_code(vec![Instruction::push(1), op(Opcode::Add)]),
            Err(VmError::StackUnderflow)
        );
    }

    #[test]
    fn test_store_pops_value_then_address() {
        let mut vm = machine(vec![]);
        vm.execute(
            &[Instruction::push(3), Instruction::push(99), op(Opcode::Store)],
            None,
        )
        .unwrap();
        assert_eq!(vm.load(3), Ok(99));
        assert_eq!(vm.sp(), 0);
    }

    #[test]
    fn test_load() {
        let mut vm = machine(vec![]);
        vm.store(7, -12).unwrap();
        vm.execute(&[Instruction::push(7), op(Opcode::Load)], None)
            .unwrap();
        assert_eq!(vm.stack(), &[-12]);
    }

    #[test]
    fn test_load_out_of_range() {
        let mut vm = machine(vec![]);
        let err = vm
            .execute(&[Instruction::push(64), op(Opcode::Load)], None)
            .unwrap_err();
        assert_eq!(
            err,
            VmError::InvalidAddress {
                addr: 64,
                capacity: 64
            }
        );
    }

    #[test]
    fn test_locals_without_frame() {
        assert_eq!(
            run_code(vec![Instruction::local_get(0)]),
            Err(VmError::NoLocalFrame)
        );
        assert_eq!(
            run_code(vec![Instruction::push(1), Instruction::local_set(0)]),
            Err(VmError::NoLocalFrame)
        );
    }

    #[test]
    fn test_locals_with_host_frame() {
        let mut vm = machine(vec![]);
        let mut frame = [0, 0];
        vm.execute(
            &[
                Instruction::push(42),
                Instruction::local_set(1),
                Instruction::local_get(1),
            ],
            Some(&mut frame),
        )
        .unwrap();
        assert_eq!(frame, [0, 42]);
        assert_eq!(vm.stack(), &[42]);
    }

    #[test]
    fn test_local_slot_out_of_range() {
        let mut vm = machine(vec![]);
        let mut frame = [0];
        let err = vm
            .execute(&[Instruction::local_get(1)], Some(&mut frame))
            .unwrap_err();
        assert_eq!(err, VmError::InvalidLocalIndex { index: 1, len: 1 });
    }

    #[test]
    fn test_unknown_opcode() {
        let err = run_code(vec![Instruction::new(2, 0, 0)]).unwrap_err();
        assert_eq!(err, VmError::UnknownOpcode(Instruction::new(2, 0, 0)));
    }

    #[test]
    fn test_top_level_return_stops_script() {
        let mut vm = machine(vec![]);
        let completion = vm
            .execute(
                &[
                    Instruction::push(1),
                    op(Opcode::Return),
                    Instruction::push(2),
                ],
                None,
            )
            .unwrap();
        assert_eq!(completion, Completion::Returned);
        assert_eq!(vm.stack(), &[1]);
    }

    #[test]
    fn test_call_scripted() {
        let mut vm = machine(vec![add_function()]);
        vm.execute(
            &[Instruction::push(5), Instruction::push(6), Instruction::call(0)],
            None,
        )
        .unwrap();
        assert_eq!(vm.stack(), &[11]);
    }

    #[test]
    fn test_call_binds_arguments_in_push_order() {
        let first = Function::scripted("first", 2, true, vec![Instruction::local_get(0)]);
        let mut vm = machine(vec![first]);
        vm.execute(
            &[Instruction::push(10), Instruction::push(20), Instruction::call(0)],
            None,
        )
        .unwrap();
        assert_eq!(vm.stack(), &[10]);
    }

    #[test]
    fn test_return_stops_at_call_boundary() {
        let early = Function::scripted(
            "early",
            0,
            true,
            vec![
                Instruction::push(7),
                op(Opcode::Return),
                Instruction::push(8),
            ],
        );
        let mut vm = machine(vec![early]);
        let completion = vm
            .execute(&[Instruction::call(0), Instruction::push(1)], None)
            .unwrap();
        // The caller keeps running after the callee returns
        assert_eq!(completion, Completion::FellThrough);
        assert_eq!(vm.stack(), &[7, 1]);
    }

    #[test]
    fn test_callee_frame_is_private() {
        // inner writes its own slot 0; outer's slot 0 must be untouched
        let inner = Function::scripted(
            "inner",
            1,
            false,
            vec![Instruction::push(-1), Instruction::local_set(0)],
        );
        let outer = Function::scripted(
            "outer",
            1,
            true,
            vec![
                Instruction::push(0),
                Instruction::call(0),
                Instruction::local_get(0),
            ],
        );
        let mut vm = machine(vec![inner, outer]);
        assert_eq!(vm.call(1, &[33]).unwrap(), Some(33));
        assert_eq!(vm.sp(), 0);
    }

    #[test]
    fn test_missing_return_value() {
        let silent = Function::scripted("silent", 0, true, vec![]);
        let mut vm = machine(vec![silent]);
        let err = vm.execute(&[Instruction::call(0)], None).unwrap_err();
        assert_eq!(err, VmError::MissingReturnValue("silent".to_string()));
    }

    #[test]
    fn test_callee_may_consume_caller_values() {
        // neg() = 0 - x, where x is left on the shared stack by the caller
        let neg = Function::scripted(
            "neg",
            0,
            true,
            vec![Instruction::push(0), op(Opcode::Sub)],
        );
        let mut vm = machine(vec![neg]);
        vm.execute(&[Instruction::push(7), Instruction::call(0)], None)
            .unwrap();
        assert_eq!(vm.stack(), &[-7]);
    }

    #[test]
    fn test_result_is_taken_from_top_of_shared_stack() {
        // The callee pushes nothing, so the caller's leftover value becomes its result
        let silent = Function::scripted("silent", 1, true, vec![]);
        let mut vm = machine(vec![silent]);
        vm.execute(
            &[Instruction::push(9), Instruction::push(1), Instruction::call(0)],
            None,
        )
        .unwrap();
        assert_eq!(vm.stack(), &[9]);
    }

    #[test]
    fn test_invalid_function_index() {
        let mut vm = machine(vec![add_function()]);
        let err = vm.execute(&[Instruction::call(1)], None).unwrap_err();
        assert_eq!(err, VmError::InvalidFunctionIndex { index: 1, len: 1 });

        let err = vm.execute(&[Instruction::call(-1)], None).unwrap_err();
        assert_eq!(err, VmError::InvalidFunctionIndex { index: -1, len: 1 });
    }

    #[test]
    fn test_call_with_too_few_values_underflows() {
        let mut vm = machine(vec![add_function()]);
        let err = vm
            .execute(&[Instruction::push(1), Instruction::call(0)], None)
            .unwrap_err();
        assert_eq!(err, VmError::StackUnderflow);
    }

    #[test]
    fn test_host_call_arity_mismatch() {
        let mut vm = machine(vec![add_function()]);
        let err = vm.call(0, &[1]).unwrap_err();
        assert_eq!(
            err,
            VmError::ArityMismatch {
                function: "add".to_string(),
                expected: 2,
                got: 1
            }
        );
        assert_eq!(vm.call(0, &[2, 3]).unwrap(), Some(5));
    }

    #[test]
    fn test_native_call() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let print = Function::native("print", 1, false, move |args, _| {
            sink.borrow_mut().push(args[0]);
            Ok(())
        });
        let mut vm = machine(vec![add_function(), print]);
        vm.execute(
            &[
                Instruction::push(5),
                Instruction::push(6),
                Instruction::call(0),
                Instruction::call(1),
            ],
            None,
        )
        .unwrap();
        assert_eq!(*seen.borrow(), vec![11]);
        assert_eq!(vm.sp(), 0);
        assert_eq!(vm.stats().native_calls, 1);
        assert_eq!(vm.stats().calls, 2);
    }

    #[test]
    fn test_native_result_and_errors() {
        let sub = Function::native("sub", 2, true, |args, ctx| ctx.push(args[0] - args[1]));
        let fail = Function::native("fail", 0, false, |_, _| Err(VmError::DivideByZero));
        let mut vm = machine(vec![sub, fail]);
        assert_eq!(vm.call(0, &[10, 4]).unwrap(), Some(6));
        assert_eq!(vm.call(1, &[]), Err(VmError::DivideByZero));
    }

    #[test]
    fn test_native_without_push_is_missing_return() {
        let lazy = Function::native("lazy", 0, true, |_, _| Ok(()));
        let mut vm = machine(vec![lazy]);
        assert_eq!(
            vm.call(0, &[]),
            Err(VmError::MissingReturnValue("lazy".to_string()))
        );
    }

    #[test]
    fn test_fault_propagates_through_nested_calls() {
        let bad = Function::scripted("bad", 0, true, vec![Instruction::new(99, 0, 0)]);
        let outer = Function::scripted("outer", 0, true, vec![Instruction::call(0)]);
        let mut vm = machine(vec![bad, outer]);
        let err = vm.call(1, &[]).unwrap_err();
        assert_eq!(err, VmError::UnknownOpcode(Instruction::new(99, 0, 0)));
    }

    /// Captures formatted log output for assertions.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn count(&self, needle: &str) -> usize {
            let bytes = self.0.lock().unwrap();
            String::from_utf8_lossy(&bytes).matches(needle).count()
        }
    }

    /// Run `f` with error-level logs captured, returning the buffer.
    fn capture_errors(f: impl FnOnce()) -> LogBuffer {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::ERROR)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        logs
    }

    #[test]
    fn test_diagnosed_faults_logged_at_each_call_boundary() {
        let logs = capture_errors(|| {
            let bad = Function::scripted("bad", 0, true, vec![Instruction::new(99, 0, 0)]);
            let outer = Function::scripted("outer", 0, true, vec![Instruction::call(0)]);
            let mut vm = machine(vec![bad, outer]);
            assert!(matches!(vm.call(1, &[]), Err(VmError::UnknownOpcode(_))));
        });
        assert_eq!(logs.count("call failed"), 2);
        assert_eq!(logs.count("function=bad"), 1);
        assert_eq!(logs.count("function=outer"), 1);

        let logs = capture_errors(|| {
            let silent = Function::scripted("silent", 0, true, vec![]);
            let outer = Function::scripted("outer", 0, true, vec![Instruction::call(0)]);
            let mut vm = machine(vec![silent, outer]);
            assert_eq!(
                vm.call(1, &[]),
                Err(VmError::MissingReturnValue("silent".to_string()))
            );
        });
        assert_eq!(logs.count("call failed"), 2);
    }

    #[test]
    fn test_undiagnosed_faults_are_not_logged() {
        let logs = capture_errors(|| {
            let div = Function::scripted(
                "div",
                0,
                true,
                vec![Instruction::push(0), Instruction::push(1), op(Opcode::Div)],
            );
            let outer = Function::scripted("outer", 0, true, vec![Instruction::call(0)]);
            let mut vm = machine(vec![div, outer]);
            assert_eq!(vm.call(1, &[]), Err(VmError::DivideByZero));
        });
        assert_eq!(logs.count("call failed"), 0);
    }

    #[test]
    fn test_stack_overflow() {
        let mut vm = Machine::new(vec![], 2, 1).unwrap();
        let err = vm
            .execute(
                &[
                    Instruction::push(1),
                    Instruction::push(2),
                    Instruction::push(3),
                ],
                None,
            )
            .unwrap_err();
        assert_eq!(err, VmError::StackOverflow { capacity: 2 });
        assert_eq!(vm.stack(), &[1, 2]);
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(
            Machine::new(vec![], 0, 10),
            Err(VmError::InvalidCapacity { stack: 0, heap: 10 })
        ));
        assert!(matches!(
            Machine::new(vec![], 10, 0),
            Err(VmError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_fuel_exhausted() {
        let config = MachineConfig {
            stack_capacity: 16,
            heap_capacity: 16,
            fuel: Some(3),
            ..MachineConfig::default()
        };
        let mut vm = Machine::with_config(vec![], &config).unwrap();
        let code = [
            Instruction::push(1),
            Instruction::push(2),
            op(Opcode::Add),
        ];
        vm.execute(&code, None).unwrap();

        // Fuel is re-armed per entry point
        vm.execute(&code, None).unwrap();

        let mut longer = code.to_vec();
        longer.push(Instruction::push(0));
        assert_eq!(
            vm.execute(&longer, None),
            Err(VmError::FuelExhausted { limit: 3 })
        );
    }

    #[test]
    fn test_unbounded_recursion_hits_depth_limit() {
        let forever = Function::scripted("forever", 0, false, vec![Instruction::call(0)]);
        let config = MachineConfig {
            stack_capacity: 16,
            heap_capacity: 16,
            max_call_depth: 50,
            ..MachineConfig::default()
        };
        let mut vm = Machine::with_config(vec![forever], &config).unwrap();
        assert_eq!(
            vm.call(0, &[]),
            Err(VmError::CallDepthExceeded { limit: 50 })
        );

        // Depth is reset for the next entry point
        assert_eq!(
            vm.call(0, &[]),
            Err(VmError::CallDepthExceeded { limit: 50 })
        );
    }

    #[test]
    fn test_stats() {
        let mut vm = machine(vec![add_function()]);
        vm.execute(
            &[Instruction::push(1), Instruction::push(2), Instruction::call(0)],
            None,
        )
        .unwrap();
        let stats = vm.stats();
        // 3 top-level instructions + 3 in the body of add
        assert_eq!(stats.instructions, 6);
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.native_calls, 0);
        assert_eq!(stats.max_stack_depth, 2);

        vm.reset_stats();
        assert_eq!(vm.stats(), &ExecStats::default());
    }

    #[test]
    fn test_stats_count_faulting_instruction() {
        let config = MachineConfig {
            stack_capacity: 16,
            heap_capacity: 16,
            fuel: Some(10),
            ..MachineConfig::default()
        };
        let mut vm = Machine::with_config(vec![], &config).unwrap();
        let err = vm
            .execute(&[Instruction::push(1), op(Opcode::Add)], None)
            .unwrap_err();
        assert_eq!(err, VmError::StackUnderflow);
        // The failing add consumed fuel, so it is counted too
        assert_eq!(vm.stats().instructions, 2);
        assert_eq!(vm.stats().max_stack_depth, 1);

        vm.reset_stats();
        let err = vm
            .execute(
                &[
                    Instruction::push(1),
                    Instruction::push(2),
                    Instruction::new(2, 0, 0),
                ],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, VmError::UnknownOpcode(_)));
        assert_eq!(vm.stats().instructions, 3);
        assert_eq!(vm.stats().max_stack_depth, 2);
    }

    #[test]
    fn test_function_index() {
        let vm = machine(vec![add_function()]);
        assert_eq!(vm.function_index("add"), Some(0));
        assert_eq!(vm.function_index("missing"), None);
        assert_eq!(vm.functions().len(), 1);
    }
}
