use std::fmt;

/// Opcodes understood by the machine.
///
/// Binary and comparison opcodes pop the top of the stack first (`L`) and
/// the value beneath it second (`R`), then push `f(L, R)`. Pushing `X` then
/// `Y` and executing `Sub` yields `Y - X`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    // ========================================
    // Constants and memory
    // ========================================
    PushConst = 1,
    Load = 3,
    Store = 4,

    // ========================================
    // Calls and locals
    // ========================================
    Call = 5,
    LocalGet = 6,
    LocalSet = 7,
    Return = 8,

    // ========================================
    // Arithmetic and bitwise
    // ========================================
    Add = 9,
    Sub = 10,
    Mul = 11,
    Div = 12,
    And = 13,
    Or = 14,
    Xor = 15,
    Rem = 16,

    // ========================================
    // Comparison (push 1 or 0)
    // ========================================
    Eq = 17,
    Ne = 18,
    Lt = 19,
    Le = 20,
    Gt = 21,
    Ge = 22,

    // ========================================
    // Shifts
    // ========================================
    Shl = 23,
    Shr = 24,
}

impl Opcode {
    /// Mnemonic used in disassembly and diagnostics.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::PushConst => "push-const",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Call => "call",
            Opcode::LocalGet => "local-get",
            Opcode::LocalSet => "local-set",
            Opcode::Return => "return",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Rem => "rem",
            Opcode::Eq => "eq",
            Opcode::Ne => "ne",
            Opcode::Lt => "lt",
            Opcode::Le => "le",
            Opcode::Gt => "gt",
            Opcode::Ge => "ge",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
        }
    }

    /// Whether the instruction reads `arg0`.
    fn takes_operand(self) -> bool {
        matches!(
            self,
            Opcode::PushConst | Opcode::Call | Opcode::LocalGet | Opcode::LocalSet
        )
    }
}

impl TryFrom<i32> for Opcode {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        let op = match code {
            1 => Opcode::PushConst,
            3 => Opcode::Load,
            4 => Opcode::Store,
            5 => Opcode::Call,
            6 => Opcode::LocalGet,
            7 => Opcode::LocalSet,
            8 => Opcode::Return,
            9 => Opcode::Add,
            10 => Opcode::Sub,
            11 => Opcode::Mul,
            12 => Opcode::Div,
            13 => Opcode::And,
            14 => Opcode::Or,
            15 => Opcode::Xor,
            16 => Opcode::Rem,
            17 => Opcode::Eq,
            18 => Opcode::Ne,
            19 => Opcode::Lt,
            20 => Opcode::Le,
            21 => Opcode::Gt,
            22 => Opcode::Ge,
            23 => Opcode::Shl,
            24 => Opcode::Shr,
            other => return Err(other),
        };
        Ok(op)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A single fixed-width instruction: an opcode and two integer operands.
///
/// The opcode is kept as a raw integer so that sequences containing unknown
/// codes can still be built and are rejected only when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Instruction {
    pub opcode: i32,
    pub arg0: i32,
    pub arg1: i32,
}

impl Instruction {
    pub const fn new(opcode: i32, arg0: i32, arg1: i32) -> Self {
        Self { opcode, arg0, arg1 }
    }

    /// An instruction with no operands.
    pub const fn op(opcode: Opcode) -> Self {
        Self::new(opcode as i32, 0, 0)
    }

    /// An instruction with a single operand.
    pub const fn with_arg(opcode: Opcode, arg0: i32) -> Self {
        Self::new(opcode as i32, arg0, 0)
    }

    pub const fn push(value: i32) -> Self {
        Self::with_arg(Opcode::PushConst, value)
    }

    pub const fn call(index: i32) -> Self {
        Self::with_arg(Opcode::Call, index)
    }

    pub const fn local_get(slot: i32) -> Self {
        Self::with_arg(Opcode::LocalGet, slot)
    }

    pub const fn local_set(slot: i32) -> Self {
        Self::with_arg(Opcode::LocalSet, slot)
    }

    /// Decode the opcode, or `None` if it has no meaning.
    pub fn decode(&self) -> Option<Opcode> {
        Opcode::try_from(self.opcode).ok()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Some(op) if op.takes_operand() => write!(f, "{} {}", op, self.arg0),
            Some(op) => write!(f, "{}", op),
            None => write!(f, "?op={} ({}, {})", self.opcode, self.arg0, self.arg1),
        }
    }
}
