use super::error::VmError;

/// Fixed-capacity operand stack.
///
/// `sp` is the index of the next free slot. Popped slots are zeroed.
#[derive(Debug, Clone)]
pub struct Stack {
    slots: Box<[i32]>,
    sp: usize,
}

impl Stack {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0; capacity].into_boxed_slice(),
            sp: 0,
        }
    }

    /// Number of live values on the stack.
    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn push(&mut self, value: i32) -> Result<(), VmError> {
        let capacity = self.slots.len();
        let slot = self
            .slots
            .get_mut(self.sp)
            .ok_or(VmError::StackOverflow { capacity })?;
        *slot = value;
        self.sp += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<i32, VmError> {
        if self.sp == 0 {
            return Err(VmError::StackUnderflow);
        }
        self.sp -= 1;
        Ok(std::mem::take(&mut self.slots[self.sp]))
    }

    /// Pop `n` values and return them in push order (first pushed first).
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<i32>, VmError> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.pop()?);
        }
        values.reverse();
        Ok(values)
    }

    /// Live values, bottom first.
    pub fn as_slice(&self) -> &[i32] {
        &self.slots[..self.sp]
    }

    /// Raw cell, including slots above `sp`.
    pub fn slot(&self, index: usize) -> Option<i32> {
        self.slots.get(index).copied()
    }
}
