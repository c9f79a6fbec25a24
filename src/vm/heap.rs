use super::error::VmError;

// =============================================================================
// Flat heap
// =============================================================================
//
// A fixed array of integer cells addressed by the program. There is no
// allocator and nothing is ever reclaimed; addresses are chosen by the
// caller. Every access is bounds-checked.

/// Caller-addressed flat memory.
#[derive(Debug, Clone)]
pub struct Heap {
    cells: Box<[i32]>,
}

impl Heap {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: vec![0; capacity].into_boxed_slice(),
        }
    }

    #[inline(always)]
    fn index(&self, addr: i32) -> Result<usize, VmError> {
        usize::try_from(addr)
            .ok()
            .filter(|&index| index < self.cells.len())
            .ok_or(VmError::InvalidAddress {
                addr,
                capacity: self.cells.len(),
            })
    }

    pub fn load(&self, addr: i32) -> Result<i32, VmError> {
        let index = self.index(addr)?;
        Ok(self.cells[index])
    }

    pub fn store(&mut self, addr: i32, value: i32) -> Result<(), VmError> {
        let index = self.index(addr)?;
        self.cells[index] = value;
        Ok(())
    }
}
