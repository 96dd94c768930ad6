use super::{value::Value, Result, VMError};
use crate::memory::{Function, Gc, Object};

/// A per-call activation record: the closure being run, the instruction
/// pointer into its chunk and the stack slot the frame starts at (slot 0
/// holds the callee, or the receiver for methods).
#[derive(Clone)]
pub struct CallFrame {
    pub closure: Gc<Object>,
    pub(super) ip: usize,
    pub(super) stack_base: usize,
}

impl CallFrame {
    pub(super) fn new(closure: Gc<Object>, stack_base: usize) -> Self {
        Self {
            closure,
            ip: 0,
            stack_base,
        }
    }

    pub(super) fn next_instruction(&mut self) -> Result<u8> {
        self.ip += 1;
        self.code()
            .get(self.ip - 1)
            .copied()
            .ok_or(VMError::InstructionOutOfBounds)
    }

    pub(super) fn next_instruction_as_constant(&mut self) -> Result<Value> {
        let index = self.next_instruction()? as usize;
        self.constants()
            .get(index)
            .cloned()
            .ok_or(VMError::InstructionOutOfBounds)
    }

    /// Jumps are 16-bit big-endian operands.
    pub(super) fn next_instruction_as_jump(&mut self) -> Result<usize> {
        let b0 = self.next_instruction()? as usize;
        let b1 = self.next_instruction()? as usize;
        Ok(b0 << 8 | b1)
    }

    pub(super) fn function(&self) -> &Function {
        self.closure.as_closure().function.as_function()
    }

    pub(super) fn code(&self) -> &Vec<u8> {
        &self.function().chunk.code
    }

    pub(super) fn constants(&self) -> &Vec<Value> {
        &self.function().chunk.constants
    }

    /// Source line of the most recently read instruction byte, for
    /// runtime diagnostics.
    pub(super) fn line(&self) -> u64 {
        let offset = self.ip.saturating_sub(1);
        self.function().chunk.lines.get(offset).copied().unwrap_or(0)
    }
}
