use crate::memory::GC;
use crate::vm::value::Value;

/// Upvalue holds a reference to a stack variable used in a closure. This
/// allows closures to close over variables. When the variable is popped
/// off the stack the upvalue becomes closed and owns the value itself.
#[derive(Debug, Clone)]
pub enum Upvalue {
    /// An open upvalue points at a stack slot.
    Open(usize),

    /// A closed upvalue, holding the value lifted off the stack.
    Closed(Value),
}

impl Upvalue {
    pub fn new(stack_slot: usize) -> Self {
        Self::Open(stack_slot)
    }

    pub fn close(&mut self, value: Value) {
        *self = Upvalue::Closed(value);
    }

    pub fn is_open_at(&self, stack_slot: usize) -> bool {
        match self {
            Upvalue::Open(slot) => *slot == stack_slot,
            Upvalue::Closed(_) => false,
        }
    }

    pub fn as_open(&self) -> usize {
        match self {
            Upvalue::Open(slot) => *slot,
            Upvalue::Closed(_) => panic!("Expected open upvalue"),
        }
    }

    pub fn get(&self, gc: &GC) -> Value {
        match self {
            Upvalue::Open(slot) => gc.stack[*slot].clone(),
            Upvalue::Closed(value) => value.clone(),
        }
    }
}
