use std::fmt;

use super::{Gc, Object};
use crate::memory::GC;
use crate::vm::value::Value;

/// Type all native functions are expected to have. Natives receive the GC
/// so they can allocate (`tostring` interns its result); the argument
/// slice carries the argument count.
pub type NativeFunction = fn(&mut GC, &[Value]) -> crate::vm::Result<Value>;

/// A native function is a rust function that can be called from within lox.
#[derive(Clone)]
pub struct NativeFn {
    /// Name of the native function.
    pub name: Gc<Object>,

    /// The actual function to call.
    pub fun: NativeFunction,
}

impl NativeFn {
    pub fn new(name: Gc<Object>, fun: NativeFunction) -> Self {
        Self { name, fun }
    }

    pub fn function_name(&self) -> &str {
        &self.name.as_string().data
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.function_name())
    }
}
