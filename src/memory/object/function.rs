use std::fmt;

use super::{Gc, Object};
use crate::compiler::chunk::Chunk;

/// A compiled function body. Created empty when the compiler starts on a
/// body; the chunk is final once the body ends.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: Option<Gc<Object>>,
    pub arity: usize,
    pub chunk: Chunk,
    pub num_upvalues: usize,
}

impl Function {
    /// The unnamed top-level script function.
    pub fn blank() -> Self {
        Self {
            name: None,
            arity: 0,
            chunk: Chunk::new(),
            num_upvalues: 0,
        }
    }

    pub fn new(name: Gc<Object>) -> Self {
        Self {
            name: Some(name),
            arity: 0,
            chunk: Chunk::new(),
            num_upvalues: 0,
        }
    }

    pub fn function_name(&self) -> &str {
        if let Some(object) = &self.name {
            &object.as_string().data
        } else {
            "script"
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "<fn {}>", name.as_string().data)
        } else {
            write!(f, "<script>")
        }
    }
}
