use colored::*;
use std::fmt;

use super::Gc;
use crate::debug::LOG_OBJECT;
use crate::vm::value::Value;

mod bound_method;
mod class;
mod closure;
mod function;
mod instance;
mod native_fn;
mod string;
mod upvalue;

pub use bound_method::BoundMethod;
pub use class::Class;
pub use closure::Closure;
pub use function::Function;
pub use instance::Instance;
pub use native_fn::{NativeFn, NativeFunction};
pub use string::{hash_string, LoxString};
pub use upvalue::Upvalue;

/// Every kind of value that lives on the managed heap. A `Gc<Object>` is
/// the single reference type the rest of the interpreter passes around;
/// the variant is dispatched wherever the kind matters.
#[derive(Debug)]
pub enum Object {
    String(LoxString),
    Function(Function),
    Native(NativeFn),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

impl Drop for Object {
    fn drop(&mut self) {
        if LOG_OBJECT {
            println!("{}\tDROP: {:?}", "[OBJECT]".purple(), self);
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::String(v) => write!(f, "{}", v.data),
            Object::Function(v) => write!(f, "{}", v),
            Object::Native(_) => write!(f, "<native fn>"),
            Object::Closure(v) => write!(f, "{}", v.function.as_function()),
            Object::Upvalue(_) => write!(f, "upvalue"),
            Object::Class(v) => write!(f, "{}", v.name.as_string().data),
            Object::Instance(v) => {
                write!(f, "{} instance", v.class.as_class().name.as_string().data)
            }
            Object::BoundMethod(v) => write!(f, "{}", v.method.as_closure().function.as_function()),
        }
    }
}

impl Object {
    /// Approximate heap footprint, fed into the GC's allocation accounting.
    pub fn size(&self) -> usize {
        let extra = match self {
            Object::String(v) => v.data.capacity(),
            Object::Function(v) => {
                v.chunk.code.capacity() + v.chunk.constants.capacity() * std::mem::size_of::<Value>()
            }
            Object::Closure(v) => v.upvalues.capacity() * std::mem::size_of::<Gc<Object>>(),
            _ => 0,
        };
        std::mem::size_of::<Self>() + extra
    }

    pub fn as_string(&self) -> &LoxString {
        match self {
            Object::String(string) => string,
            _ => panic!("Expected string"),
        }
    }

    pub fn as_function(&self) -> &Function {
        match self {
            Object::Function(function) => function,
            _ => panic!("Expected function"),
        }
    }

    pub fn as_function_mut(&mut self) -> &mut Function {
        match self {
            Object::Function(function) => function,
            _ => panic!("Expected function"),
        }
    }

    pub fn as_closure(&self) -> &Closure {
        match self {
            Object::Closure(closure) => closure,
            _ => panic!("Expected closure"),
        }
    }

    pub fn as_closure_mut(&mut self) -> &mut Closure {
        match self {
            Object::Closure(closure) => closure,
            _ => panic!("Expected closure"),
        }
    }

    pub fn as_upvalue(&self) -> &Upvalue {
        match self {
            Object::Upvalue(upvalue) => upvalue,
            _ => panic!("Expected upvalue"),
        }
    }

    pub fn as_upvalue_mut(&mut self) -> &mut Upvalue {
        match self {
            Object::Upvalue(upvalue) => upvalue,
            _ => panic!("Expected upvalue"),
        }
    }

    pub fn as_class(&self) -> &Class {
        match self {
            Object::Class(class) => class,
            _ => panic!("Expected class"),
        }
    }

    pub fn as_class_mut(&mut self) -> &mut Class {
        match self {
            Object::Class(class) => class,
            _ => panic!("Expected class"),
        }
    }

    pub fn as_instance(&self) -> &Instance {
        match self {
            Object::Instance(instance) => instance,
            _ => panic!("Expected instance"),
        }
    }

    pub fn as_instance_mut(&mut self) -> &mut Instance {
        match self {
            Object::Instance(instance) => instance,
            _ => panic!("Expected instance"),
        }
    }
}
