use thiserror::Error;

use crate::compiler::CompileError;

pub mod call_frame;
pub mod instruction;
pub mod value;
pub mod vm;

pub use call_frame::CallFrame;
pub use vm::VM;

pub type Result<T> = std::result::Result<T, VMError>;

/// Everything that can stop the VM. The user-facing variants carry the
/// exact diagnostic text; the trailing variants are internal corruption
/// checks that a well-formed chunk never triggers.
#[derive(Debug, Error)]
pub enum VMError {
    #[error("Compile error")]
    CompileError(#[from] CompileError),

    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,

    #[error("Operand must be a number.")]
    OperandMustBeNumber,

    #[error("Operand must be two numbers or two strings.")]
    AddOperands,

    #[error("Can only call functions and classes.")]
    NotCallable,

    #[error("Only instances have properties.")]
    PropertyOnNonInstance,

    #[error("Only instances have fields.")]
    FieldOnNonInstance,

    #[error("Only instances have methods.")]
    MethodOnNonInstance,

    #[error("Superclass must be a class.")]
    SuperclassNotClass,

    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),

    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),

    #[error("Expected {expected} arguments but got {got}.")]
    Arity { expected: usize, got: usize },

    #[error("Stack overflow.")]
    StackOverflow,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Trying to access empty stack.")]
    EmptyStack,

    #[error("Trying to access empty list of call frames.")]
    NoCallFrame,

    #[error("Instruction pointer out of bounds.")]
    InstructionOutOfBounds,
}

impl VMError {
    /// Compile errors and runtime errors map to different process exit
    /// codes in the CLI.
    pub fn is_compile_error(&self) -> bool {
        matches!(self, VMError::CompileError(_))
    }
}
