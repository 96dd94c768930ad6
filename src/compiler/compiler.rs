use colored::*;

use super::scanner::{Scanner, ScannerError};
use super::token::{Token, TokenKind};
use super::{CompileError, Result};
use crate::debug::{self, LOG_COMPILED_CODE, LOG_COMPILER};
use crate::memory::{Function, Gc, Object, GC};
use crate::vm::instruction::OpCode;
use crate::vm::value::Value;

/// One byte of operand addresses locals, upvalues and constants, and one
/// slot per function is reserved for the callee or receiver.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_CONSTANTS: usize = 256;
const MAX_JUMP: usize = u16::MAX as usize;
const MAX_ARITY: usize = 255;

#[derive(Debug)]
struct Local {
    name: Token,

    // The level of nesting for this local, 0 is the global scope and it
    // moves upwards. -1 marks a declared local whose initializer has not
    // finished yet.
    depth: i64,

    // If any closure has captured this local it must be closed over when
    // it goes out of scope, instead of just popped.
    is_captured: bool,
}

impl Local {
    fn new(name: Token, depth: i64) -> Self {
        Self {
            name,
            depth,
            is_captured: false,
        }
    }
}

#[derive(Debug)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

impl Upvalue {
    fn new(index: u8, is_local: bool) -> Self {
        Self { index, is_local }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// Compilation state for a single function body. These are stacked as
/// function declarations nest; the stack lives in the GC so the functions
/// being built count as roots.
#[derive(Debug)]
pub struct FunctionState {
    pub function: Function,
    function_kind: FunctionKind,
    locals: Vec<Local>,
    scope_depth: i64,
    upvalues: Vec<Upvalue>,
}

impl FunctionState {
    fn script() -> Self {
        Self {
            function: Function::blank(),
            function_kind: FunctionKind::Script,
            // Slot 0 belongs to the script function itself.
            locals: vec![Local::new(Token::new_empty(), 0)],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }

    fn new(name: Gc<Object>, function_kind: FunctionKind) -> Self {
        // Slot 0 holds the callee, or the receiver inside methods where
        // it is reachable as `this`.
        let slot_zero = match function_kind {
            FunctionKind::Method | FunctionKind::Initializer => Token::synthetic("this"),
            _ => Token::new_empty(),
        };
        Self {
            function: Function::new(name),
            function_kind,
            locals: vec![Local::new(slot_zero, 0)],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }

    fn error(line: u64, message: &'static str) -> CompileError {
        CompileError::ParseError {
            line,
            location: String::new(),
            message,
        }
    }

    fn emit_raw(&mut self, byte: u8, line: u64) {
        if LOG_COMPILER {
            println!("{}\t[EMIT]\t\t[BYTE]: {}", "[COMPILER]".blue().bold(), byte);
        }
        self.function.chunk.write_byte(byte, line);
    }

    fn emit_byte(&mut self, op_code: OpCode, line: u64) {
        if LOG_COMPILER {
            println!("{}\t[EMIT]\t\t{}", "[COMPILER]".blue().bold(), op_code);
        }
        self.function.chunk.write(op_code, line);
    }

    fn emit_bytes(&mut self, op_code: OpCode, index: u8, line: u64) {
        if LOG_COMPILER {
            println!(
                "{}\t[EMIT]\t\t{} -> {}",
                "[COMPILER]".blue().bold(),
                op_code,
                index
            );
        }
        self.function.chunk.write_index(op_code, index, line);
    }

    /// Implicit return: initializers always return the instance in slot 0,
    /// everything else returns nil.
    fn emit_return(&mut self, line: u64) {
        if self.function_kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal, 0, line);
        } else {
            self.emit_byte(OpCode::Nil, line);
        }
        self.emit_byte(OpCode::Return, line);
    }

    /// Emits a forward jump with a two byte placeholder, returning the
    /// offset to patch once the target is known.
    fn emit_jump(&mut self, op_code: OpCode, line: u64) -> usize {
        if LOG_COMPILER {
            println!("{}\t[EMIT JMP]\t{}", "[COMPILER]".blue().bold(), op_code);
        }
        self.function.chunk.write(op_code, line);
        self.function.chunk.write_byte(0xff, line);
        self.function.chunk.write_byte(0xff, line);
        self.function.chunk.code.len() - 2
    }

    /// Emits a backwards jump to `loop_start`. The operand is the positive
    /// distance the VM subtracts from its instruction pointer.
    fn emit_loop(&mut self, loop_start: usize, line: u64) -> Result<()> {
        self.emit_byte(OpCode::Loop, line);

        // Skip over the two offset bytes themselves as well.
        let offset = self.function.chunk.code.len() - loop_start + 2;
        if offset > MAX_JUMP {
            Err(Self::error(line, "Loop body too large."))
        } else {
            self.function.chunk.write_byte((offset >> 8) as u8, line);
            self.function.chunk.write_byte((offset & 0xff) as u8, line);
            Ok(())
        }
    }

    /// Overwrites the placeholder at `offset` with the distance from the
    /// placeholder to the current end of the chunk.
    fn patch_jump(&mut self, offset: usize, line: u64) -> Result<()> {
        // Adjust by -2 to account for the size of the jump bytes.
        let jump = self.function.chunk.code.len() - offset - 2;
        if jump > MAX_JUMP {
            Err(Self::error(line, "Too much code to jump over."))
        } else {
            self.function.chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
            self.function.chunk.code[offset + 1] = (jump & 0xff) as u8;
            Ok(())
        }
    }

    fn resolve_local(&self, token: &Token) -> Result<Option<u8>> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if token.data == local.name.data {
                if local.depth == -1 {
                    return Err(CompileError::ParseError {
                        line: token.line,
                        location: format!(" at '{}'", token.data),
                        message: "Cannot read local variable in its own initializer.",
                    });
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool, line: u64) -> Result<u8> {
        // Closing over the same variable twice reuses the first capture.
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }

        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(Self::error(line, "Too many closure variables in function."));
        }
        self.upvalues.push(Upvalue::new(index, is_local));
        self.function.num_upvalues = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Tracks class nesting so `this` and `super` can be validated at compile
/// time.
struct ClassState {
    has_superclass: bool,
}

/// Single-pass compiler: a Pratt parser that emits bytecode as it goes.
/// There is no AST; scope resolution, jump patching and method binding all
/// happen while the tokens stream past.
pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    parser: Parser,

    gc: &'src mut GC,
    classes: Vec<ClassState>,
    errors: Vec<CompileError>,
}

impl<'src> Compiler<'src> {
    pub fn new(source: &'src str, gc: &'src mut GC) -> Self {
        Self {
            gc,
            parser: Parser::new(),
            scanner: Scanner::new(source),
            classes: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Compiles the whole source to a single script function. All errors
    /// encountered are reported to stderr; any error means no function.
    pub fn compile(mut self) -> Result<Gc<Object>> {
        self.advance();

        self.gc.functions.push(FunctionState::script());

        loop {
            match self.match_token(TokenKind::EOF) {
                Ok(true) => break,
                Ok(false) => {
                    if let Err(err) = self.decl() {
                        // Could not even synchronize; give up on the rest.
                        self.errors.push(err);
                        break;
                    }
                }
                Err(err) => {
                    self.errors.push(err);
                    break;
                }
            }
        }

        let line = self.parser.line();
        self.state().emit_return(line);

        // Track the script function while its constants are still rooted
        // through the compiler state.
        let function = self.gc.functions.last().unwrap().function.clone();
        let function = self.gc.track(Object::Function(function));
        self.gc.functions.pop();

        if !self.errors.is_empty() {
            for error in self.errors.iter() {
                eprintln!("{}", error);
            }
            Err(CompileError::Collected(self.errors))
        } else {
            if LOG_COMPILED_CODE {
                let function = function.as_function();
                debug::disassemble_chunk(&function.chunk, function.function_name());
            }
            Ok(function)
        }
    }

    /// The innermost function being compiled.
    fn state(&mut self) -> &mut FunctionState {
        self.gc.functions.last_mut().unwrap()
    }

    fn state_ref(&self) -> &FunctionState {
        self.gc.functions.last().unwrap()
    }

    /// Scan the next token. Scan errors are collected and scanning
    /// continues, so the parser always ends up with a current token.
    fn advance(&mut self) {
        std::mem::swap(&mut self.parser.previous, &mut self.parser.current);

        loop {
            match self.scanner.scan_token() {
                Ok(token) => {
                    if LOG_COMPILER {
                        println!("{}\t[ADVANCE]\t{:?}", "[COMPILER]".blue(), token);
                    }
                    self.parser.current = Some(token);
                    return;
                }
                Err(err) => {
                    self.errors.push(Self::scan_error(&err));
                }
            }
        }
    }

    fn scan_error(err: &ScannerError) -> CompileError {
        let message = match err {
            ScannerError::UnterminatedString { .. } => "Unterminated string.",
            ScannerError::UnexpectedCharacter { .. } => "Unexpected character.",
        };
        CompileError::ParseError {
            line: err.line(),
            location: String::new(),
            message,
        }
    }

    fn error_at(token: Option<&Token>, message: &'static str) -> CompileError {
        match token {
            Some(token) if token.kind == TokenKind::EOF => CompileError::ParseError {
                line: token.line,
                location: " at end".to_owned(),
                message,
            },
            Some(token) => CompileError::ParseError {
                line: token.line,
                location: format!(" at '{}'", token.data),
                message,
            },
            None => CompileError::ParseError {
                line: 0,
                location: String::new(),
                message,
            },
        }
    }

    fn error_at_previous(&self, message: &'static str) -> CompileError {
        Self::error_at(self.parser.previous.as_ref(), message)
    }

    fn error_at_current(&self, message: &'static str) -> CompileError {
        Self::error_at(self.parser.current.as_ref(), message)
    }

    fn match_token(&mut self, kind: TokenKind) -> Result<bool> {
        if self.parser.check_current(kind)? {
            self.advance();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, expected: TokenKind, message: &'static str) -> Result<()> {
        if self.parser.check_current(expected)? {
            self.advance();
            Ok(())
        } else {
            Err(self.error_at_current(message))
        }
    }

    /// Parses one declaration, entering panic mode on error: the error is
    /// recorded once and tokens are skipped to the next statement boundary.
    fn decl(&mut self) -> Result<()> {
        if let Err(err) = self.declaration() {
            if LOG_COMPILER {
                println!("{}\t[ERROR]   {}", "[COMPILER]".red(), err);
            }
            self.errors.push(err);
            self.synchronize()?;
        }
        Ok(())
    }

    /// Skip tokens until something that looks like a statement boundary.
    fn synchronize(&mut self) -> Result<()> {
        loop {
            if self.parser.previous()?.kind == TokenKind::Semicolon {
                return Ok(());
            }

            match self.parser.current()?.kind {
                TokenKind::EOF
                | TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return Ok(()),
                _ => {}
            }

            self.advance();
        }
    }

    fn declaration(&mut self) -> Result<()> {
        if self.match_token(TokenKind::Class)? {
            self.class_declaration()
        } else if self.match_token(TokenKind::Fun)? {
            self.fun_declaration()
        } else if self.match_token(TokenKind::Var)? {
            self.var_declaration()
        } else {
            self.statement()
        }
    }

    fn class_declaration(&mut self) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect class name.")?;
        let class_name = self.parser.previous()?.clone();
        let name_constant = self.identifier_constant(class_name.data.clone())?;
        self.declare_variable()?;

        let line = self.parser.line();
        self.state().emit_bytes(OpCode::Class, name_constant, line);
        self.define_variable(name_constant)?;

        self.classes.push(ClassState {
            has_superclass: false,
        });
        let body = self.class_body(&class_name);
        let had_superclass = self.classes.pop().map(|c| c.has_superclass).unwrap_or(false);
        body?;

        if had_superclass {
            // Close the scope holding the `super` local.
            self.scope_leave()?;
        }
        Ok(())
    }

    fn class_body(&mut self, class_name: &Token) -> Result<()> {
        if self.match_token(TokenKind::Less)? {
            self.consume(TokenKind::Identifier, "Expect superclass name.")?;
            // Push the superclass value.
            self.variable(false)?;

            if self.parser.previous()?.data == class_name.data {
                return Err(self.error_at_previous("A class cannot inherit from itself."));
            }

            // Bind the superclass to a `super` local in a scope enclosing
            // all the methods, so their upvalue resolution can find it.
            self.scope_enter();
            self.add_local(Token::synthetic("super"))?;
            self.define_variable(0)?;

            self.named_variable(class_name.clone(), false)?;
            let line = self.parser.line();
            self.state().emit_byte(OpCode::Inherit, line);
            self.classes.last_mut().ok_or(CompileError::TokenNotFound)?.has_superclass = true;
        }

        // The class value is left on the stack while the methods bind to it.
        self.named_variable(class_name.clone(), false)?;

        self.consume(TokenKind::BraceLeft, "Expect '{' before class body.")?;
        loop {
            let done = self.parser.check_current(TokenKind::BraceRight)?
                || self.parser.check_current(TokenKind::EOF)?;
            if done {
                break;
            }
            self.method()?;
        }
        self.consume(TokenKind::BraceRight, "Expect '}' after class body.")?;

        let line = self.parser.line();
        self.state().emit_byte(OpCode::Pop, line);
        Ok(())
    }

    fn method(&mut self) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect method name.")?;
        let name = self.parser.previous()?.data.clone();
        let constant = self.identifier_constant(name.clone())?;

        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind)?;

        let line = self.parser.line();
        self.state().emit_bytes(OpCode::Method, constant, line);
        Ok(())
    }

    fn fun_declaration(&mut self) -> Result<()> {
        let global = self.parse_variable("Expect function name.")?;
        // A function may refer to itself; it is initialized as soon as its
        // name is known.
        self.mark_local_initialized();
        self.function(FunctionKind::Function)?;
        self.define_variable(global)
    }

    fn function(&mut self, kind: FunctionKind) -> Result<()> {
        let state = {
            let name = self.parser.previous()?.data.clone();
            let name = self.gc.intern(name);
            FunctionState::new(name, kind)
        };
        self.gc.functions.push(state);
        self.scope_enter();

        if let Err(err) = self.function_params_and_body() {
            // Keep the state stack balanced for the enclosing function.
            self.gc.functions.pop();
            return Err(err);
        }

        let line = self.parser.line();
        self.state().emit_return(line);

        // Track the finished function while its constants are still rooted
        // through the state, then pop the state.
        let function = self.state_ref().function.clone();
        let function = self.gc.track(Object::Function(function));
        let state = self.gc.functions.pop().unwrap();

        if LOG_COMPILED_CODE {
            debug::disassemble_chunk(&state.function.chunk, state.function.function_name());
        }

        let index = self.add_constant(function.into())?;
        let line = self.parser.line();
        let enclosing = self.state();
        enclosing.emit_bytes(OpCode::Closure, index, line);
        for upvalue in state.upvalues.iter() {
            enclosing.emit_raw(if upvalue.is_local { 1 } else { 0 }, line);
            enclosing.emit_raw(upvalue.index, line);
        }
        Ok(())
    }

    fn function_params_and_body(&mut self) -> Result<()> {
        self.consume(TokenKind::ParenLeft, "Expect '(' after function name.")?;
        if !self.parser.check_current(TokenKind::ParenRight)? {
            loop {
                if self.state_ref().function.arity >= MAX_ARITY {
                    return Err(self.error_at_current("Cannot have more than 255 parameters."));
                }
                self.state().function.arity += 1;

                let constant = self.parse_variable("Expect parameter name.")?;
                self.define_variable(constant)?;

                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::ParenRight, "Expect ')' after parameters.")?;

        self.consume(TokenKind::BraceLeft, "Expect '{' before function body.")?;
        self.block()
    }

    fn var_declaration(&mut self) -> Result<()> {
        let global = self.parse_variable("Expect variable name.")?;

        if self.match_token(TokenKind::Equal)? {
            self.expression()?;
        } else {
            let line = self.parser.line();
            self.state().emit_byte(OpCode::Nil, line);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.")?;

        self.define_variable(global)
    }

    fn parse_variable(&mut self, message: &'static str) -> Result<u8> {
        self.consume(TokenKind::Identifier, message)?;

        self.declare_variable()?;
        if self.state_ref().scope_depth > 0 {
            return Ok(0);
        }

        let name = self.parser.previous()?.data.clone();
        self.identifier_constant(name)
    }

    fn declare_variable(&mut self) -> Result<()> {
        // Global variables are implicitly declared.
        if self.state_ref().scope_depth == 0 {
            return Ok(());
        }

        let name = self.parser.previous()?.clone();
        let state = self.state_ref();
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if name.data == local.name.data {
                return Err(
                    self.error_at_previous("Already a variable with this name in this scope.")
                );
            }
        }

        self.add_local(name)
    }

    fn add_local(&mut self, name: Token) -> Result<()> {
        if self.state_ref().locals.len() >= MAX_LOCALS {
            return Err(self.error_at_previous("Too many local variables in function."));
        }
        self.state().locals.push(Local::new(name, -1));
        Ok(())
    }

    fn mark_local_initialized(&mut self) {
        let state = self.state();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        state.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, index: u8) -> Result<()> {
        if self.state_ref().scope_depth > 0 {
            self.mark_local_initialized();
            return Ok(());
        }
        let line = self.parser.line();
        self.state().emit_bytes(OpCode::DefineGlobal, index, line);
        Ok(())
    }

    /// Adds a constant to the current chunk, keeping the value rooted on
    /// the VM stack while the pool grows.
    fn add_constant(&mut self, constant: Value) -> Result<u8> {
        self.gc.stack.push(constant.clone());
        let index = self.state().function.chunk.add_constant(constant);
        self.gc.stack.pop();

        if index >= MAX_CONSTANTS {
            Err(self.error_at_previous("Too many constants in one chunk."))
        } else {
            Ok(index as u8)
        }
    }

    fn identifier_constant(&mut self, name: String) -> Result<u8> {
        let name = self.gc.intern(name);
        self.add_constant(name.into())
    }

    fn resolve_local(&self, token: &Token) -> Result<Option<u8>> {
        self.state_ref().resolve_local(token)
    }

    /// Resolves `token` as a captured variable of the function at
    /// `state_index`, adding upvalues along the enclosing chain as needed.
    fn resolve_upvalue(&mut self, state_index: usize, token: &Token) -> Result<Option<u8>> {
        if state_index == 0 {
            return Ok(None);
        }
        let prev_index = state_index - 1;

        // See if the enclosing function has a local we want to capture.
        if let Some(local_index) = self.gc.functions[prev_index].resolve_local(token)? {
            self.gc.functions[prev_index].locals[local_index as usize].is_captured = true;
            let upvalue = self.gc.functions[state_index].add_upvalue(local_index, true, token.line)?;
            return Ok(Some(upvalue));
        }

        // Otherwise the variable may be an upvalue further out.
        if let Some(outer_index) = self.resolve_upvalue(prev_index, token)? {
            let upvalue = self.gc.functions[state_index].add_upvalue(outer_index, false, token.line)?;
            return Ok(Some(upvalue));
        }

        Ok(None)
    }

    fn named_variable(&mut self, token: Token, can_assign: bool) -> Result<()> {
        let (arg, set_op, get_op) = if let Some(arg) = self.resolve_local(&token)? {
            (arg, OpCode::SetLocal, OpCode::GetLocal)
        } else if let Some(arg) = self.resolve_upvalue(self.gc.functions.len() - 1, &token)? {
            (arg, OpCode::SetUpvalue, OpCode::GetUpvalue)
        } else {
            let arg = self.identifier_constant(token.data.clone())?;
            (arg, OpCode::SetGlobal, OpCode::GetGlobal)
        };

        if can_assign && self.match_token(TokenKind::Equal)? {
            self.expression()?;
            let line = self.parser.line();
            self.state().emit_bytes(set_op, arg, line);
        } else {
            let line = self.parser.line();
            self.state().emit_bytes(get_op, arg, line);
        }
        Ok(())
    }

    fn statement(&mut self) -> Result<()> {
        if self.match_token(TokenKind::Print)? {
            self.print_statement()
        } else if self.match_token(TokenKind::If)? {
            self.if_statement()
        } else if self.match_token(TokenKind::Return)? {
            self.return_statement()
        } else if self.match_token(TokenKind::While)? {
            self.while_statement()
        } else if self.match_token(TokenKind::For)? {
            self.for_statement()
        } else if self.match_token(TokenKind::BraceLeft)? {
            self.scope_enter();
            self.block()?;
            self.scope_leave()
        } else {
            self.expression_statement()
        }
    }

    fn print_statement(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after value.")?;
        let line = self.parser.line();
        self.state().emit_byte(OpCode::Print, line);
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.")?;
        let line = self.parser.line();
        self.state().emit_byte(OpCode::Pop, line);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<()> {
        if self.state_ref().function_kind == FunctionKind::Script {
            return Err(self.error_at_previous("Cannot return from top-level code."));
        }

        if self.match_token(TokenKind::Semicolon)? {
            let line = self.parser.line();
            self.state().emit_return(line);
            Ok(())
        } else {
            if self.state_ref().function_kind == FunctionKind::Initializer {
                return Err(self.error_at_previous("Cannot return a value from an initializer."));
            }
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.")?;
            let line = self.parser.line();
            self.state().emit_byte(OpCode::Return, line);
            Ok(())
        }
    }

    fn if_statement(&mut self) -> Result<()> {
        self.consume(TokenKind::ParenLeft, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after condition.")?;

        let line = self.parser.line();
        let then_jump = self.state().emit_jump(OpCode::JumpIfFalse, line);
        // Pop the condition in the then branch.
        self.state().emit_byte(OpCode::Pop, line);
        self.statement()?;

        let line = self.parser.line();
        let else_jump = self.state().emit_jump(OpCode::Jump, line);
        self.state().patch_jump(then_jump, line)?;
        // Pop the condition in the else branch.
        self.state().emit_byte(OpCode::Pop, line);

        if self.match_token(TokenKind::Else)? {
            self.statement()?;
        }
        let line = self.parser.line();
        self.state().patch_jump(else_jump, line)
    }

    fn while_statement(&mut self) -> Result<()> {
        let loop_start = self.state_ref().function.chunk.code.len();

        self.consume(TokenKind::ParenLeft, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after condition.")?;

        let line = self.parser.line();
        let exit_jump = self.state().emit_jump(OpCode::JumpIfFalse, line);
        self.state().emit_byte(OpCode::Pop, line);

        self.statement()?;
        let line = self.parser.line();
        self.state().emit_loop(loop_start, line)?;

        self.state().patch_jump(exit_jump, line)?;
        self.state().emit_byte(OpCode::Pop, line);
        Ok(())
    }

    /// `for` is pure desugaring over while-shaped jumps. The increment
    /// clause compiles before the body in the bytecode, so the body jumps
    /// are threaded: condition -> body -> increment -> condition.
    fn for_statement(&mut self) -> Result<()> {
        self.scope_enter();
        self.consume(TokenKind::ParenLeft, "Expect '(' after 'for'.")?;

        // Initializer clause.
        if self.match_token(TokenKind::Semicolon)? {
            // No initializer.
        } else if self.match_token(TokenKind::Var)? {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        // Condition clause.
        let mut loop_start = self.state_ref().function.chunk.code.len();
        let exit_jump = if self.match_token(TokenKind::Semicolon)? {
            None
        } else {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.")?;

            let line = self.parser.line();
            let exit_jump = self.state().emit_jump(OpCode::JumpIfFalse, line);
            self.state().emit_byte(OpCode::Pop, line);
            Some(exit_jump)
        };

        // Increment clause.
        if !self.match_token(TokenKind::ParenRight)? {
            let line = self.parser.line();
            let body_jump = self.state().emit_jump(OpCode::Jump, line);
            let increment_start = self.state_ref().function.chunk.code.len();

            self.expression()?;
            let line = self.parser.line();
            self.state().emit_byte(OpCode::Pop, line);
            self.consume(TokenKind::ParenRight, "Expect ')' after for clauses.")?;

            self.state().emit_loop(loop_start, line)?;
            loop_start = increment_start;
            self.state().patch_jump(body_jump, line)?;
        }

        self.statement()?;

        let line = self.parser.line();
        self.state().emit_loop(loop_start, line)?;
        if let Some(exit_jump) = exit_jump {
            self.state().patch_jump(exit_jump, line)?;
            self.state().emit_byte(OpCode::Pop, line);
        }
        self.scope_leave()
    }

    fn scope_enter(&mut self) {
        self.state().scope_depth += 1;
    }

    fn scope_leave(&mut self) -> Result<()> {
        let line = self.parser.line();
        let state = self.state();
        state.scope_depth -= 1;
        while let Some(local) = state.locals.last() {
            if local.depth <= state.scope_depth {
                break;
            }
            if local.is_captured {
                state.emit_byte(OpCode::CloseUpvalue, line);
            } else {
                state.emit_byte(OpCode::Pop, line);
            }
            state.locals.pop();
        }
        Ok(())
    }

    fn block(&mut self) -> Result<()> {
        loop {
            let done = self.parser.check_current(TokenKind::BraceRight)?
                || self.parser.check_current(TokenKind::EOF)?;
            if done {
                break;
            }
            self.decl()?;
        }
        self.consume(TokenKind::BraceRight, "Expect '}' after block.")
    }

    fn expression(&mut self) -> Result<()> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn grouping(&mut self, _can_assign: bool) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after expression.")
    }

    fn number(&mut self, _can_assign: bool) -> Result<()> {
        let value = self.parser.previous()?.data.parse::<f64>()?;
        let index = self.add_constant(Value::Number(value))?;
        let line = self.parser.line();
        self.state().emit_bytes(OpCode::Constant, index, line);
        Ok(())
    }

    fn string(&mut self, _can_assign: bool) -> Result<()> {
        let src_str = &self.parser.previous()?.data;
        // Skip " at beginning and end.
        let string = src_str[1..src_str.len() - 1].to_owned();
        let string = self.gc.intern(string);
        let index = self.add_constant(string.into())?;
        let line = self.parser.line();
        self.state().emit_bytes(OpCode::Constant, index, line);
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> Result<()> {
        let token = self.parser.previous()?.clone();
        self.named_variable(token, can_assign)
    }

    fn this_(&mut self, _can_assign: bool) -> Result<()> {
        if self.classes.is_empty() {
            return Err(self.error_at_previous("Cannot use 'this' outside of a class."));
        }
        // `this` is the reserved slot 0 local of the enclosing method.
        self.variable(false)
    }

    fn super_(&mut self, _can_assign: bool) -> Result<()> {
        if self.classes.is_empty() {
            return Err(self.error_at_previous("Cannot use 'super' outside of a class."));
        } else if !self.classes.last().unwrap().has_superclass {
            return Err(self.error_at_previous("Cannot use 'super' in a class with no superclass."));
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.")?;
        self.consume(TokenKind::Identifier, "Expect superclass method name.")?;
        let name = self.parser.previous()?.data.clone();
        let name = self.identifier_constant(name)?;

        // The receiver and the captured superclass both go on the stack
        // for GetSuper / SuperInvoke.
        self.named_variable(Token::synthetic("this"), false)?;
        if self.match_token(TokenKind::ParenLeft)? {
            let arg_count = self.argument_list()?;
            self.named_variable(Token::synthetic("super"), false)?;
            let line = self.parser.line();
            self.state().emit_bytes(OpCode::SuperInvoke, name, line);
            self.state().emit_raw(arg_count, line);
        } else {
            self.named_variable(Token::synthetic("super"), false)?;
            let line = self.parser.line();
            self.state().emit_bytes(OpCode::GetSuper, name, line);
        }
        Ok(())
    }

    fn dot(&mut self, can_assign: bool) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.")?;
        let name = self.parser.previous()?.data.clone();
        let name = self.identifier_constant(name)?;

        if can_assign && self.match_token(TokenKind::Equal)? {
            self.expression()?;
            let line = self.parser.line();
            self.state().emit_bytes(OpCode::SetProperty, name, line);
        } else if self.match_token(TokenKind::ParenLeft)? {
            // Fused property call: skips allocating a bound method.
            let arg_count = self.argument_list()?;
            let line = self.parser.line();
            self.state().emit_bytes(OpCode::Invoke, name, line);
            self.state().emit_raw(arg_count, line);
        } else {
            let line = self.parser.line();
            self.state().emit_bytes(OpCode::GetProperty, name, line);
        }
        Ok(())
    }

    fn unary(&mut self, _can_assign: bool) -> Result<()> {
        let operator_kind = self.parser.previous()?.kind;
        self.parse_precedence(Precedence::Unary)?;

        let line = self.parser.line();
        match operator_kind {
            TokenKind::Minus => self.state().emit_byte(OpCode::Negate, line),
            TokenKind::Bang => self.state().emit_byte(OpCode::Not, line),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn binary(&mut self, _can_assign: bool) -> Result<()> {
        let operator_kind = self.parser.previous()?.kind;

        // Compile the right operand, binding tighter than this operator.
        let precedence = Self::get_rule(operator_kind).precedence.higher();
        self.parse_precedence(precedence)?;

        let line = self.parser.line();
        let state = self.state();
        match operator_kind {
            TokenKind::Plus => state.emit_byte(OpCode::Add, line),
            TokenKind::Minus => state.emit_byte(OpCode::Subtract, line),
            TokenKind::Star => state.emit_byte(OpCode::Multiply, line),
            TokenKind::Slash => state.emit_byte(OpCode::Divide, line),
            TokenKind::EqualEqual => state.emit_byte(OpCode::Equal, line),
            TokenKind::Greater => state.emit_byte(OpCode::Greater, line),
            TokenKind::Less => state.emit_byte(OpCode::Less, line),
            TokenKind::BangEqual => {
                state.emit_byte(OpCode::Equal, line);
                state.emit_byte(OpCode::Not, line);
            }
            TokenKind::GreaterEqual => {
                state.emit_byte(OpCode::Less, line);
                state.emit_byte(OpCode::Not, line);
            }
            TokenKind::LessEqual => {
                state.emit_byte(OpCode::Greater, line);
                state.emit_byte(OpCode::Not, line);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn literal(&mut self, _can_assign: bool) -> Result<()> {
        let kind = self.parser.previous()?.kind;
        let line = self.parser.line();
        match kind {
            TokenKind::Nil => self.state().emit_byte(OpCode::Nil, line),
            TokenKind::True => self.state().emit_byte(OpCode::True, line),
            TokenKind::False => self.state().emit_byte(OpCode::False, line),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// `and` short-circuits: if the left side is falsey it stays on the
    /// stack as the result, jumping over the right side.
    fn and_(&mut self, _can_assign: bool) -> Result<()> {
        let line = self.parser.line();
        let end_jump = self.state().emit_jump(OpCode::JumpIfFalse, line);
        self.state().emit_byte(OpCode::Pop, line);

        self.parse_precedence(Precedence::And)?;
        let line = self.parser.line();
        self.state().patch_jump(end_jump, line)
    }

    /// `or` short-circuits through a pair of jumps: falsey falls through
    /// to the right side, truthy jumps over it.
    fn or_(&mut self, _can_assign: bool) -> Result<()> {
        let line = self.parser.line();
        let else_jump = self.state().emit_jump(OpCode::JumpIfFalse, line);
        let end_jump = self.state().emit_jump(OpCode::Jump, line);

        self.state().patch_jump(else_jump, line)?;
        self.state().emit_byte(OpCode::Pop, line);

        self.parse_precedence(Precedence::Or)?;
        let line = self.parser.line();
        self.state().patch_jump(end_jump, line)
    }

    fn call(&mut self, _can_assign: bool) -> Result<()> {
        let arg_count = self.argument_list()?;
        let line = self.parser.line();
        self.state().emit_bytes(OpCode::Call, arg_count, line);
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8> {
        let mut arg_count: usize = 0;
        if !self.parser.check_current(TokenKind::ParenRight)? {
            loop {
                if arg_count >= MAX_ARITY {
                    return Err(self.error_at_current("Cannot have more than 255 arguments."));
                }
                self.expression()?;
                arg_count += 1;
                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }

        self.consume(TokenKind::ParenRight, "Expect ')' after arguments.")?;
        Ok(arg_count as u8)
    }

    fn get_rule(kind: TokenKind) -> ParseRule<'src> {
        Self::RULES_TABLE[kind as usize]
    }

    /// The precedence climbing loop: dispatch the prefix rule for the
    /// token just consumed, then fold infix rules while their precedence
    /// binds at least as tightly as `precedence`.
    fn parse_precedence(&mut self, precedence: Precedence) -> Result<()> {
        self.advance();

        let rule = Self::get_rule(self.parser.previous()?.kind);
        let prefix_rule = match rule.prefix {
            Some(rule) => rule,
            None => return Err(self.error_at_previous("Expect expression.")),
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, can_assign)?;

        while precedence <= Self::get_rule(self.parser.current()?.kind).precedence {
            self.advance();
            let infix_rule = match Self::get_rule(self.parser.previous()?.kind).infix {
                Some(rule) => rule,
                None => return Err(self.error_at_previous("Expect expression.")),
            };
            infix_rule(self, can_assign)?;
        }

        if can_assign && self.match_token(TokenKind::Equal)? {
            return Err(self.error_at_previous("Invalid assignment target."));
        }

        Ok(())
    }

    #[rustfmt::skip]
    const RULES_TABLE: [ParseRule<'src>; 39] = [
        ParseRule { prefix: Some(Compiler::grouping), infix: Some(Compiler::call)   , precedence: Precedence::Call        }, // ParenLeft
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // ParenRight
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // BraceLeft
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // BraceRight
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // Comma
        ParseRule { prefix: None                    , infix: Some(Compiler::dot)    , precedence: Precedence::Call        }, // Dot
        ParseRule { prefix: Some(Compiler::unary)   , infix: Some(Compiler::binary) , precedence: Precedence::Term        }, // Minus
        ParseRule { prefix: None                    , infix: Some(Compiler::binary) , precedence: Precedence::Term        }, // Plus
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // Semicolon
        ParseRule { prefix: None                    , infix: Some(Compiler::binary) , precedence: Precedence::Factor      }, // Slash
        ParseRule { prefix: None                    , infix: Some(Compiler::binary) , precedence: Precedence::Factor      }, // Star
        ParseRule { prefix: Some(Compiler::unary)   , infix: None                   , precedence: Precedence::None        }, // Bang
        ParseRule { prefix: None                    , infix: Some(Compiler::binary) , precedence: Precedence::Equality    }, // BangEqual
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // Equal
        ParseRule { prefix: None                    , infix: Some(Compiler::binary) , precedence: Precedence::Equality    }, // EqualEqual
        ParseRule { prefix: None                    , infix: Some(Compiler::binary) , precedence: Precedence::Comparison  }, // Greater
        ParseRule { prefix: None                    , infix: Some(Compiler::binary) , precedence: Precedence::Comparison  }, // GreaterEqual
        ParseRule { prefix: None                    , infix: Some(Compiler::binary) , precedence: Precedence::Comparison  }, // Less
        ParseRule { prefix: None                    , infix: Some(Compiler::binary) , precedence: Precedence::Comparison  }, // LessEqual
        ParseRule { prefix: Some(Compiler::variable), infix: None                   , precedence: Precedence::None        }, // Identifier
        ParseRule { prefix: Some(Compiler::string)  , infix: None                   , precedence: Precedence::None        }, // String
        ParseRule { prefix: Some(Compiler::number)  , infix: None                   , precedence: Precedence::None        }, // Number
        ParseRule { prefix: None                    , infix: Some(Compiler::and_)   , precedence: Precedence::And         }, // And
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // Class
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // Else
        ParseRule { prefix: Some(Compiler::literal) , infix: None                   , precedence: Precedence::None        }, // False
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // For
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // Fun
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // If
        ParseRule { prefix: Some(Compiler::literal) , infix: None                   , precedence: Precedence::None        }, // Nil
        ParseRule { prefix: None                    , infix: Some(Compiler::or_)    , precedence: Precedence::Or          }, // Or
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // Print
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // Return
        ParseRule { prefix: Some(Compiler::super_)  , infix: None                   , precedence: Precedence::None        }, // Super
        ParseRule { prefix: Some(Compiler::this_)   , infix: None                   , precedence: Precedence::None        }, // This
        ParseRule { prefix: Some(Compiler::literal) , infix: None                   , precedence: Precedence::None        }, // True
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // Var
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // While
        ParseRule { prefix: None                    , infix: None                   , precedence: Precedence::None        }, // EOF
    ];
}

type ParseFunction<'src> = fn(&mut Compiler<'src>, bool) -> Result<()>;

#[derive(Debug, Copy, Clone)]
struct ParseRule<'src> {
    prefix: Option<ParseFunction<'src>>,
    infix: Option<ParseFunction<'src>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // ==, !=
    Comparison, // <, >, <=, >=
    Term,       // +, -
    Factor,     // *, /
    Unary,      // !, -
    Call,       // ., ()
    Primary,
}

impl Precedence {
    fn higher(&self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

struct Parser {
    current: Option<Token>,
    previous: Option<Token>,
}

impl Parser {
    fn new() -> Self {
        Self {
            current: None,
            previous: None,
        }
    }

    fn previous(&self) -> Result<&Token> {
        self.previous.as_ref().ok_or(CompileError::TokenNotFound)
    }

    fn current(&self) -> Result<&Token> {
        self.current.as_ref().ok_or(CompileError::TokenNotFound)
    }

    fn check_current(&self, kind: TokenKind) -> Result<bool> {
        Ok(self.current()?.kind == kind)
    }

    fn line(&self) -> u64 {
        self.previous.as_ref().map(|t| t.line).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Result<Gc<Object>> {
        let mut gc = GC::new();
        let compiler = Compiler::new(source, &mut gc);
        compiler.compile()
    }

    #[test]
    fn compile_math() {
        assert!(compile("(-1 + 2) * 3 - -4;").is_ok());
        assert!(compile("1.5 + 1.3 * 3.5;").is_ok());
    }

    #[test]
    fn compile_print() {
        assert!(compile("print 1;").is_ok());
    }

    #[test]
    fn compile_constants() {
        let source = r#"
        var beverage = "cafe au lait";
        var breakfast = "beignets with " + beverage;
        print breakfast;
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_weird_assignments() {
        assert!(compile("a * b = c + d;").is_err());
        assert!(compile("1 = 2;").is_err());
    }

    #[test]
    fn compile_assign_to_itself() {
        let source = r#"
        var a = 1;
        {
            var a = a;
        }"#;
        assert!(compile(source).is_err());
    }

    #[test]
    fn compile_duplicate_local() {
        let source = r#"
        {
            var a = 1;
            var a = 2;
        }"#;
        assert!(compile(source).is_err());
    }

    #[test]
    fn compile_if_else() {
        assert!(compile("if (1) {} else {}").is_ok());
    }

    #[test]
    fn compile_and_or() {
        assert!(compile("print true and false;").is_ok());
        assert!(compile("print true or false;").is_ok());
    }

    #[test]
    fn compile_while_for() {
        assert!(compile("while (true) {}").is_ok());
        assert!(compile("for (var i = 0; i < 10; i = i + 1) {}").is_ok());
        assert!(compile("for (;;) {}").is_ok());
    }

    #[test]
    fn compile_functions() {
        let source = r#"
        fun hello() {}
        fun hello2(a, b, c) { return a + b + c; }
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_closures() {
        let source = r#"
            fun makeClosure() {
                var local = "local";
                fun closure() {
                    print local;
                }
                return closure;
            }
            var closure = makeClosure();
            closure();
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_classes() {
        let source = r#"
            class Brioche {
                init(flour) { this.flour = flour; }
                bake() { return this.flour; }
            }
            print Brioche("wheat").bake();
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_inheritance() {
        let source = r#"
            class A { speak() { print "A"; } }
            class B < A { speak() { super.speak(); } }
            B().speak();
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_self_inheritance_fails() {
        assert!(compile("class A < A {}").is_err());
    }

    #[test]
    fn compile_this_outside_class_fails() {
        assert!(compile("print this;").is_err());
        assert!(compile("fun f() { return this; }").is_err());
    }

    #[test]
    fn compile_super_outside_class_fails() {
        assert!(compile("print super.x;").is_err());
    }

    #[test]
    fn compile_super_without_superclass_fails() {
        assert!(compile("class A { f() { return super.f(); } }").is_err());
    }

    #[test]
    fn compile_top_level_return_fails() {
        assert!(compile("return 1;").is_err());
    }

    #[test]
    fn compile_return_value_from_init_fails() {
        assert!(compile("class A { init() { return 1; } }").is_err());
        assert!(compile("class A { init() { return; } }").is_ok());
    }

    #[test]
    fn compile_unterminated_string_fails() {
        assert!(compile("var a = \"oops;").is_err());
    }

    #[test]
    fn compile_error_has_line_prefix() {
        let err = compile("var a = ;").unwrap_err();
        match err {
            CompileError::Collected(errors) => {
                assert!(errors[0].to_string().starts_with("[line 1] Error"));
                assert!(errors[0].to_string().ends_with('.'));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn compile_local_limit() {
        let mut inside = String::new();
        for i in 0..255 {
            inside.push_str(&format!("var v{} = 0;", i));
        }
        let ok = format!("fun f() {{ {} }}", inside);
        assert!(compile(&ok).is_ok());

        inside.push_str("var last = 0;");
        let too_many = format!("fun f() {{ {} }}", inside);
        assert!(compile(&too_many).is_err());
    }

    #[test]
    fn compile_constant_limit() {
        // Each distinct number literal takes a constant slot.
        let ok: String = (0..256).map(|i| format!("print {};", i)).collect();
        assert!(compile(&ok).is_ok());

        let too_many: String = (0..257).map(|i| format!("print {};", i)).collect();
        assert!(compile(&too_many).is_err());
    }

    #[test]
    fn compile_parameter_limit() {
        let params: Vec<String> = (0..256).map(|i| format!("p{}", i)).collect();
        let too_many = format!("fun f({}) {{}}", params.join(", "));
        assert!(compile(&too_many).is_err());

        let params: Vec<String> = (0..255).map(|i| format!("p{}", i)).collect();
        let ok = format!("fun f({}) {{}}", params.join(", "));
        assert!(compile(&ok).is_ok());
    }

    #[test]
    fn compile_jump_too_large() {
        // Locals only, so the loop body grows without hitting the
        // constant limit first.
        let mut body = String::new();
        for _ in 0..15000 {
            body.push_str("a = a;");
        }
        let source = format!("fun f() {{ var a = 1; if (a) {{ {} }} }}", body);
        assert!(compile(&source).is_err());

        let small = "fun f() { var a = 1; if (a) { a = a; } }";
        assert!(compile(small).is_ok());
    }

    #[test]
    fn patch_jump_boundary() {
        let mut state = FunctionState::script();
        let offset = state.emit_jump(OpCode::Jump, 1);
        for _ in 0..MAX_JUMP {
            state.emit_raw(0, 1);
        }
        assert!(state.patch_jump(offset, 1).is_ok());
        state.emit_raw(0, 1);
        assert!(state.patch_jump(offset, 1).is_err());
    }

    #[test]
    fn upvalue_limit() {
        let mut state = FunctionState::script();
        for i in 0..=255u8 {
            assert!(state.add_upvalue(i, true, 1).is_ok());
        }
        // Re-adding an existing capture is deduplicated, not counted.
        assert!(state.add_upvalue(10, true, 1).is_ok());
        assert!(state.add_upvalue(0, false, 1).is_err());
    }

    #[test]
    fn no_duplicate_locals_in_scope() {
        let mut gc = GC::new();
        let compiler = Compiler::new("{ var a = 1; var b = 2; { var a = 3; } }", &mut gc);
        assert!(compiler.compile().is_ok());
    }

    #[test]
    fn lines_match_code_length() {
        let mut gc = GC::new();
        let function = Compiler::new("print 1 + 2;\nprint 3;", &mut gc)
            .compile()
            .unwrap();
        let chunk = &function.as_function().chunk;
        assert_eq!(chunk.code.len(), chunk.lines.len());
    }
}
