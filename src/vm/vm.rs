use colored::*;
use std::io::Write;

use super::{instruction::OpCode, value::Value, CallFrame, Result, VMError};
use crate::compiler::compiler::Compiler;
use crate::debug::{self, TRACE_EXECUTION_INSTR, TRACE_EXECUTION_STACK};
use crate::memory::{
    BoundMethod, Class, Closure, Gc, Instance, NativeFn, NativeFunction, Object, Upvalue, GC,
};

/// Active call frames are capped; blowing the cap is the interpreter's
/// "Stack overflow." error.
const FRAMES_MAX: usize = 64;

/// The bytecode interpreter. All state that the GC must see lives in the
/// `GC` context; the VM itself is just the dispatch loop, the print sink
/// and the calling convention.
pub struct VM<'gc> {
    gc: &'gc mut GC,
    out: &'gc mut dyn Write,
}

impl<'gc> VM<'gc> {
    pub fn new(gc: &'gc mut GC, out: &'gc mut dyn Write) -> Self {
        let mut vm = Self { gc, out };
        vm.gc.init_string = Some(vm.gc.intern("init".to_owned()));
        vm.define_native("clock", native_clock);
        vm.define_native("tostring", native_tostring);
        vm
    }

    /// Compiles and runs `source`. Compile errors and runtime errors are
    /// reported on stderr; the VM survives either and can interpret the
    /// next input.
    pub fn interpret(&mut self, source: &str) -> Result<()> {
        let function = Compiler::new(source, self.gc).compile()?;
        self.interpret_function(function)
    }

    pub fn interpret_function(&mut self, function: Gc<Object>) -> Result<()> {
        // Root the function, wrap it in the script closure, swap the
        // closure in as stack slot 0.
        self.gc.stack.push(function.into());
        let closure = self.gc.track(Object::Closure(Closure::new(function)));
        self.gc.stack.pop();
        self.gc.stack.push(closure.into());
        self.call_value(Value::Object(closure), 0)?;

        if let Err(err) = self.run() {
            self.report_runtime_error(&err);
            self.reset();
            return Err(err);
        }
        Ok(())
    }

    /// Installs a native function under `name`, keeping both the name and
    /// the function reachable from the stack until the globals table
    /// holds them.
    fn define_native(&mut self, name: &str, fun: NativeFunction) {
        let name_obj = self.gc.intern(name.to_owned());
        self.gc.stack.push(name_obj.into());

        let native = self.gc.track(Object::Native(NativeFn::new(name_obj, fun)));
        self.gc.stack.push(native.into());

        self.gc.globals.set(name_obj, native.into());

        self.gc.stack.pop();
        self.gc.stack.pop();
    }

    /// Runtime failures print the message and a stack trace, innermost
    /// frame first.
    fn report_runtime_error(&self, err: &VMError) {
        eprintln!("{}", err);
        for frame in self.gc.call_frames.iter().rev() {
            let function = frame.function();
            let line = frame.line();
            if function.name.is_some() {
                eprintln!("[line {}] in {}()", line, function.function_name());
            } else {
                eprintln!("[line {}] in script", line);
            }
        }
    }

    /// Puts the VM back into a usable state after a runtime error.
    fn reset(&mut self) {
        self.gc.stack.clear();
        self.gc.call_frames.clear();
        self.gc.open_upvalues.clear();
    }

    fn frame(&self) -> Result<&CallFrame> {
        self.gc.call_frames.last().ok_or(VMError::NoCallFrame)
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame> {
        self.gc.call_frames.last_mut().ok_or(VMError::NoCallFrame)
    }

    fn push(&mut self, value: Value) {
        self.gc.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.gc.stack.pop().ok_or(VMError::EmptyStack)
    }

    fn peek(&self, distance: usize) -> Result<&Value> {
        let index = self
            .gc
            .stack
            .len()
            .checked_sub(distance + 1)
            .ok_or(VMError::EmptyStack)?;
        self.gc.stack.get(index).ok_or(VMError::EmptyStack)
    }

    fn trace_execution(&mut self) -> Result<()> {
        if TRACE_EXECUTION_STACK {
            let mut stack_str = String::new();
            for value in self.gc.stack.iter() {
                stack_str.push_str(&format!(" [{}]", value));
            }
            println!("\n{}\t{}", "[STACK]".yellow(), stack_str.trim_start());
        }
        if TRACE_EXECUTION_INSTR {
            let frame = self.frame()?;
            let (text, _) = debug::disassemble_instruction(&frame.function().chunk, frame.ip);
            println!("{}\t{:04}\t{}", "[Instruction]".green(), frame.ip, text);
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        loop {
            if TRACE_EXECUTION_STACK || TRACE_EXECUTION_INSTR {
                self.trace_execution()?;
            }

            let instruction = OpCode::from(self.frame_mut()?.next_instruction()?);
            match instruction {
                OpCode::Constant => {
                    let constant = self.frame_mut()?.next_instruction_as_constant()?;
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::GetLocal => {
                    let index = self.frame_mut()?.next_instruction()? as usize;
                    let index = index + self.frame()?.stack_base;
                    let value = self
                        .gc
                        .stack
                        .get(index)
                        .ok_or(VMError::EmptyStack)?
                        .clone();
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let index = self.frame_mut()?.next_instruction()? as usize;
                    let index = index + self.frame()?.stack_base;
                    let value = self.peek(0)?.clone();
                    self.gc.stack[index] = value;
                }
                OpCode::GetGlobal => {
                    let name = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let value = self.gc.globals.get(name).ok_or_else(|| {
                        VMError::UndefinedVariable(name.as_string().data.clone())
                    })?;
                    self.push(value);
                }
                OpCode::DefineGlobal => {
                    let name = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let value = self.peek(0)?.clone();
                    self.gc.globals.set(name, value);
                    self.pop()?;
                }
                OpCode::SetGlobal => {
                    let name = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let value = self.peek(0)?.clone();
                    // Assignment never creates a global; undo the insert
                    // the table just performed and report.
                    if self.gc.globals.set(name, value) {
                        self.gc.globals.delete(name);
                        return Err(VMError::UndefinedVariable(name.as_string().data.clone()));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.frame_mut()?.next_instruction()? as usize;
                    let upvalue = self.frame()?.closure.as_closure().upvalues[slot];
                    let value = upvalue.as_upvalue().get(self.gc);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.frame_mut()?.next_instruction()? as usize;
                    let value = self.peek(0)?.clone();
                    let mut upvalue = self.frame()?.closure.as_closure().upvalues[slot];
                    match upvalue.as_upvalue_mut() {
                        Upvalue::Open(stack_slot) => {
                            let stack_slot = *stack_slot;
                            self.gc.stack[stack_slot] = value;
                        }
                        Upvalue::Closed(closed) => {
                            *closed = value;
                        }
                    }
                }
                OpCode::GetProperty => {
                    let name = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let instance = self.instance_at(0, VMError::PropertyOnNonInstance)?;

                    if let Some(value) = instance.as_instance().fields.get(name) {
                        self.pop()?; // Instance.
                        self.push(value);
                    } else {
                        let class = instance.as_instance().class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let mut instance = self.instance_at(1, VMError::FieldOnNonInstance)?;

                    let value = self.peek(0)?.clone();
                    instance.as_instance_mut().fields.set(name, value);

                    // Pop the value and the instance, leave the value.
                    let value = self.pop()?;
                    self.pop()?;
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let superclass = self.pop()?.as_object();
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.push(Value::Bool(lhs.equals(&rhs)));
                }
                OpCode::Greater => self.op_binary(|lhs, rhs| Value::Bool(lhs > rhs))?,
                OpCode::Less => self.op_binary(|lhs, rhs| Value::Bool(lhs < rhs))?,
                OpCode::Add => self.op_add()?,
                OpCode::Subtract => self.op_binary(|lhs, rhs| Value::Number(lhs - rhs))?,
                OpCode::Multiply => self.op_binary(|lhs, rhs| Value::Number(lhs * rhs))?,
                OpCode::Divide => self.op_binary(|lhs, rhs| Value::Number(lhs / rhs))?,
                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.pop()?;
                    match value {
                        Value::Number(v) => self.push(Value::Number(-v)),
                        _ => return Err(VMError::OperandMustBeNumber),
                    }
                }
                OpCode::Print => {
                    let value = self.pop()?;
                    writeln!(self.out, "{}", value)?;
                }
                OpCode::Jump => {
                    let offset = self.frame_mut()?.next_instruction_as_jump()?;
                    self.frame_mut()?.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.frame_mut()?.next_instruction_as_jump()?;
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut()?.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.frame_mut()?.next_instruction_as_jump()?;
                    self.frame_mut()?.ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.frame_mut()?.next_instruction()? as usize;
                    let callee = self.peek(arg_count)?.clone();
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let arg_count = self.frame_mut()?.next_instruction()? as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let arg_count = self.frame_mut()?.next_instruction()? as usize;
                    let superclass = self.pop()?.as_object();
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let mut closure = self.gc.track(Object::Closure(Closure::new(function)));
                    // Rooted before the upvalue captures allocate.
                    self.push(closure.into());

                    let upvalue_count = closure.as_closure().upvalue_count;
                    for _ in 0..upvalue_count {
                        let is_local = self.frame_mut()?.next_instruction()? == 1;
                        let index = self.frame_mut()?.next_instruction()? as usize;
                        let upvalue = if is_local {
                            let slot = self.frame()?.stack_base + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.frame()?.closure.as_closure().upvalues[index]
                        };
                        closure.as_closure_mut().upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.gc.stack.len() - 1);
                    self.pop()?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self.gc.call_frames.pop().ok_or(VMError::NoCallFrame)?;
                    self.close_upvalues(frame.stack_base);

                    if self.gc.call_frames.is_empty() {
                        // Pop the script closure; execution is done.
                        self.pop()?;
                        return Ok(());
                    }

                    self.gc.stack.truncate(frame.stack_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let class = self.gc.track(Object::Class(Class::new(name)));
                    self.push(class.into());
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1)? {
                        Value::Object(object) if matches!(object.as_ref(), Object::Class(_)) => {
                            *object
                        }
                        _ => return Err(VMError::SuperclassNotClass),
                    };
                    let mut subclass = self.peek(0)?.as_object();
                    subclass
                        .as_class_mut()
                        .methods
                        .add_all(&superclass.as_class().methods);
                    // The superclass stays behind as the `super` local.
                    self.pop()?;
                }
                OpCode::Method => {
                    let name = self.frame_mut()?.next_instruction_as_constant()?.as_object();
                    let method = self.peek(0)?.clone();
                    let mut class = self.peek(1)?.as_object();
                    class.as_class_mut().methods.set(name, method);
                    self.pop()?;
                }
            }
        }
    }

    /// The object at stack `distance`, required to be an instance.
    fn instance_at(&self, distance: usize, err: VMError) -> Result<Gc<Object>> {
        match self.peek(distance)? {
            Value::Object(object) if matches!(object.as_ref(), Object::Instance(_)) => Ok(*object),
            _ => Err(err),
        }
    }

    /// Replaces the receiver on top of the stack with a bound method for
    /// `name`, or errors if the class has no such method.
    fn bind_method(&mut self, class: Gc<Object>, name: Gc<Object>) -> Result<()> {
        let method = class
            .as_class()
            .methods
            .get(name)
            .ok_or_else(|| VMError::UndefinedProperty(name.as_string().data.clone()))?;

        let receiver = self.peek(0)?.clone();
        let bound = self
            .gc
            .track(Object::BoundMethod(BoundMethod::new(receiver, method.as_object())));
        self.pop()?; // Receiver.
        self.push(bound.into());
        Ok(())
    }

    /// Fused property call: fields shadowing methods still work, but the
    /// common method case skips the bound method allocation.
    fn invoke(&mut self, name: Gc<Object>, arg_count: usize) -> Result<()> {
        let receiver = match self.peek(arg_count)? {
            Value::Object(object) if matches!(object.as_ref(), Object::Instance(_)) => *object,
            _ => return Err(VMError::MethodOnNonInstance),
        };

        if let Some(field) = receiver.as_instance().fields.get(name) {
            let slot = self.gc.stack.len() - arg_count - 1;
            self.gc.stack[slot] = field.clone();
            self.call_value(field, arg_count)
        } else {
            let class = receiver.as_instance().class;
            self.invoke_from_class(class, name, arg_count)
        }
    }

    fn invoke_from_class(
        &mut self,
        class: Gc<Object>,
        name: Gc<Object>,
        arg_count: usize,
    ) -> Result<()> {
        let method = class
            .as_class()
            .methods
            .get(name)
            .ok_or_else(|| VMError::UndefinedProperty(name.as_string().data.clone()))?;
        self.call(method.as_object(), arg_count)
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<()> {
        let object = match &callee {
            Value::Object(object) => *object,
            _ => return Err(VMError::NotCallable),
        };

        match object.as_ref() {
            Object::Closure(_) => self.call(object, arg_count),
            Object::BoundMethod(bound) => {
                // The receiver takes over slot 0 of the new frame.
                let receiver = bound.receiver.clone();
                let method = bound.method;
                let slot = self.gc.stack.len() - arg_count - 1;
                self.gc.stack[slot] = receiver;
                self.call(method, arg_count)
            }
            Object::Class(_) => {
                let instance = self.gc.track(Object::Instance(Instance::new(object)));
                let slot = self.gc.stack.len() - arg_count - 1;
                self.gc.stack[slot] = instance.into();

                let init = self
                    .gc
                    .init_string
                    .and_then(|init| object.as_class().methods.get(init));
                if let Some(init) = init {
                    self.call(init.as_object(), arg_count)
                } else if arg_count != 0 {
                    Err(VMError::Arity {
                        expected: 0,
                        got: arg_count,
                    })
                } else {
                    Ok(())
                }
            }
            Object::Native(native) => {
                let fun = native.fun;
                let base = self.gc.stack.len() - arg_count - 1;
                let args: Vec<Value> = self.gc.stack[base + 1..].to_vec();
                let result = fun(self.gc, &args)?;
                self.gc.stack.truncate(base);
                self.push(result);
                Ok(())
            }
            _ => Err(VMError::NotCallable),
        }
    }

    fn call(&mut self, closure: Gc<Object>, arg_count: usize) -> Result<()> {
        let arity = closure.as_closure().function.as_function().arity;
        if arg_count != arity {
            return Err(VMError::Arity {
                expected: arity,
                got: arg_count,
            });
        }

        if self.gc.call_frames.len() >= FRAMES_MAX {
            return Err(VMError::StackOverflow);
        }

        let stack_base = self.gc.stack.len() - arg_count - 1;
        self.gc.call_frames.push(CallFrame::new(closure, stack_base));
        Ok(())
    }

    /// Finds or creates the upvalue for a stack slot. The open list stays
    /// sorted ascending by slot, so closing can walk from the tail.
    fn capture_upvalue(&mut self, stack_slot: usize) -> Gc<Object> {
        for upvalue in self.gc.open_upvalues.iter() {
            if upvalue.as_upvalue().is_open_at(stack_slot) {
                return *upvalue;
            }
        }

        let upvalue = self.gc.track(Object::Upvalue(Upvalue::new(stack_slot)));
        let position = self
            .gc
            .open_upvalues
            .iter()
            .position(|u| u.as_upvalue().as_open() > stack_slot)
            .unwrap_or_else(|| self.gc.open_upvalues.len());
        self.gc.open_upvalues.insert(position, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `from`: the pointed-at value
    /// moves off the stack into the upvalue itself.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(upvalue) = self.gc.open_upvalues.last() {
            let slot = upvalue.as_upvalue().as_open();
            if slot < from {
                break;
            }
            let mut upvalue = self.gc.open_upvalues.pop().unwrap();
            let value = self.gc.stack[slot].clone();
            upvalue.as_upvalue_mut().close(value);
        }
    }

    fn op_binary(&mut self, op: fn(f64, f64) -> Value) -> Result<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        match (lhs, rhs) {
            (Value::Number(lhs), Value::Number(rhs)) => {
                self.push(op(lhs, rhs));
                Ok(())
            }
            _ => Err(VMError::OperandsMustBeNumbers),
        }
    }

    /// `+` adds numbers or concatenates strings. The operands stay on the
    /// stack while the result is interned, so the collector triggered by
    /// the allocation cannot free them.
    fn op_add(&mut self) -> Result<()> {
        enum Op {
            Number(f64),
            Concat(String),
        }

        let result = match (self.peek(1)?, self.peek(0)?) {
            (Value::Number(lhs), Value::Number(rhs)) => Op::Number(lhs + rhs),
            (Value::Object(lhs), Value::Object(rhs)) => match (lhs.as_ref(), rhs.as_ref()) {
                (Object::String(lhs), Object::String(rhs)) => {
                    Op::Concat(lhs.data.clone() + &rhs.data)
                }
                _ => return Err(VMError::AddOperands),
            },
            _ => return Err(VMError::AddOperands),
        };

        let value = match result {
            Op::Number(n) => Value::Number(n),
            Op::Concat(data) => self.gc.intern(data).into(),
        };
        self.pop()?;
        self.pop()?;
        self.push(value);
        Ok(())
    }
}

fn native_clock(_gc: &mut GC, _args: &[Value]) -> Result<Value> {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Value::Number(elapsed.as_millis() as f64 / 1000.0))
}

/// Canonical textual form of any value, as an interned string.
fn native_tostring(gc: &mut GC, args: &[Value]) -> Result<Value> {
    let text = args.first().unwrap_or(&Value::Nil).to_string();
    Ok(Value::Object(gc.intern(text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> std::result::Result<String, VMError> {
        let mut gc = GC::new();
        let mut out: Vec<u8> = Vec::new();
        let mut vm = VM::new(&mut gc, &mut out);
        vm.interpret(source)?;
        drop(vm);
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn vm_math() {
        assert_eq!(run("print 1 + 2 * 3;").unwrap(), "7\n");
        assert_eq!(run("print (-1 + 2) * 3 - -4;").unwrap(), "7\n");
        assert_eq!(run("print 10 / 4;").unwrap(), "2.5\n");
    }

    #[test]
    fn vm_comparison_and_equality() {
        assert_eq!(run("print !(5 - 4 > 3 * 2 == !nil);").unwrap(), "true\n");
        assert_eq!(run("print 1 == 1;").unwrap(), "true\n");
        assert_eq!(run("print 1 != 2;").unwrap(), "true\n");
        assert_eq!(run("print 2 <= 2;").unwrap(), "true\n");
        assert_eq!(run("print nil == false;").unwrap(), "false\n");
        assert_eq!(run("print \"a\" == \"a\";").unwrap(), "true\n");
        assert_eq!(run("print \"a\" == \"b\";").unwrap(), "false\n");
    }

    #[test]
    fn vm_string_concat() {
        let source = "var a = \"foo\"; var b = \"bar\"; print a + b;";
        assert_eq!(run(source).unwrap(), "foobar\n");
    }

    #[test]
    fn vm_globals() {
        let source = r#"
        var beverage = "cafe au lait";
        var breakfast = "beignets with " + beverage;
        print breakfast;
        "#;
        assert_eq!(run(source).unwrap(), "beignets with cafe au lait\n");
    }

    #[test]
    fn vm_undefined_global() {
        assert!(matches!(
            run("print missing;"),
            Err(VMError::UndefinedVariable(name)) if name == "missing"
        ));
        assert!(matches!(
            run("missing = 1;"),
            Err(VMError::UndefinedVariable(name)) if name == "missing"
        ));
    }

    #[test]
    fn vm_locals() {
        let source = r#"
        {
            var a = 1;
            var b = a;
            b = b + 1;
            var c = a + b;
            print c;
        }
        "#;
        assert_eq!(run(source).unwrap(), "3\n");
    }

    #[test]
    fn vm_if_else() {
        let source = r#"
        var a = 1;
        if (a == 1) { print "then"; } else { print "else"; }
        if (a == 2) { print "then"; } else { print "else"; }
        "#;
        assert_eq!(run(source).unwrap(), "then\nelse\n");
    }

    #[test]
    fn vm_and_or_short_circuit() {
        assert_eq!(run("print true and false;").unwrap(), "false\n");
        assert_eq!(run("print true or false;").unwrap(), "true\n");
        assert_eq!(run("print nil or \"fallback\";").unwrap(), "fallback\n");
        assert_eq!(run("print nil and missing;").unwrap(), "nil\n");
        assert_eq!(run("print true or missing;").unwrap(), "true\n");
    }

    #[test]
    fn vm_while() {
        let source = r#"
        var a = 0;
        while (a < 3) { print a; a = a + 1; }
        "#;
        assert_eq!(run(source).unwrap(), "0\n1\n2\n");
    }

    #[test]
    fn vm_for() {
        let source = "for (var i = 0; i < 3; i = i + 1) { print i; }";
        assert_eq!(run(source).unwrap(), "0\n1\n2\n");
    }

    #[test]
    fn vm_fibonacci() {
        let source = r#"
        fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); }
        print fib(10);
        "#;
        assert_eq!(run(source).unwrap(), "55\n");
    }

    #[test]
    fn vm_function_print_form() {
        let source = "fun f() {} print f;";
        assert_eq!(run(source).unwrap(), "<fn f>\n");
        assert_eq!(run("print clock;").unwrap(), "<native fn>\n");
    }

    #[test]
    fn vm_call_arity_checked() {
        let source = "fun f(a, b) {} f(1);";
        assert!(matches!(
            run(source),
            Err(VMError::Arity { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn vm_calling_non_callable_fails() {
        assert!(matches!(run("var a = 1; a();"), Err(VMError::NotCallable)));
        assert!(matches!(run("\"str\"();"), Err(VMError::NotCallable)));
    }

    #[test]
    fn vm_stack_overflow() {
        // The script frame plus r(62)..r(0) is exactly the 64 frame cap.
        let ok = "fun r(n) { if (n > 0) r(n - 1); } r(62);";
        assert!(run(ok).is_ok());

        let over = "fun r(n) { if (n > 0) r(n - 1); } r(63);";
        assert!(matches!(run(over), Err(VMError::StackOverflow)));
    }

    #[test]
    fn vm_closure_counter() {
        let source = r#"
        fun makeCounter() { var x = 0; fun inc() { x = x + 1; return x; } return inc; }
        var c = makeCounter(); print c(); print c(); print c();
        "#;
        assert_eq!(run(source).unwrap(), "1\n2\n3\n");
    }

    #[test]
    fn vm_closures_capture_independently() {
        let source = r#"
        fun makeClosure(value) {
            fun closure() { print value; }
            return closure;
        }
        var doughnut = makeClosure("doughnut");
        var bagel = makeClosure("bagel");
        doughnut();
        bagel();
        "#;
        assert_eq!(run(source).unwrap(), "doughnut\nbagel\n");
    }

    #[test]
    fn vm_closure_shares_variable() {
        let source = r#"
        var globalSet;
        var globalGet;
        fun main() {
            var a = "initial";
            fun set() { a = "updated"; }
            fun get() { print a; }
            globalSet = set;
            globalGet = get;
        }
        main();
        globalSet();
        globalGet();
        "#;
        assert_eq!(run(source).unwrap(), "updated\n");
    }

    #[test]
    fn vm_closure_over_deep_nesting() {
        let source = r#"
        fun outer() {
            var x = "value";
            fun middle() {
                fun inner() { print x; }
                return inner;
            }
            return middle;
        }
        var mid = outer();
        var in = mid();
        in();
        "#;
        assert_eq!(run(source).unwrap(), "value\n");
    }

    #[test]
    fn vm_class_declaration_and_instance() {
        assert_eq!(run("class Brioche {} print Brioche;").unwrap(), "Brioche\n");
        assert_eq!(
            run("class Brioche {} print Brioche();").unwrap(),
            "Brioche instance\n"
        );
    }

    #[test]
    fn vm_instance_fields() {
        let source = r#"
        class Pair {}
        var pair = Pair();
        pair.first = 1;
        pair.second = 2;
        print pair.first + pair.second;
        "#;
        assert_eq!(run(source).unwrap(), "3\n");
    }

    #[test]
    fn vm_undefined_property() {
        let source = "class A {} var a = A(); print a.missing;";
        assert!(matches!(
            run(source),
            Err(VMError::UndefinedProperty(name)) if name == "missing"
        ));
    }

    #[test]
    fn vm_property_on_non_instance_fails() {
        assert!(matches!(
            run("var a = 1; print a.b;"),
            Err(VMError::PropertyOnNonInstance)
        ));
        assert!(matches!(
            run("var a = 1; a.b = 2;"),
            Err(VMError::FieldOnNonInstance)
        ));
    }

    #[test]
    fn vm_methods_and_this() {
        let source = r#"
        class Scone {
            topping(first, second) {
                print "scone with " + first + " and " + second;
            }
        }
        var scone = Scone();
        scone.topping("berries", "cream");
        "#;
        assert_eq!(run(source).unwrap(), "scone with berries and cream\n");
    }

    #[test]
    fn vm_bound_method_keeps_receiver() {
        let source = r#"
        class Person {
            init(name) { this.name = name; }
            sayName() { print this.name; }
        }
        var jane = Person("Jane");
        var method = jane.sayName;
        method();
        "#;
        assert_eq!(run(source).unwrap(), "Jane\n");
    }

    #[test]
    fn vm_initializer_returns_instance() {
        let source = r#"
        class A { init(n) { this.n = n; } }
        var a = A(41);
        print a.n;
        print A(1) == A(1);
        "#;
        assert_eq!(run(source).unwrap(), "41\nfalse\n");
    }

    #[test]
    fn vm_initializer_arity() {
        let source = "class A { init(n) {} } A();";
        assert!(matches!(
            run(source),
            Err(VMError::Arity { expected: 1, got: 0 })
        ));
        assert!(matches!(
            run("class B {} B(1);"),
            Err(VMError::Arity { expected: 0, got: 1 })
        ));
    }

    #[test]
    fn vm_field_shadowing_method_is_called() {
        let source = r#"
        class Box {
            contents() { return "method"; }
        }
        var box = Box();
        fun replacement() { return "field"; }
        box.contents = replacement;
        print box.contents();
        "#;
        assert_eq!(run(source).unwrap(), "field\n");
    }

    #[test]
    fn vm_inheritance_and_super() {
        let source = r#"
        class A { init(n) { this.n = n; } speak() { print this.n; } }
        class B < A { speak() { super.speak(); print this.n + 1; } }
        B(41).speak();
        "#;
        assert_eq!(run(source).unwrap(), "41\n42\n");
    }

    #[test]
    fn vm_inherited_methods_callable_directly() {
        let source = r#"
        class Doughnut {
            cook() { print "fry until golden"; }
        }
        class Cruller < Doughnut {}
        Cruller().cook();
        "#;
        assert_eq!(run(source).unwrap(), "fry until golden\n");
    }

    #[test]
    fn vm_overridden_method_wins() {
        let source = r#"
        class A { f() { print "A"; } }
        class B < A { f() { print "B"; } }
        B().f();
        "#;
        assert_eq!(run(source).unwrap(), "B\n");
    }

    #[test]
    fn vm_inherit_from_non_class_fails() {
        let source = "var NotClass = 1; class A < NotClass {}";
        assert!(matches!(run(source), Err(VMError::SuperclassNotClass)));
    }

    #[test]
    fn vm_add_type_error() {
        let err = run("print 1 + \"x\";").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Operand must be two numbers or two strings."
        );
    }

    #[test]
    fn vm_arithmetic_type_errors() {
        assert!(matches!(run("print 1 - nil;"), Err(VMError::OperandsMustBeNumbers)));
        assert!(matches!(run("print true * 2;"), Err(VMError::OperandsMustBeNumbers)));
        assert!(matches!(run("print -\"a\";"), Err(VMError::OperandMustBeNumber)));
        assert!(matches!(run("print \"a\" < \"b\";"), Err(VMError::OperandsMustBeNumbers)));
    }

    #[test]
    fn vm_compile_error_is_distinguished() {
        let err = run("var a = ;").unwrap_err();
        assert!(err.is_compile_error());
        let err = run("print 1 + \"x\";").unwrap_err();
        assert!(!err.is_compile_error());
    }

    #[test]
    fn vm_survives_runtime_error() {
        let mut gc = GC::new();
        let mut out: Vec<u8> = Vec::new();
        let mut vm = VM::new(&mut gc, &mut out);

        assert!(vm.interpret("var a = 1; print a + nil;").is_err());
        // Same VM keeps working, and globals from before the error remain.
        assert!(vm.interpret("print a;").is_ok());
        drop(vm);
        assert_eq!(String::from_utf8(out).unwrap(), "1\n");
    }

    #[test]
    fn vm_state_persists_between_interprets() {
        let mut gc = GC::new();
        let mut out: Vec<u8> = Vec::new();
        let mut vm = VM::new(&mut gc, &mut out);

        vm.interpret("var a = \"first\";").unwrap();
        vm.interpret("fun shout(x) { return x + \"!\"; }").unwrap();
        vm.interpret("print shout(a);").unwrap();
        drop(vm);
        assert_eq!(String::from_utf8(out).unwrap(), "first!\n");
    }

    #[test]
    fn vm_native_clock() {
        let source = r#"
        var start = clock();
        print start > 0;
        print clock() >= start;
        "#;
        assert_eq!(run(source).unwrap(), "true\ntrue\n");
    }

    #[test]
    fn vm_native_tostring() {
        assert_eq!(run("print tostring(nil);").unwrap(), "nil\n");
        assert_eq!(run("print tostring(true) + \"!\";").unwrap(), "true!\n");
        assert_eq!(run("print tostring(55);").unwrap(), "55\n");
        assert_eq!(run("print tostring(2.5) + \"\";").unwrap(), "2.5\n");
        assert_eq!(run("print tostring(\"s\") == \"s\";").unwrap(), "true\n");
        assert_eq!(
            run("class A {} print tostring(A) + tostring(A());").unwrap(),
            "AA instance\n"
        );
    }

    #[test]
    fn vm_gc_survives_heavy_churn() {
        // Enough transient strings to force collections mid-run.
        let source = r#"
        var keep = "";
        for (var i = 0; i < 2000; i = i + 1) {
            keep = "x" + keep;
        }
        print keep == keep + "";
        "#;
        assert_eq!(run(source).unwrap(), "true\n");
    }

    #[test]
    fn open_upvalues_stay_sorted_by_slot() {
        let mut gc = GC::new();
        let mut out: Vec<u8> = Vec::new();
        let mut vm = VM::new(&mut gc, &mut out);

        vm.capture_upvalue(5);
        vm.capture_upvalue(2);
        vm.capture_upvalue(8);
        vm.capture_upvalue(3);

        let slots: Vec<usize> = vm
            .gc
            .open_upvalues
            .iter()
            .map(|u| u.as_upvalue().as_open())
            .collect();
        assert_eq!(slots, vec![2, 3, 5, 8]);

        // Capturing an already-open slot reuses the existing upvalue.
        let existing = vm.capture_upvalue(5);
        assert_eq!(vm.gc.open_upvalues.len(), 4);
        assert!(vm.gc.open_upvalues[2].ptr_eq(&existing));
    }

    #[test]
    fn vm_returned_closure_outlives_frame() {
        let source = r#"
        fun outer() {
            var x = "outside";
            fun inner() { print x; }
            return inner;
        }
        var closure = outer();
        closure();
        "#;
        assert_eq!(run(source).unwrap(), "outside\n");
    }
}
