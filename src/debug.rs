use crate::compiler::chunk::Chunk;
use crate::vm::instruction::OpCode;

/// Compile-time switches for the diagnostic output. All zero-cost when
/// off; flip while debugging.
pub const LOG_GC: bool = false;
pub const STRESS_GC: bool = false;
pub const LOG_OBJECT: bool = false;
pub const LOG_COMPILER: bool = false;
pub const LOG_COMPILED_CODE: bool = false;
pub const TRACE_EXECUTION_INSTR: bool = false;
pub const TRACE_EXECUTION_STACK: bool = false;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.code.len() {
        let current_line = chunk.lines.get(offset).copied().unwrap_or(0);
        let line = if offset > 0 && chunk.lines.get(offset - 1).copied() == Some(current_line) {
            "   |".to_owned()
        } else {
            format!("{:4}", current_line)
        };

        let (text, bytes) = disassemble_instruction(chunk, offset);
        println!("{:04} {} {}", offset, line, text);
        offset += bytes;
    }
}

/// Renders the instruction at `offset` and returns how many bytes it
/// occupies.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let op_code = match chunk.code.get(offset) {
        Some(byte) => OpCode::from(*byte),
        None => return ("<eof>".to_owned(), 1),
    };

    match op_code {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Inherit
        | OpCode::Return => (op_code.name().to_owned(), 1),

        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(chunk, op_code, offset),

        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(chunk, op_code, offset),

        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(chunk, op_code, offset, 1),
        OpCode::Loop => jump_instruction(chunk, op_code, offset, -1),

        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(chunk, op_code, offset),

        OpCode::Closure => closure_instruction(chunk, offset),
    }
}

fn constant_instruction(chunk: &Chunk, op_code: OpCode, offset: usize) -> (String, usize) {
    match chunk.read_constant(offset) {
        Some(constant) => (format!("{}\t{}", op_code.name(), constant), 2),
        None => (format!("{}\t<bad constant>", op_code.name()), 2),
    }
}

fn byte_instruction(chunk: &Chunk, op_code: OpCode, offset: usize) -> (String, usize) {
    let slot = chunk.code.get(offset + 1).copied().unwrap_or(0);
    (format!("{}\t{}", op_code.name(), slot), 2)
}

fn jump_instruction(chunk: &Chunk, op_code: OpCode, offset: usize, sign: i64) -> (String, usize) {
    let b0 = chunk.code.get(offset + 1).copied().unwrap_or(0) as i64;
    let b1 = chunk.code.get(offset + 2).copied().unwrap_or(0) as i64;
    let jump = b0 << 8 | b1;
    let target = offset as i64 + 3 + sign * jump;
    (format!("{}\t{} -> {}", op_code.name(), offset, target), 3)
}

fn invoke_instruction(chunk: &Chunk, op_code: OpCode, offset: usize) -> (String, usize) {
    let name = match chunk.read_constant(offset) {
        Some(constant) => constant.to_string(),
        None => "<bad constant>".to_owned(),
    };
    let arg_count = chunk.code.get(offset + 2).copied().unwrap_or(0);
    (format!("{}\t({} args) {}", op_code.name(), arg_count, name), 3)
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = String::new();
    let mut bytes = 2;

    match chunk.read_constant(offset) {
        Some(constant) => {
            text.push_str(&format!("Closure\t{}", constant));
            if let crate::vm::value::Value::Object(object) = constant {
                let num_upvalues = object.as_function().num_upvalues;
                for _ in 0..num_upvalues {
                    let is_local = chunk.code.get(offset + bytes).copied().unwrap_or(0);
                    let index = chunk.code.get(offset + bytes + 1).copied().unwrap_or(0);
                    let kind = if is_local == 1 { "local" } else { "upvalue" };
                    text.push_str(&format!("\n\t\t|\t{} {}", kind, index));
                    bytes += 2;
                }
            }
        }
        None => text.push_str("Closure\t<bad constant>"),
    }

    (text, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::Value;

    #[test]
    fn disassemble_simple_and_constant() {
        let mut chunk = Chunk::new();
        let index = chunk.add_constant(Value::Number(1.5));
        chunk.write_index(OpCode::Constant, index as u8, 1);
        chunk.write(OpCode::Negate, 1);
        chunk.write(OpCode::Return, 1);

        let (text, bytes) = disassemble_instruction(&chunk, 0);
        assert!(text.contains("Constant"));
        assert!(text.contains("1.5"));
        assert_eq!(bytes, 2);

        let (text, bytes) = disassemble_instruction(&chunk, 2);
        assert_eq!(text, "Negate");
        assert_eq!(bytes, 1);
    }

    #[test]
    fn disassemble_jump_target() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Jump, 1);
        chunk.write_byte(0x00, 1);
        chunk.write_byte(0x05, 1);

        let (text, bytes) = disassemble_instruction(&chunk, 0);
        assert_eq!(bytes, 3);
        assert!(text.contains("0 -> 8"));
    }
}
