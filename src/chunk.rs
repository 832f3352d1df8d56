// A Chunk is a compiled function body: a bytecode byte buffer, the
// per-byte source line map used for error reporting, and the function's
// constant pool. One byte opcode, operands follow big-endian (§6).

use crate::value::{format_value, Value};
use crate::gc::Heap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Constant,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    SetGlobal,
    DefineGlobal,
    GetUpvalue,
    SetUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Inherit,
    Method,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0 => OpCode::Constant,
            1 => OpCode::Nil,
            2 => OpCode::True,
            3 => OpCode::False,
            4 => OpCode::Pop,
            5 => OpCode::GetLocal,
            6 => OpCode::SetLocal,
            7 => OpCode::GetGlobal,
            8 => OpCode::SetGlobal,
            9 => OpCode::DefineGlobal,
            10 => OpCode::GetUpvalue,
            11 => OpCode::SetUpvalue,
            12 => OpCode::GetProperty,
            13 => OpCode::SetProperty,
            14 => OpCode::GetSuper,
            15 => OpCode::Equal,
            16 => OpCode::Greater,
            17 => OpCode::Less,
            18 => OpCode::Add,
            19 => OpCode::Subtract,
            20 => OpCode::Multiply,
            21 => OpCode::Divide,
            22 => OpCode::Not,
            23 => OpCode::Negate,
            24 => OpCode::Print,
            25 => OpCode::Jump,
            26 => OpCode::JumpIfFalse,
            27 => OpCode::Loop,
            28 => OpCode::Call,
            29 => OpCode::Invoke,
            30 => OpCode::SuperInvoke,
            31 => OpCode::Closure,
            32 => OpCode::CloseUpvalue,
            33 => OpCode::Return,
            34 => OpCode::Class,
            35 => OpCode::Inherit,
            36 => OpCode::Method,
            _ => unreachable!("invalid opcode byte {byte} — corrupt chunk"),
        }
    }
}

/// Maximum constant-pool size: indices are encoded in one byte (§3 invariants).
pub const MAX_CONSTANTS: usize = 256;

#[derive(Clone)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk { code: Vec::new(), lines: Vec::new(), constants: Vec::new() }
    }

    pub fn write_u8(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write_u8(op as u8, line);
    }

    pub fn write_u16(&mut self, value: u16, line: u32) {
        self.write_u8((value >> 8) as u8, line);
        self.write_u8((value & 0xff) as u8, line);
    }

    /// Returns `None` once the pool has hit the one-byte index limit; the
    /// compiler turns that into a compile error at the call site.
    pub fn add_constant(&mut self, value: Value) -> Option<u8> {
        if self.constants.len() >= MAX_CONSTANTS {
            return None;
        }
        self.constants.push(value);
        Some((self.constants.len() - 1) as u8)
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines[offset]
    }

    /// Patches a previously emitted 2-byte placeholder (see `Compiler`'s
    /// forward-jump back-patching) to jump to the current end of the chunk.
    pub fn patch_jump_to_here(&mut self, placeholder_offset: usize) -> Result<(), String> {
        let jump = self.code.len() - placeholder_offset - 2;
        if jump > u16::MAX as usize {
            return Err("Too much code to jump over.".to_string());
        }
        self.code[placeholder_offset] = ((jump >> 8) & 0xff) as u8;
        self.code[placeholder_offset + 1] = (jump & 0xff) as u8;
        Ok(())
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal instruction-trace disassembler. Not part of the core per §1 (the
/// full standalone disassembler is an external collaborator); this exists
/// only to back the `--trace-exec` debug flag.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> (String, usize) {
    let op = OpCode::from_u8(chunk.code[offset]);
    let line_marker = if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        "   |".to_string()
    } else {
        format!("{:4}", chunk.line_at(offset))
    };
    macro_rules! simple {
        ($name:literal) => {
            (format!("{:04} {} {}", offset, line_marker, $name), offset + 1)
        };
    }
    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::DefineGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let idx = chunk.code[offset + 1];
            let val = format_value(chunk.constants[idx as usize], heap);
            (
                format!("{:04} {} {:?} {:4} '{}'", offset, line_marker, op, idx, val),
                offset + 2,
            )
        }
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => {
            let slot = chunk.code[offset + 1];
            (format!("{:04} {} {:?} {:4}", offset, line_marker, op, slot), offset + 2)
        }
        OpCode::Invoke | OpCode::SuperInvoke => {
            let idx = chunk.code[offset + 1];
            let argc = chunk.code[offset + 2];
            let val = format_value(chunk.constants[idx as usize], heap);
            (
                format!("{:04} {} {:?} ({} args) '{}'", offset, line_marker, op, argc, val),
                offset + 3,
            )
        }
        OpCode::Jump | OpCode::JumpIfFalse => {
            let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
            (
                format!("{:04} {} {:?} -> {}", offset, line_marker, op, offset + 3 + jump as usize),
                offset + 3,
            )
        }
        OpCode::Loop => {
            let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
            (
                format!("{:04} {} {:?} -> {}", offset, line_marker, op, offset + 3 - jump as usize),
                offset + 3,
            )
        }
        OpCode::Closure => {
            let idx = chunk.code[offset + 1];
            let val = format_value(chunk.constants[idx as usize], heap);
            let upvalue_count = match chunk.constants[idx as usize] {
                Value::Obj(r) => heap.get(r).as_function().map(|f| f.upvalue_count).unwrap_or(0),
                _ => 0,
            };
            let mut next = offset + 2;
            let mut out = format!("{:04} {} {:?} {:4} '{}'", offset, line_marker, op, idx, val);
            for _ in 0..upvalue_count {
                out.push_str(&format!(
                    "\n{:04}      | {} {}",
                    next,
                    if chunk.code[next] == 1 { "local" } else { "upvalue" },
                    chunk.code[next + 1]
                ));
                next += 2;
            }
            (out, next)
        }
        OpCode::Nil => simple!("OP_NIL"),
        OpCode::True => simple!("OP_TRUE"),
        OpCode::False => simple!("OP_FALSE"),
        OpCode::Pop => simple!("OP_POP"),
        OpCode::Equal => simple!("OP_EQUAL"),
        OpCode::Greater => simple!("OP_GREATER"),
        OpCode::Less => simple!("OP_LESS"),
        OpCode::Add => simple!("OP_ADD"),
        OpCode::Subtract => simple!("OP_SUBTRACT"),
        OpCode::Multiply => simple!("OP_MULTIPLY"),
        OpCode::Divide => simple!("OP_DIVIDE"),
        OpCode::Not => simple!("OP_NOT"),
        OpCode::Negate => simple!("OP_NEGATE"),
        OpCode::Print => simple!("OP_PRINT"),
        OpCode::CloseUpvalue => simple!("OP_CLOSE_UPVALUE"),
        OpCode::Return => simple!("OP_RETURN"),
        OpCode::Inherit => simple!("OP_INHERIT"),
    }
}
