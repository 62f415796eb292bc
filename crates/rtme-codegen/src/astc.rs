//! ASTC bytecode
//!
//! ASTC is a linear stack-machine instruction stream produced by the
//! frontend compiler. A file is a 16-byte header followed by the
//! instruction bytes:
//!
//! ```text
//! magic "ASTC" | version u32 | code_size u32 | entry_point u32 | code...
//! ```
//!
//! Jump targets and the entry point are byte offsets into the code.

use rtme_format::{ByteReader, ByteWriter, DecodeError};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Magic number for ASTC files
pub const ASTC_MAGIC: [u8; 4] = *b"ASTC";

/// ASTC format version
pub const ASTC_VERSION: u32 = 1;

/// Size of the ASTC file header
pub const ASTC_HEADER_SIZE: usize = 16;

/// ASTC decoding errors
#[derive(Debug, Error)]
pub enum AstcError {
    /// File could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// Path being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Magic number mismatch
    #[error("Invalid ASTC magic: {0:?}")]
    BadMagic([u8; 4]),

    /// Unsupported format version
    #[error("Unsupported ASTC version {0}")]
    UnsupportedVersion(u32),

    /// Opcode byte outside the instruction set
    #[error("Unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode {
        /// Raw opcode byte
        opcode: u8,
        /// Offset within the code
        offset: u32,
    },

    /// Stream ended inside an instruction or section
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// ASTC opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// No operation
    Nop = 0x00,
    /// Push a 32-bit constant (operand: i32)
    ConstI32 = 0x10,
    /// Pop b, pop a, push a + b
    Add = 0x20,
    /// Pop b, pop a, push a - b
    Sub = 0x21,
    /// Pop b, pop a, push a * b
    Mul = 0x22,
    /// Pop b, pop a, push a / b (signed)
    Div = 0x23,
    /// Push a local slot (operand: u32 slot)
    LoadLocal = 0x30,
    /// Pop into a local slot (operand: u32 slot)
    StoreLocal = 0x31,
    /// Unconditional jump (operand: u32 target offset)
    Jump = 0x40,
    /// Pop; jump if zero (operand: u32 target offset)
    JumpIfFalse = 0x41,
    /// Pop a code address and call it (operand: u32 static callee, informational)
    CallUser = 0x50,
    /// Call a libc function through the dispatch table (operands: u16 id, u16 argc)
    LibcCall = 0xF0,
    /// Return the top of stack
    Return = 0xFF,
}

impl Opcode {
    /// Decode an opcode byte
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Opcode::Nop,
            0x10 => Opcode::ConstI32,
            0x20 => Opcode::Add,
            0x21 => Opcode::Sub,
            0x22 => Opcode::Mul,
            0x23 => Opcode::Div,
            0x30 => Opcode::LoadLocal,
            0x31 => Opcode::StoreLocal,
            0x40 => Opcode::Jump,
            0x41 => Opcode::JumpIfFalse,
            0x50 => Opcode::CallUser,
            0xF0 => Opcode::LibcCall,
            0xFF => Opcode::Return,
            _ => return None,
        })
    }

    /// Opcode byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Mnemonic
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::ConstI32 => "CONST_I32",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::LoadLocal => "LOAD_LOCAL",
            Opcode::StoreLocal => "STORE_LOCAL",
            Opcode::Jump => "JUMP",
            Opcode::JumpIfFalse => "JUMP_IF_FALSE",
            Opcode::CallUser => "CALL_USER",
            Opcode::LibcCall => "LIBC_CALL",
            Opcode::Return => "RETURN",
        }
    }

    /// Operand bytes following the opcode
    pub fn operand_size(self) -> usize {
        match self {
            Opcode::Nop
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Return => 0,
            Opcode::ConstI32
            | Opcode::LoadLocal
            | Opcode::StoreLocal
            | Opcode::Jump
            | Opcode::JumpIfFalse
            | Opcode::CallUser
            | Opcode::LibcCall => 4,
        }
    }
}

/// A decoded ASTC instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// No operation
    Nop,
    /// Push a constant
    ConstI32(i32),
    /// Integer addition
    Add,
    /// Integer subtraction
    Sub,
    /// Integer multiplication
    Mul,
    /// Signed integer division
    Div,
    /// Push a local slot
    LoadLocal(u32),
    /// Pop into a local slot
    StoreLocal(u32),
    /// Jump to a code offset
    Jump(u32),
    /// Pop and jump to a code offset if zero
    JumpIfFalse(u32),
    /// Indirect call through a popped address
    CallUser(u32),
    /// Late-bound libc call
    LibcCall {
        /// Numeric libc function id
        func_id: u16,
        /// Number of stack arguments
        arg_count: u16,
    },
    /// Return from the program
    Return,
}

impl Instruction {
    /// The instruction's opcode
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Nop => Opcode::Nop,
            Instruction::ConstI32(_) => Opcode::ConstI32,
            Instruction::Add => Opcode::Add,
            Instruction::Sub => Opcode::Sub,
            Instruction::Mul => Opcode::Mul,
            Instruction::Div => Opcode::Div,
            Instruction::LoadLocal(_) => Opcode::LoadLocal,
            Instruction::StoreLocal(_) => Opcode::StoreLocal,
            Instruction::Jump(_) => Opcode::Jump,
            Instruction::JumpIfFalse(_) => Opcode::JumpIfFalse,
            Instruction::CallUser(_) => Opcode::CallUser,
            Instruction::LibcCall { .. } => Opcode::LibcCall,
            Instruction::Return => Opcode::Return,
        }
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self) -> usize {
        1 + self.opcode().operand_size()
    }

    /// Jump target, for branch instructions
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Instruction::Jump(target) | Instruction::JumpIfFalse(target) => Some(*target),
            _ => None,
        }
    }

    /// Net change in operand stack depth
    pub fn stack_effect(&self) -> isize {
        match self {
            Instruction::Nop | Instruction::Jump(_) | Instruction::CallUser(_) => 0,
            Instruction::ConstI32(_) | Instruction::LoadLocal(_) => 1,
            Instruction::Add
            | Instruction::Sub
            | Instruction::Mul
            | Instruction::Div
            | Instruction::StoreLocal(_)
            | Instruction::JumpIfFalse(_) => -1,
            Instruction::LibcCall { arg_count, .. } => 1 - *arg_count as isize,
            Instruction::Return => -1,
        }
    }

    /// Encode into `writer`
    pub fn encode(&self, writer: &mut ByteWriter) {
        writer.emit_u8(self.opcode().to_u8());
        match *self {
            Instruction::ConstI32(value) => writer.emit_i32(value),
            Instruction::LoadLocal(slot) | Instruction::StoreLocal(slot) => writer.emit_u32(slot),
            Instruction::Jump(target) | Instruction::JumpIfFalse(target) => {
                writer.emit_u32(target)
            }
            Instruction::CallUser(address) => writer.emit_u32(address),
            Instruction::LibcCall {
                func_id,
                arg_count,
            } => {
                writer.emit_u16(func_id);
                writer.emit_u16(arg_count);
            }
            Instruction::Nop
            | Instruction::Add
            | Instruction::Sub
            | Instruction::Mul
            | Instruction::Div
            | Instruction::Return => {}
        }
    }

    /// Decode one instruction
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, AstcError> {
        let offset = reader.position() as u32;
        let byte = reader.read_u8()?;
        let opcode = Opcode::from_u8(byte).ok_or(AstcError::UnknownOpcode {
            opcode: byte,
            offset,
        })?;
        Ok(match opcode {
            Opcode::Nop => Instruction::Nop,
            Opcode::ConstI32 => Instruction::ConstI32(reader.read_i32()?),
            Opcode::Add => Instruction::Add,
            Opcode::Sub => Instruction::Sub,
            Opcode::Mul => Instruction::Mul,
            Opcode::Div => Instruction::Div,
            Opcode::LoadLocal => Instruction::LoadLocal(reader.read_u32()?),
            Opcode::StoreLocal => Instruction::StoreLocal(reader.read_u32()?),
            Opcode::Jump => Instruction::Jump(reader.read_u32()?),
            Opcode::JumpIfFalse => Instruction::JumpIfFalse(reader.read_u32()?),
            Opcode::CallUser => Instruction::CallUser(reader.read_u32()?),
            Opcode::LibcCall => Instruction::LibcCall {
                func_id: reader.read_u16()?,
                arg_count: reader.read_u16()?,
            },
            Opcode::Return => Instruction::Return,
        })
    }
}

/// A decoded ASTC program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AstcProgram {
    /// Format version
    pub version: u32,
    /// Entry point as a byte offset into the code
    pub entry_point: u32,
    /// Instructions in stream order
    pub instructions: Vec<Instruction>,
}

impl AstcProgram {
    /// Program starting at offset 0
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self {
            version: ASTC_VERSION,
            entry_point: 0,
            instructions,
        }
    }

    /// Decode a bare instruction stream (no file header)
    pub fn decode_code(code: &[u8]) -> Result<Vec<Instruction>, AstcError> {
        let mut reader = ByteReader::new(code);
        let mut instructions = Vec::new();
        while reader.remaining() > 0 {
            instructions.push(Instruction::decode(&mut reader)?);
        }
        Ok(instructions)
    }

    /// Whether `bytes` begins with the ASTC magic
    pub fn is_astc(bytes: &[u8]) -> bool {
        bytes.starts_with(&ASTC_MAGIC)
    }

    /// Decode an ASTC file image
    pub fn decode(bytes: &[u8]) -> Result<Self, AstcError> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.read_array::<4>()?;
        if magic != ASTC_MAGIC {
            return Err(AstcError::BadMagic(magic));
        }
        let version = reader.read_u32()?;
        if version != ASTC_VERSION {
            return Err(AstcError::UnsupportedVersion(version));
        }
        let code_size = reader.read_u32()? as usize;
        let entry_point = reader.read_u32()?;
        let code = reader.read_slice(code_size)?;

        Ok(Self {
            version,
            entry_point,
            instructions: Self::decode_code(code)?,
        })
    }

    /// Read and decode an ASTC file
    pub fn read(path: &Path) -> Result<Self, AstcError> {
        let bytes = std::fs::read(path).map_err(|source| AstcError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::decode(&bytes)
    }

    /// Encode the instruction stream without a file header
    pub fn encode_code(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(self.code_size());
        for instruction in &self.instructions {
            instruction.encode(&mut writer);
        }
        writer.into_bytes()
    }

    /// Encode as an ASTC file image
    pub fn encode(&self) -> Vec<u8> {
        let code = self.encode_code();
        let mut writer = ByteWriter::with_capacity(ASTC_HEADER_SIZE + code.len());
        writer.emit_bytes(&ASTC_MAGIC);
        writer.emit_u32(self.version);
        writer.emit_u32(code.len() as u32);
        writer.emit_u32(self.entry_point);
        writer.emit_bytes(&code);
        writer.into_bytes()
    }

    /// Size of the encoded instruction stream
    pub fn code_size(&self) -> usize {
        self.instructions.iter().map(Instruction::encoded_len).sum()
    }

    /// Byte offset of every instruction
    pub fn offsets(&self) -> Vec<u32> {
        let mut offset = 0u32;
        self.instructions
            .iter()
            .map(|instruction| {
                let at = offset;
                offset += instruction.encoded_len() as u32;
                at
            })
            .collect()
    }

    /// Number of local slots referenced (highest slot + 1)
    pub fn local_count(&self) -> u32 {
        self.instructions
            .iter()
            .filter_map(|instruction| match instruction {
                Instruction::LoadLocal(slot) | Instruction::StoreLocal(slot) => {
                    Some(slot.saturating_add(1))
                }
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// `(func_id, arg_count)` of every libc call, in stream order
    pub fn libc_calls(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.instructions.iter().filter_map(|instruction| match instruction {
            Instruction::LibcCall {
                func_id,
                arg_count,
            } => Some((*func_id, *arg_count)),
            _ => None,
        })
    }
}

/// Builder for ASTC programs
///
/// Emission methods return the byte offset of the emitted instruction so
/// callers can use it as a jump target.
#[derive(Debug, Default)]
pub struct AstcWriter {
    instructions: Vec<Instruction>,
    offset: u32,
    entry_point: u32,
}

impl AstcWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset the next instruction will be emitted at
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Append an instruction, returning its offset
    pub fn emit(&mut self, instruction: Instruction) -> u32 {
        let at = self.offset;
        self.offset += instruction.encoded_len() as u32;
        self.instructions.push(instruction);
        at
    }

    /// Emit CONST_I32
    pub fn emit_const_i32(&mut self, value: i32) -> u32 {
        self.emit(Instruction::ConstI32(value))
    }

    /// Emit LOAD_LOCAL
    pub fn emit_load_local(&mut self, slot: u32) -> u32 {
        self.emit(Instruction::LoadLocal(slot))
    }

    /// Emit STORE_LOCAL
    pub fn emit_store_local(&mut self, slot: u32) -> u32 {
        self.emit(Instruction::StoreLocal(slot))
    }

    /// Emit LIBC_CALL
    pub fn emit_libc_call(&mut self, func_id: u16, arg_count: u16) -> u32 {
        self.emit(Instruction::LibcCall {
            func_id,
            arg_count,
        })
    }

    /// Emit RETURN
    pub fn emit_return(&mut self) -> u32 {
        self.emit(Instruction::Return)
    }

    /// Emit a branch whose target is filled in later with [`AstcWriter::patch_target`]
    pub fn emit_forward_jump(&mut self, conditional: bool) -> usize {
        let index = self.instructions.len();
        if conditional {
            self.emit(Instruction::JumpIfFalse(0));
        } else {
            self.emit(Instruction::Jump(0));
        }
        index
    }

    /// Point the branch emitted at `index` at `target`
    pub fn patch_target(&mut self, index: usize, target: u32) {
        match self.instructions.get_mut(index) {
            Some(Instruction::Jump(t)) | Some(Instruction::JumpIfFalse(t)) => *t = target,
            _ => {}
        }
    }

    /// Set the entry point offset
    pub fn set_entry_point(&mut self, offset: u32) {
        self.entry_point = offset;
    }

    /// Finish the program
    pub fn into_program(self) -> AstcProgram {
        AstcProgram {
            version: ASTC_VERSION,
            entry_point: self.entry_point,
            instructions: self.instructions,
        }
    }
}
