//! ASTC to native code compilation

use crate::astc::{AstcError, AstcProgram, Instruction};
use crate::backend::{backend_for, Backend, BranchSite, Frame};
use crate::buffer::CodeBuffer;
use rtme_format::{Abi, Architecture, Target};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Code generation errors.
///
/// All of these abort compilation of the module; no partial code is
/// returned.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// No backend exists for the architecture
    #[error("No code generator for architecture {0}")]
    UnsupportedArchitecture(Architecture),

    /// The backend cannot use the requested ABI
    #[error("ABI {abi} is not supported on {arch}")]
    UnsupportedAbi {
        /// Target architecture
        arch: Architecture,
        /// Requested ABI
        abi: Abi,
    },

    /// The stream contains an opcode the backend cannot encode
    #[error("Unsupported opcode {opcode:#04x} at offset {offset} for {arch}")]
    UnsupportedOpcode {
        /// Raw opcode byte
        opcode: u8,
        /// Offset within the ASTC code
        offset: u32,
        /// Target architecture
        arch: Architecture,
    },

    /// A branch target is not an instruction boundary
    #[error("Jump at offset {offset} targets {target}, which is not an instruction boundary")]
    InvalidJumpTarget {
        /// Offset of the branch
        offset: u32,
        /// Requested target
        target: u32,
    },

    /// The entry point is not an instruction boundary
    #[error("Entry point {0} is not an instruction boundary")]
    InvalidEntryPoint(u32),

    /// Local slot outside the frame
    #[error("Local slot {slot} out of range (limit {max})")]
    LocalOutOfRange {
        /// Requested slot
        slot: u32,
        /// Number of slots available
        max: u32,
    },

    /// Call has more stack arguments than the backend supports
    #[error("Call with {count} arguments exceeds the limit of {max}")]
    TooManyArguments {
        /// Requested argument count
        count: u16,
        /// Maximum supported
        max: u16,
    },

    /// Branch displacement does not fit the encoding
    #[error("Branch at code offset {offset} is out of range")]
    BranchOutOfRange {
        /// Buffer offset of the branch
        offset: usize,
    },

    /// Malformed ASTC input
    #[error("Invalid ASTC input: {0}")]
    Astc(#[from] AstcError),
}

impl CodegenError {
    /// Classify a decode failure for `arch`; opcode bytes outside the
    /// instruction set become [`CodegenError::UnsupportedOpcode`]
    pub fn from_astc(err: AstcError, arch: Architecture) -> Self {
        match err {
            AstcError::UnknownOpcode { opcode, offset } => CodegenError::UnsupportedOpcode {
                opcode,
                offset,
                arch,
            },
            other => CodegenError::Astc(other),
        }
    }
}

/// Output of code generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCode {
    /// Target architecture
    pub arch: Architecture,
    /// Machine code
    pub code: Vec<u8>,
    /// Entry point offset into `code`
    pub entry_point: u32,
    /// Number of ASTC instructions compiled
    pub instruction_count: u32,
}

/// Code generator for a single target architecture
pub struct CodeGen {
    target_arch: Architecture,
    backend: Box<dyn Backend>,
    buffer: CodeBuffer,
}

impl std::fmt::Debug for CodeGen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeGen")
            .field("target_arch", &self.target_arch)
            .field("size", &self.buffer.len())
            .field("capacity", &self.buffer.capacity())
            .finish()
    }
}

impl CodeGen {
    /// Generator for `arch` with its conventional ABI on the host OS family
    pub fn new(arch: Architecture) -> Result<Self, CodegenError> {
        let abi = match arch {
            Architecture::X86_64 if cfg!(windows) => Abi::Win64,
            Architecture::X86_64 => Abi::SysV,
            _ => Abi::Aapcs64,
        };
        Self::with_abi(arch, abi)
    }

    /// Generator for an explicit architecture and ABI
    pub fn with_abi(arch: Architecture, abi: Abi) -> Result<Self, CodegenError> {
        Ok(Self {
            target_arch: arch,
            backend: backend_for(arch, abi)?,
            buffer: CodeBuffer::new(),
        })
    }

    /// Generator for a full target
    pub fn for_target(target: &Target) -> Result<Self, CodegenError> {
        Self::with_abi(target.arch, target.abi)
    }

    /// Target architecture
    pub fn target_arch(&self) -> Architecture {
        self.target_arch
    }

    /// Bytes emitted so far
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Current buffer capacity
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Compile an ASTC instruction stream without a file header
    pub fn compile_code(self, code: &[u8]) -> Result<CompiledCode, CodegenError> {
        let arch = self.target_arch;
        let instructions =
            AstcProgram::decode_code(code).map_err(|err| CodegenError::from_astc(err, arch))?;
        self.compile(&AstcProgram::new(instructions))
    }

    /// Compile a decoded program, consuming the generator
    pub fn compile(mut self, program: &AstcProgram) -> Result<CompiledCode, CodegenError> {
        let arch = self.target_arch;
        let offsets = program.offsets();
        let end = program.code_size() as u32;
        let index_of: HashMap<u32, usize> = offsets
            .iter()
            .enumerate()
            .map(|(index, &offset)| (offset, index))
            .collect();
        let resolve = |target: u32| -> Option<usize> {
            if target == end {
                Some(program.instructions.len())
            } else {
                index_of.get(&target).copied()
            }
        };

        for (instruction, &offset) in program.instructions.iter().zip(&offsets) {
            let opcode = instruction.opcode();
            if !self.backend.supports(opcode) {
                return Err(CodegenError::UnsupportedOpcode {
                    opcode: opcode.to_u8(),
                    offset,
                    arch,
                });
            }
            if let Some(target) = instruction.branch_target() {
                if resolve(target).is_none() {
                    return Err(CodegenError::InvalidJumpTarget { offset, target });
                }
            }
        }

        let entry = if program.entry_point != 0 {
            Some(
                resolve(program.entry_point)
                    .ok_or(CodegenError::InvalidEntryPoint(program.entry_point))?,
            )
        } else {
            None
        };
        let depths = entry_depths(program, entry, &resolve);

        let frame = Frame::new(program.local_count())?;
        // Native offset of every instruction, plus the trailing epilogue.
        let mut native = Vec::with_capacity(program.instructions.len() + 1);
        let mut branches: Vec<(BranchSite, usize)> = Vec::new();

        self.backend.emit_prologue(&mut self.buffer, &frame);
        if let Some(entry) = entry {
            let site = self.backend.emit_jump(&mut self.buffer);
            branches.push((site, entry));
        }

        for (index, instruction) in program.instructions.iter().enumerate() {
            let depth = depths[index].unwrap_or(0);
            native.push(self.buffer.len());
            trace!(index, ?instruction, depth, "lowering");

            if let Instruction::Return = instruction {
                self.backend.emit_return(&mut self.buffer, depth > 0);
                continue;
            }

            let site = self
                .backend
                .emit_instruction(&mut self.buffer, &frame, instruction)?;
            if let (Some(site), Some(target)) = (site, instruction.branch_target()) {
                let target_index = resolve(target).ok_or(CodegenError::InvalidJumpTarget {
                    offset: offsets[index],
                    target,
                })?;
                branches.push((site, target_index));
            }
        }

        native.push(self.buffer.len());
        let depth = depths[program.instructions.len()].unwrap_or(0);
        self.backend.emit_return(&mut self.buffer, depth > 0);

        for (site, target_index) in branches {
            self.backend
                .patch_branch(&mut self.buffer, site, native[target_index])?;
        }

        let code = self.buffer.into_bytes();
        debug!(
            %arch,
            instructions = program.instructions.len(),
            bytes = code.len(),
            "compiled ASTC program"
        );
        Ok(CompiledCode {
            arch,
            code,
            entry_point: 0,
            instruction_count: program.instructions.len() as u32,
        })
    }
}

/// Operand-stack depth on entry to every instruction, plus the trailing
/// epilogue at index `instructions.len()`.
///
/// Walks the control-flow graph from the entry instruction, so code
/// reached only through a later backward branch gets the depth of that
/// branch. The first depth seen for an instruction wins; `None`
/// marks unreachable code.
fn entry_depths(
    program: &AstcProgram,
    entry: Option<usize>,
    resolve: &impl Fn(u32) -> Option<usize>,
) -> Vec<Option<usize>> {
    let count = program.instructions.len();
    let mut depths = vec![None; count + 1];
    let mut worklist = Vec::new();
    let start = entry.unwrap_or(0);
    depths[start] = Some(0);
    worklist.push(start);

    while let Some(index) = worklist.pop() {
        let Some(instruction) = program.instructions.get(index) else {
            continue;
        };
        let Some(depth) = depths[index] else {
            continue;
        };
        let after = (depth as isize + instruction.stack_effect()).max(0) as usize;
        let mut successors = [None, None];
        match instruction {
            Instruction::Return => {}
            Instruction::Jump(target) => successors[0] = resolve(*target),
            Instruction::JumpIfFalse(target) => {
                successors[0] = Some(index + 1);
                successors[1] = resolve(*target);
            }
            _ => successors[0] = Some(index + 1),
        }
        for next in successors.into_iter().flatten() {
            if depths[next].is_none() {
                depths[next] = Some(after);
                worklist.push(next);
            }
        }
    }
    depths
}

/// Compile `program` for `target`
pub fn compile(program: &AstcProgram, target: &Target) -> Result<CompiledCode, CodegenError> {
    CodeGen::for_target(target)?.compile(program)
}
