//! Target backends
//!
//! A backend lowers one ASTC instruction at a time into a [`CodeBuffer`].
//! Branches are emitted with a zero displacement and reported as a
//! [`BranchSite`]; the compiler patches them once every target offset is
//! known.

pub mod arm64;
pub mod x86_64;

use crate::astc::{Instruction, Opcode};
use crate::buffer::CodeBuffer;
use crate::CodegenError;
use rtme_format::{Abi, Architecture};

pub use arm64::Arm64Backend;
pub use x86_64::X86_64Backend;

/// Highest number of local slots a frame may hold
pub const MAX_LOCALS: u32 = 256;

/// Stack frame layout shared by prologue and local accesses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Number of local slots
    pub local_count: u32,
}

impl Frame {
    /// Frame for `local_count` slots
    pub fn new(local_count: u32) -> Result<Self, CodegenError> {
        if local_count > MAX_LOCALS {
            return Err(CodegenError::LocalOutOfRange {
                slot: local_count - 1,
                max: MAX_LOCALS,
            });
        }
        Ok(Self { local_count })
    }

    /// Bytes below the frame pointer holding the context slot and locals
    pub fn locals_size(&self) -> u32 {
        8 * (self.local_count + 1)
    }

    /// Frame-pointer relative offset of a local slot (negative)
    pub fn local_offset(&self, slot: u32) -> Result<i32, CodegenError> {
        if slot >= self.local_count {
            return Err(CodegenError::LocalOutOfRange {
                slot,
                max: self.local_count,
            });
        }
        Ok(-(8 * (slot as i32 + 2)))
    }
}

/// Frame-pointer relative offset of the spilled dispatch context
pub const CONTEXT_SLOT_OFFSET: i32 = -8;

/// Round up to a multiple of 16
pub fn align16(value: u32) -> u32 {
    (value + 15) & !15
}

/// Kind of branch awaiting a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Unconditional jump
    Always,
    /// Jump when the popped value is zero
    IfZero,
}

/// A branch emitted before its target was known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchSite {
    /// Buffer offset the backend needs to patch
    pub patch_at: usize,
    /// Branch kind
    pub kind: BranchKind,
}

/// Machine-code backend for one architecture
pub trait Backend {
    /// Target architecture
    fn arch(&self) -> Architecture;

    /// Whether the backend can encode `opcode`
    fn supports(&self, opcode: Opcode) -> bool {
        let _ = opcode;
        true
    }

    /// Save the frame pointer, reserve the frame and spill the context
    fn emit_prologue(&self, buf: &mut CodeBuffer, frame: &Frame);

    /// Move the return value into place (or zero it), restore the frame and return
    fn emit_return(&self, buf: &mut CodeBuffer, has_value: bool);

    /// Emit an unconditional branch with an unresolved target
    fn emit_jump(&self, buf: &mut CodeBuffer) -> BranchSite;

    /// Lower a non-branch instruction
    fn emit_instruction(
        &self,
        buf: &mut CodeBuffer,
        frame: &Frame,
        instruction: &Instruction,
    ) -> Result<Option<BranchSite>, CodegenError>;

    /// Point a branch at `target` (a buffer offset)
    fn patch_branch(
        &self,
        buf: &mut CodeBuffer,
        site: BranchSite,
        target: usize,
    ) -> Result<(), CodegenError>;
}

/// Select the backend for a target
pub fn backend_for(arch: Architecture, abi: Abi) -> Result<Box<dyn Backend>, CodegenError> {
    match arch {
        Architecture::X86_64 => Ok(Box::new(X86_64Backend::new(abi)?)),
        Architecture::Arm64 => Ok(Box::new(Arm64Backend::new())),
        other => Err(CodegenError::UnsupportedArchitecture(other)),
    }
}
