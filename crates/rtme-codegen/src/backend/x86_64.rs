//! x86-64 backend
//!
//! The ASTC operand stack lives on the native stack in 8-byte slots.
//! rax and rcx serve as the accumulator pair, r11 holds indirect call
//! targets.

use super::{align16, Backend, BranchKind, BranchSite, Frame, CONTEXT_SLOT_OFFSET};
use crate::astc::Instruction;
use crate::buffer::CodeBuffer;
use crate::CodegenError;
use rtme_format::{Abi, Architecture};

const SHADOW_SPACE: u32 = 32;

// ModRM register numbers
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDI: u8 = 7;

const PUSH_RAX: u8 = 0x50;
const POP_RAX: u8 = 0x58;
const POP_RCX: u8 = 0x59;

/// x86-64 code generator
#[derive(Debug, Clone, Copy)]
pub struct X86_64Backend {
    abi: Abi,
}

impl X86_64Backend {
    /// Backend for the System V or Win64 calling convention
    pub fn new(abi: Abi) -> Result<Self, CodegenError> {
        match abi {
            Abi::SysV | Abi::Win64 => Ok(Self { abi }),
            other => Err(CodegenError::UnsupportedAbi {
                arch: Architecture::X86_64,
                abi: other,
            }),
        }
    }

    fn is_win64(&self) -> bool {
        self.abi == Abi::Win64
    }

    /// `op reg, [rbp + disp]` with the shortest displacement
    fn emit_rbp_operand(buf: &mut CodeBuffer, opcode: &[u8], reg: u8, disp: i32) {
        buf.emit_bytes(opcode);
        if (-128..=127).contains(&disp) {
            buf.emit_u8(0x40 | (reg << 3) | 0b101);
            buf.emit_u8(disp as i8 as u8);
        } else {
            buf.emit_u8(0x80 | (reg << 3) | 0b101);
            buf.emit_i32(disp);
        }
    }

    /// Call with rsp aligned to 16 bytes, restoring the operand stack after.
    ///
    /// rax is clobbered before the call.
    fn emit_aligned_call(&self, buf: &mut CodeBuffer, call: &[u8]) {
        buf.emit_bytes(&[0x48, 0x89, 0xE0]); // mov rax, rsp
        buf.emit_bytes(&[0x48, 0x83, 0xE4, 0xF0]); // and rsp, -16
        buf.emit_u8(PUSH_RAX);
        buf.emit_u8(PUSH_RAX);
        if self.is_win64() {
            buf.emit_bytes(&[0x48, 0x83, 0xEC, SHADOW_SPACE as u8]); // sub rsp, 32
        }
        buf.emit_bytes(call);
        if self.is_win64() {
            buf.emit_bytes(&[0x48, 0x83, 0xC4, SHADOW_SPACE as u8]); // add rsp, 32
        }
        buf.emit_u8(0x5C); // pop rsp
    }

    fn emit_const(buf: &mut CodeBuffer, value: i32) {
        if value == 0 {
            buf.emit_bytes(&[0x31, 0xC0]); // xor eax, eax
            buf.emit_u8(PUSH_RAX);
        } else if (-128..=127).contains(&value) {
            buf.emit_bytes(&[0x6A, value as i8 as u8]); // push imm8
        } else {
            buf.emit_bytes(&[0x48, 0xC7, 0xC0]); // mov rax, simm32
            buf.emit_i32(value);
            buf.emit_u8(PUSH_RAX);
        }
    }

    fn emit_binary(buf: &mut CodeBuffer, op: &[u8]) {
        buf.emit_u8(POP_RCX);
        buf.emit_u8(POP_RAX);
        buf.emit_bytes(op);
        buf.emit_u8(PUSH_RAX);
    }

    fn emit_libc_call(&self, buf: &mut CodeBuffer, func_id: u16, arg_count: u16) {
        if self.is_win64() {
            Self::emit_rbp_operand(buf, &[0x48, 0x8B], RCX, CONTEXT_SLOT_OFFSET);
            buf.emit_u8(0xBA); // mov edx, id
            buf.emit_u32(func_id as u32);
            buf.emit_bytes(&[0x41, 0xB8]); // mov r8d, argc
            buf.emit_u32(arg_count as u32);
            buf.emit_bytes(&[0x49, 0x89, 0xE1]); // mov r9, rsp
            self.emit_aligned_call(buf, &[0xFF, 0x11]); // call [rcx]
        } else {
            Self::emit_rbp_operand(buf, &[0x48, 0x8B], RDI, CONTEXT_SLOT_OFFSET);
            buf.emit_u8(0xBE); // mov esi, id
            buf.emit_u32(func_id as u32);
            buf.emit_u8(0xBA); // mov edx, argc
            buf.emit_u32(arg_count as u32);
            buf.emit_bytes(&[0x48, 0x89, 0xE1]); // mov rcx, rsp
            self.emit_aligned_call(buf, &[0xFF, 0x17]); // call [rdi]
        }
        if arg_count > 0 {
            buf.emit_bytes(&[0x48, 0x81, 0xC4]); // add rsp, imm32
            buf.emit_u32(8 * arg_count as u32);
        }
        buf.emit_u8(PUSH_RAX);
    }
}

impl Backend for X86_64Backend {
    fn arch(&self) -> Architecture {
        Architecture::X86_64
    }

    fn emit_prologue(&self, buf: &mut CodeBuffer, frame: &Frame) {
        buf.emit_u8(0x55); // push rbp
        buf.emit_bytes(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
        buf.emit_bytes(&[0x48, 0x81, 0xEC]); // sub rsp, imm32
        buf.emit_u32(align16(frame.locals_size() + SHADOW_SPACE));
        let ctx_reg = if self.is_win64() { RCX } else { RDI };
        Self::emit_rbp_operand(buf, &[0x48, 0x89], ctx_reg, CONTEXT_SLOT_OFFSET);
    }

    fn emit_return(&self, buf: &mut CodeBuffer, has_value: bool) {
        if has_value {
            buf.emit_u8(POP_RAX);
        } else {
            buf.emit_bytes(&[0x31, 0xC0]); // xor eax, eax
        }
        buf.emit_bytes(&[0x48, 0x89, 0xEC]); // mov rsp, rbp
        buf.emit_u8(0x5D); // pop rbp
        buf.emit_u8(0xC3); // ret
    }

    fn emit_jump(&self, buf: &mut CodeBuffer) -> BranchSite {
        buf.emit_u8(0xE9); // jmp rel32
        let patch_at = buf.len();
        buf.emit_u32(0);
        BranchSite {
            patch_at,
            kind: BranchKind::Always,
        }
    }

    fn emit_instruction(
        &self,
        buf: &mut CodeBuffer,
        frame: &Frame,
        instruction: &Instruction,
    ) -> Result<Option<BranchSite>, CodegenError> {
        match *instruction {
            Instruction::Nop => buf.emit_u8(0x90),
            Instruction::ConstI32(value) => Self::emit_const(buf, value),
            Instruction::Add => Self::emit_binary(buf, &[0x48, 0x01, 0xC8]), // add rax, rcx
            Instruction::Sub => Self::emit_binary(buf, &[0x48, 0x29, 0xC8]), // sub rax, rcx
            Instruction::Mul => Self::emit_binary(buf, &[0x48, 0x0F, 0xAF, 0xC1]), // imul rax, rcx
            // cqo; idiv rcx
            Instruction::Div => Self::emit_binary(buf, &[0x48, 0x99, 0x48, 0xF7, 0xF9]),
            Instruction::LoadLocal(slot) => {
                let disp = frame.local_offset(slot)?;
                Self::emit_rbp_operand(buf, &[0x48, 0x8B], RAX, disp);
                buf.emit_u8(PUSH_RAX);
            }
            Instruction::StoreLocal(slot) => {
                let disp = frame.local_offset(slot)?;
                buf.emit_u8(POP_RAX);
                Self::emit_rbp_operand(buf, &[0x48, 0x89], RAX, disp);
            }
            Instruction::Jump(_) => return Ok(Some(self.emit_jump(buf))),
            Instruction::JumpIfFalse(_) => {
                buf.emit_u8(POP_RAX);
                buf.emit_bytes(&[0x48, 0x85, 0xC0]); // test rax, rax
                buf.emit_bytes(&[0x0F, 0x84]); // jz rel32
                let patch_at = buf.len();
                buf.emit_u32(0);
                return Ok(Some(BranchSite {
                    patch_at,
                    kind: BranchKind::IfZero,
                }));
            }
            Instruction::CallUser(_) => {
                buf.emit_bytes(&[0x41, 0x5B]); // pop r11
                self.emit_aligned_call(buf, &[0x41, 0xFF, 0xD3]); // call r11
                buf.emit_u8(PUSH_RAX);
            }
            Instruction::LibcCall {
                func_id,
                arg_count,
            } => self.emit_libc_call(buf, func_id, arg_count),
            Instruction::Return => self.emit_return(buf, true),
        }
        Ok(None)
    }

    fn patch_branch(
        &self,
        buf: &mut CodeBuffer,
        site: BranchSite,
        target: usize,
    ) -> Result<(), CodegenError> {
        let next = site.patch_at as i64 + 4;
        let rel = i32::try_from(target as i64 - next).map_err(|_| {
            CodegenError::BranchOutOfRange {
                offset: site.patch_at,
            }
        })?;
        if buf.patch_u32(site.patch_at, rel as u32) {
            Ok(())
        } else {
            Err(CodegenError::BranchOutOfRange {
                offset: site.patch_at,
            })
        }
    }
}
