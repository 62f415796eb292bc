//! ARM64 backend
//!
//! The operand stack lives on sp in 16-byte slots so sp stays 16-byte
//! aligned at every call. x0/x1 are the accumulator pair, x9 and x10 are
//! scratch.

use super::{align16, Backend, BranchKind, BranchSite, Frame};
use crate::astc::Instruction;
use crate::buffer::CodeBuffer;
use crate::CodegenError;
use rtme_format::Architecture;

const NOP: u32 = 0xD503_201F;
const RET: u32 = 0xD65F_03C0;
const STP_FP_LR_PRE: u32 = 0xA9BF_7BFD; // stp x29, x30, [sp, #-16]!
const LDP_FP_LR_POST: u32 = 0xA8C1_7BFD; // ldp x29, x30, [sp], #16
const MOV_FP_SP: u32 = 0x9100_03FD; // mov x29, sp
const MOV_SP_FP: u32 = 0x9100_03BF; // mov sp, x29
const MOV_X0_XZR: u32 = 0xAA1F_03E0; // mov x0, xzr
const B: u32 = 0x1400_0000;
const CBZ_X0: u32 = 0xB400_0000;

const FP: u32 = 29;
const SP: u32 = 31;

/// Largest operand count the stack cleanup immediate can express
const MAX_CALL_ARGS: u16 = 255;

fn push(reg: u32) -> u32 {
    0xF81F_0FE0 | reg // str xN, [sp, #-16]!
}

fn pop(reg: u32) -> u32 {
    0xF841_07E0 | reg // ldr xN, [sp], #16
}

/// ldur/stur with a signed 9-bit offset from x29
fn unscaled(base: u32, rt: u32, offset: i32) -> u32 {
    base | (((offset as u32) & 0x1FF) << 12) | (FP << 5) | rt
}

fn sub_imm(rd: u32, rn: u32, imm12: u32) -> u32 {
    0xD100_0000 | (imm12 << 10) | (rn << 5) | rd
}

fn add_imm(rd: u32, rn: u32, imm12: u32) -> u32 {
    0x9100_0000 | (imm12 << 10) | (rn << 5) | rd
}

fn movz_w(rd: u32, imm16: u16) -> u32 {
    0x5280_0000 | ((imm16 as u32) << 5) | rd
}

/// ARM64 code generator
#[derive(Debug, Clone, Copy, Default)]
pub struct Arm64Backend;

impl Arm64Backend {
    /// Create the backend (AAPCS64 only)
    pub fn new() -> Self {
        Self
    }

    fn emit_const(buf: &mut CodeBuffer, value: i32) {
        if value == 0 {
            buf.emit_u32(MOV_X0_XZR);
        } else if (1..=0xFFFF).contains(&value) {
            buf.emit_u32(0xD280_0000 | ((value as u32) << 5)); // movz x0, #imm
        } else if (-0x1_0000..0).contains(&value) {
            let inverted = !value as u32 & 0xFFFF;
            buf.emit_u32(0x9280_0000 | (inverted << 5)); // movn x0, #imm
        } else {
            let bits = value as u32;
            buf.emit_u32(movz_w(0, bits as u16));
            buf.emit_u32(0x72A0_0000 | ((bits >> 16) << 5)); // movk w0, #hi, lsl #16
            buf.emit_u32(0x9340_7C00); // sxtw x0, w0
        }
        buf.emit_u32(push(0));
    }

    fn emit_binary(buf: &mut CodeBuffer, op: u32) {
        buf.emit_u32(pop(1));
        buf.emit_u32(pop(0));
        buf.emit_u32(op);
        buf.emit_u32(push(0));
    }

    fn emit_local_access(buf: &mut CodeBuffer, offset: i32, store: bool) {
        if offset >= -256 {
            let base = if store { 0xF800_0000 } else { 0xF840_0000 }; // stur / ldur
            buf.emit_u32(unscaled(base, 0, offset));
        } else {
            buf.emit_u32(sub_imm(9, FP, (-offset) as u32));
            // str x0, [x9] / ldr x0, [x9]
            buf.emit_u32(if store { 0xF900_0120 } else { 0xF940_0120 });
        }
    }

    fn emit_libc_call(
        buf: &mut CodeBuffer,
        func_id: u16,
        arg_count: u16,
    ) -> Result<(), CodegenError> {
        if arg_count > MAX_CALL_ARGS {
            return Err(CodegenError::TooManyArguments {
                count: arg_count,
                max: MAX_CALL_ARGS,
            });
        }
        buf.emit_u32(unscaled(0xF840_0000, 9, super::CONTEXT_SLOT_OFFSET)); // ldur x9, [x29, #-8]
        buf.emit_u32(0xAA09_03E0); // mov x0, x9
        buf.emit_u32(movz_w(1, func_id));
        buf.emit_u32(movz_w(2, arg_count));
        buf.emit_u32(add_imm(3, SP, 0)); // mov x3, sp
        buf.emit_u32(0xF940_012A); // ldr x10, [x9]
        buf.emit_u32(0xD63F_0140); // blr x10
        if arg_count > 0 {
            buf.emit_u32(add_imm(SP, SP, 16 * arg_count as u32));
        }
        buf.emit_u32(push(0));
        Ok(())
    }
}

impl Backend for Arm64Backend {
    fn arch(&self) -> Architecture {
        Architecture::Arm64
    }

    fn emit_prologue(&self, buf: &mut CodeBuffer, frame: &Frame) {
        buf.emit_u32(STP_FP_LR_PRE);
        buf.emit_u32(MOV_FP_SP);
        buf.emit_u32(sub_imm(SP, SP, align16(frame.locals_size())));
        buf.emit_u32(unscaled(0xF800_0000, 0, super::CONTEXT_SLOT_OFFSET)); // stur x0, [x29, #-8]
    }

    fn emit_return(&self, buf: &mut CodeBuffer, has_value: bool) {
        if has_value {
            buf.emit_u32(pop(0));
        } else {
            buf.emit_u32(MOV_X0_XZR);
        }
        buf.emit_u32(MOV_SP_FP);
        buf.emit_u32(LDP_FP_LR_POST);
        buf.emit_u32(RET);
    }

    fn emit_jump(&self, buf: &mut CodeBuffer) -> BranchSite {
        let patch_at = buf.len();
        buf.emit_u32(B);
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
            Instruction::Nop => buf.emit_u32(NOP),
            Instruction::ConstI32(value) => Self::emit_const(buf, value),
            Instruction::Add => Self::emit_binary(buf, 0x8B01_0000), // add x0, x0, x1
            Instruction::Sub => Self::emit_binary(buf, 0xCB01_0000), // sub x0, x0, x1
            Instruction::Mul => Self::emit_binary(buf, 0x9B01_7C00), // mul x0, x0, x1
            Instruction::Div => Self::emit_binary(buf, 0x9AC1_0C00), // sdiv x0, x0, x1
            Instruction::LoadLocal(slot) => {
                Self::emit_local_access(buf, frame.local_offset(slot)?, false);
                buf.emit_u32(push(0));
            }
            Instruction::StoreLocal(slot) => {
                let offset = frame.local_offset(slot)?;
                buf.emit_u32(pop(0));
                Self::emit_local_access(buf, offset, true);
            }
            Instruction::Jump(_) => return Ok(Some(self.emit_jump(buf))),
            Instruction::JumpIfFalse(_) => {
                buf.emit_u32(pop(0));
                let patch_at = buf.len();
                buf.emit_u32(CBZ_X0);
                return Ok(Some(BranchSite {
                    patch_at,
                    kind: BranchKind::IfZero,
                }));
            }
            Instruction::CallUser(_) => {
                buf.emit_u32(pop(9));
                buf.emit_u32(0xD63F_0120); // blr x9
                buf.emit_u32(push(0));
            }
            Instruction::LibcCall {
                func_id,
                arg_count,
            } => Self::emit_libc_call(buf, func_id, arg_count)?,
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
        let out_of_range = CodegenError::BranchOutOfRange {
            offset: site.patch_at,
        };
        let words = (target as i64 - site.patch_at as i64) / 4;
        let (bits, mask, shift) = match site.kind {
            BranchKind::Always => (26, 0x03FF_FFFF, 0),
            BranchKind::IfZero => (19, 0x0007_FFFF, 5),
        };
        let limit = 1i64 << (bits - 1);
        if words < -limit || words >= limit {
            return Err(out_of_range);
        }
        let word = buf.read_u32(site.patch_at).ok_or(out_of_range)?;
        let patched = word | (((words as u32) & mask) << shift);
        buf.patch_u32(site.patch_at, patched);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(buf: &CodeBuffer) -> Vec<u32> {
        buf.as_slice()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn lower(instruction: Instruction) -> Vec<u32> {
        let mut buf = CodeBuffer::new();
        Arm64Backend::new()
            .emit_instruction(&mut buf, &Frame::new(64).unwrap(), &instruction)
            .unwrap();
        words(&buf)
    }

    #[test]
    fn test_prologue_and_epilogue() {
        let backend = Arm64Backend::new();
        let mut buf = CodeBuffer::new();
        backend.emit_prologue(&mut buf, &Frame::new(2).unwrap());
        backend.emit_return(&mut buf, true);
        assert_eq!(
            words(&buf),
            vec![
                0xA9BF_7BFD, // stp x29, x30, [sp, #-16]!
                0x9100_03FD, // mov x29, sp
                0xD100_83FF, // sub sp, sp, #32
                0xF81F_83A0, // stur x0, [x29, #-8]
                0xF841_07E0, // ldr x0, [sp], #16
                0x9100_03BF, // mov sp, x29
                0xA8C1_7BFD, // ldp x29, x30, [sp], #16
                0xD65F_03C0, // ret
            ]
        );
    }

    #[test]
    fn test_const_encodings() {
        assert_eq!(lower(Instruction::ConstI32(0)), vec![0xAA1F_03E0, 0xF81F_0FE0]);
        assert_eq!(lower(Instruction::ConstI32(42)), vec![0xD280_0540, 0xF81F_0FE0]);
        // movn x0, #0 => -1
        assert_eq!(lower(Instruction::ConstI32(-1)), vec![0x9280_0000, 0xF81F_0FE0]);
        assert_eq!(
            lower(Instruction::ConstI32(123456)),
            vec![0x529C_4800, 0x72A0_0020, 0x9340_7C00, 0xF81F_0FE0]
        );
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            lower(Instruction::Add),
            vec![0xF841_07E1, 0xF841_07E0, 0x8B01_0000, 0xF81F_0FE0]
        );
        assert_eq!(lower(Instruction::Div)[2], 0x9AC1_0C00);
        assert_eq!(lower(Instruction::Mul)[2], 0x9B01_7C00);
    }

    #[test]
    fn test_locals() {
        // ldur x0, [x29, #-16]
        assert_eq!(lower(Instruction::LoadLocal(0)), vec![0xF85F_03A0, 0xF81F_0FE0]);
        // stur x0, [x29, #-24]
        assert_eq!(lower(Instruction::StoreLocal(1)), vec![0xF841_07E0, 0xF81E_83A0]);
        // slot 40 is 336 bytes below x29: sub x9, x29, #336; ldr x0, [x9]
        assert_eq!(
            lower(Instruction::LoadLocal(40)),
            vec![0xD105_43A9, 0xF940_0120, 0xF81F_0FE0]
        );
    }

    #[test]
    fn test_libc_call() {
        let code = lower(Instruction::LibcCall {
            func_id: 0x31,
            arg_count: 1,
        });
        assert_eq!(
            code,
            vec![
                0xF85F_83A9, // ldur x9, [x29, #-8]
                0xAA09_03E0, // mov x0, x9
                0x5280_0621, // mov w1, #0x31
                0x5280_0022, // mov w2, #1
                0x9100_03E3, // mov x3, sp
                0xF940_012A, // ldr x10, [x9]
                0xD63F_0140, // blr x10
                0x9100_43FF, // add sp, sp, #16
                0xF81F_0FE0, // str x0, [sp, #-16]!
            ]
        );
    }

    #[test]
    fn test_too_many_call_args() {
        let mut buf = CodeBuffer::new();
        let err = Arm64Backend::new()
            .emit_instruction(
                &mut buf,
                &Frame::new(0).unwrap(),
                &Instruction::LibcCall {
                    func_id: 0x30,
                    arg_count: 300,
                },
            )
            .unwrap_err();
        assert!(matches!(err, CodegenError::TooManyArguments { count: 300, .. }));
    }

    #[test]
    fn test_branch_patching() {
        let backend = Arm64Backend::new();
        let mut buf = CodeBuffer::new();
        let jump = backend.emit_jump(&mut buf);
        buf.emit_u32(NOP);
        let branch = backend
            .emit_instruction(&mut buf, &Frame::new(0).unwrap(), &Instruction::JumpIfFalse(0))
            .unwrap()
            .unwrap();
        assert_eq!(branch.patch_at, 12);

        backend.patch_branch(&mut buf, jump, 16).unwrap();
        backend.patch_branch(&mut buf, branch, 4).unwrap();
        let code = words(&buf);
        assert_eq!(code[0], 0x1400_0004); // b #+16
        assert_eq!(code[3], 0xB4FF_FFC0); // cbz x0, #-8
    }

    #[test]
    fn test_branch_out_of_range() {
        let backend = Arm64Backend::new();
        let mut buf = CodeBuffer::new();
        buf.emit_u32(CBZ_X0);
        let site = BranchSite {
            patch_at: 0,
            kind: BranchKind::IfZero,
        };
        assert!(matches!(
            backend.patch_branch(&mut buf, site, 4 << 20),
            Err(CodegenError::BranchOutOfRange { offset: 0 })
        ));
    }
}
