//! Late-bound libc dispatch ABI
//!
//! Generated code never embeds a libc address. A LIBC_CALL passes the
//! numeric function id and argument count to a dispatch function reached
//! through the [`DispatchContext`] that the runtime hands to the entry
//! point as its first argument. The prologue spills that pointer to the
//! first frame slot.

use rtme_format::Architecture;
use std::ffi::c_void;

/// Dispatch entry point called by generated code.
///
/// `args` points at the top of the operand stack: the last pushed argument
/// comes first, consecutive arguments are `slot_stride` bytes apart and
/// each holds a little-endian 64-bit value.
pub type DispatchFn = unsafe extern "C" fn(
    ctx: *const DispatchContext,
    func_id: u32,
    arg_count: u32,
    args: *const u8,
) -> u64;

/// Context handed to generated code at entry
///
/// `dispatch` must stay the first field; generated code calls through
/// offset 0 of the context pointer.
#[repr(C)]
#[derive(Debug)]
pub struct DispatchContext {
    /// Dispatch function
    pub dispatch: DispatchFn,
    /// Distance in bytes between operand stack slots
    pub slot_stride: u32,
    /// Opaque pointer for the dispatch function
    pub user_data: *const c_void,
}

/// Signature of a compiled program's entry point
pub type EntryFn = unsafe extern "C" fn(ctx: *const DispatchContext) -> i64;

/// Operand stack slot size for an architecture
pub fn slot_stride(arch: Architecture) -> u32 {
    match arch {
        Architecture::Arm64 => 16,
        _ => 8,
    }
}

/// Read the arguments of a dispatched call in push order.
///
/// # Safety
/// `args` must point at `arg_count` readable slots spaced `slot_stride`
/// bytes apart.
pub unsafe fn read_args(args: *const u8, arg_count: u32, slot_stride: u32) -> Vec<u64> {
    (0..arg_count as usize)
        .rev()
        .map(|slot| {
            let at = args.add(slot * slot_stride as usize) as *const u64;
            u64::from_le(at.read_unaligned())
        })
        .collect()
}
