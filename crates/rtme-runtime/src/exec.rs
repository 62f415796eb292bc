//! Executable memory for module code

use crate::error::ExecError;
use rtme_codegen::abi::{DispatchContext, EntryFn};

/// Module code mapped read+execute.
pub struct CodeRegion {
    /// Base address of the mapping.
    #[cfg(unix)]
    base: *const u8,

    /// Mapped size in bytes.
    size: usize,
}

// The region is never written after mprotect, so sharing it is sound.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    /// Copy `code` into fresh memory and make it executable (W^X).
    #[cfg(unix)]
    pub fn map(code: &[u8]) -> Result<Self, ExecError> {
        if code.is_empty() {
            return Err(ExecError::EmptyCode);
        }

        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                code.len(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(ExecError::Map(std::io::Error::last_os_error()));
            }

            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());

            if libc::mprotect(ptr, code.len(), libc::PROT_READ | libc::PROT_EXEC) != 0 {
                let err = std::io::Error::last_os_error();
                libc::munmap(ptr, code.len());
                return Err(ExecError::Map(err));
            }

            Ok(Self {
                base: ptr as *const u8,
                size: code.len(),
            })
        }
    }

    /// Executable memory is only implemented for unix hosts.
    #[cfg(not(unix))]
    pub fn map(_code: &[u8]) -> Result<Self, ExecError> {
        Err(ExecError::Unsupported)
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run the code at `offset` as a program entry point.
    ///
    /// # Safety
    /// `offset` must be the start of code produced for the host by the
    /// code generator, and `ctx` must point at a table that outlives the
    /// call.
    pub unsafe fn call(&self, offset: u32, ctx: &DispatchContext) -> i64 {
        #[cfg(unix)]
        {
            let entry: EntryFn = std::mem::transmute(self.base.add(offset as usize));
            entry(ctx)
        }
        #[cfg(not(unix))]
        {
            let _ = (offset, ctx);
            unreachable!("CodeRegion cannot be constructed on this platform")
        }
    }
}

impl std::fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRegion").field("size", &self.size).finish()
    }
}

#[cfg(unix)]
impl Drop for CodeRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}
