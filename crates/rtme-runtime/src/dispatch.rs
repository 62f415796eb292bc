//! Late-bound libc dispatch
//!
//! Generated code never holds a libc address. A LIBC_CALL hands its
//! function id and arguments to the dispatch trampoline, which looks the
//! id up in the [`LibcTable`] a module was loaded with.

use crate::error::LibcError;
use rtme_codegen::abi::{read_args, slot_stride, DispatchContext};
use rtme_format::Architecture;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// Libc functions reachable from generated code
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LibcFunction {
    /// `printf(fmt, ...)`
    Printf = 0x30,
    /// `malloc(size)`
    Malloc = 0x31,
    /// `free(ptr)`
    Free = 0x32,
    /// `fopen(path, mode)`
    Fopen = 0x33,
    /// `fclose(file)`
    Fclose = 0x34,
    /// `fread(ptr, size, count, file)`
    Fread = 0x35,
    /// `fwrite(ptr, size, count, file)`
    Fwrite = 0x36,
    /// `strlen(s)`
    Strlen = 0x37,
    /// `strcmp(a, b)`
    Strcmp = 0x38,
    /// `memcpy(dst, src, n)`
    Memcpy = 0x39,
    /// `memset(dst, byte, n)`
    Memset = 0x3A,
}

impl LibcFunction {
    /// Every function, in id order
    pub const ALL: [LibcFunction; 11] = [
        LibcFunction::Printf,
        LibcFunction::Malloc,
        LibcFunction::Free,
        LibcFunction::Fopen,
        LibcFunction::Fclose,
        LibcFunction::Fread,
        LibcFunction::Fwrite,
        LibcFunction::Strlen,
        LibcFunction::Strcmp,
        LibcFunction::Memcpy,
        LibcFunction::Memset,
    ];

    /// Look up a function by its numeric id
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.id() as u32 == id)
    }

    /// Numeric id used in LIBC_CALL
    pub fn id(self) -> u16 {
        self as u16
    }

    /// C name
    pub fn name(self) -> &'static str {
        match self {
            LibcFunction::Printf => "printf",
            LibcFunction::Malloc => "malloc",
            LibcFunction::Free => "free",
            LibcFunction::Fopen => "fopen",
            LibcFunction::Fclose => "fclose",
            LibcFunction::Fread => "fread",
            LibcFunction::Fwrite => "fwrite",
            LibcFunction::Strlen => "strlen",
            LibcFunction::Strcmp => "strcmp",
            LibcFunction::Memcpy => "memcpy",
            LibcFunction::Memset => "memset",
        }
    }

    /// Fixed argument count, `None` for variadic functions
    pub fn arity(self) -> Option<usize> {
        match self {
            LibcFunction::Printf => None,
            LibcFunction::Malloc
            | LibcFunction::Free
            | LibcFunction::Fclose
            | LibcFunction::Strlen => Some(1),
            LibcFunction::Fopen | LibcFunction::Strcmp => Some(2),
            LibcFunction::Memcpy | LibcFunction::Memset => Some(3),
            LibcFunction::Fread | LibcFunction::Fwrite => Some(4),
        }
    }

    /// Whether the function touches files
    pub fn is_file_io(self) -> bool {
        matches!(
            self,
            LibcFunction::Fopen | LibcFunction::Fclose | LibcFunction::Fread | LibcFunction::Fwrite
        )
    }
}

impl fmt::Display for LibcFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Implementation of one libc function.
///
/// Arguments arrive in call order as raw 64-bit values; pointers are
/// passed as addresses.
pub trait LibcHandler: Send + Sync {
    /// Run the function
    fn call(&self, args: &[u64]) -> u64;
}

impl<F> LibcHandler for F
where
    F: Fn(&[u64]) -> u64 + Send + Sync,
{
    fn call(&self, args: &[u64]) -> u64 {
        self(args)
    }
}

/// Table mapping libc function ids to handlers
#[derive(Clone, Default)]
pub struct LibcTable {
    handlers: HashMap<LibcFunction, Arc<dyn LibcHandler>>,
}

impl LibcTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table backed by the host C library.
    ///
    /// Empty on platforms without one.
    pub fn host() -> Self {
        let mut table = Self::new();
        #[cfg(unix)]
        host::install(&mut table);
        table
    }

    /// Register a handler, returning the one it replaced
    pub fn register(
        &mut self,
        function: LibcFunction,
        handler: impl LibcHandler + 'static,
    ) -> Option<Arc<dyn LibcHandler>> {
        self.handlers.insert(function, Arc::new(handler))
    }

    /// Handler for a function
    pub fn get(&self, function: LibcFunction) -> Option<Arc<dyn LibcHandler>> {
        self.handlers.get(&function).cloned()
    }

    /// Whether a handler is registered
    pub fn has(&self, function: LibcFunction) -> bool {
        self.handlers.contains_key(&function)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered functions in id order
    pub fn functions(&self) -> Vec<LibcFunction> {
        let mut functions: Vec<_> = self.handlers.keys().copied().collect();
        functions.sort();
        functions
    }

    /// Call a function by numeric id
    pub fn call(&self, func_id: u32, args: &[u64]) -> Result<u64, LibcError> {
        let function = LibcFunction::from_id(func_id).ok_or(LibcError::UnknownFunction(func_id))?;
        if let Some(expected) = function.arity() {
            if args.len() != expected {
                return Err(LibcError::ArgumentCount {
                    function,
                    expected,
                    actual: args.len(),
                });
            }
        }
        let handler = self
            .handlers
            .get(&function)
            .ok_or(LibcError::Unregistered(function))?;
        trace!(%function, ?args, "libc call");
        Ok(handler.call(args))
    }

    /// Dispatch context for code generated for `arch`.
    ///
    /// The context borrows `self` through a raw pointer; the table must
    /// outlive every call made through it.
    pub fn dispatch_context(&self, arch: Architecture) -> DispatchContext {
        DispatchContext {
            dispatch: dispatch_trampoline,
            slot_stride: slot_stride(arch),
            user_data: self as *const LibcTable as *const c_void,
        }
    }
}

impl fmt::Debug for LibcTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibcTable")
            .field("count", &self.len())
            .field("functions", &self.functions())
            .finish()
    }
}

/// Entry point generated code calls for every LIBC_CALL.
///
/// Failed lookups return 0 to the program and are logged.
unsafe extern "C" fn dispatch_trampoline(
    ctx: *const DispatchContext,
    func_id: u32,
    arg_count: u32,
    args: *const u8,
) -> u64 {
    let ctx = &*ctx;
    let table = &*(ctx.user_data as *const LibcTable);
    let values = read_args(args, arg_count, ctx.slot_stride);
    match table.call(func_id, &values) {
        Ok(value) => value,
        Err(err) => {
            warn!(%err, "libc dispatch failed");
            0
        }
    }
}

#[cfg(unix)]
mod host {
    //! Handlers forwarding to the host libc. Pointer arguments come from the
    //! running program and are trusted.

    use super::{LibcFunction, LibcTable};
    use libc::{c_char, c_int, c_void, size_t, FILE};
    use tracing::warn;

    const MAX_PRINTF_ARGS: usize = 6;

    fn printf(args: &[u64]) -> u64 {
        let Some((&format, rest)) = args.split_first() else {
            return 0;
        };
        let format = format as *const c_char;
        if rest.len() > MAX_PRINTF_ARGS {
            warn!(count = rest.len(), "printf arguments beyond {} ignored", MAX_PRINTF_ARGS);
        }
        let a = |i: usize| rest.get(i).copied().unwrap_or(0);
        let written = unsafe {
            match rest.len() {
                0 => libc::printf(format),
                1 => libc::printf(format, a(0)),
                2 => libc::printf(format, a(0), a(1)),
                3 => libc::printf(format, a(0), a(1), a(2)),
                4 => libc::printf(format, a(0), a(1), a(2), a(3)),
                5 => libc::printf(format, a(0), a(1), a(2), a(3), a(4)),
                _ => libc::printf(format, a(0), a(1), a(2), a(3), a(4), a(5)),
            }
        };
        written as i64 as u64
    }

    pub(super) fn install(table: &mut LibcTable) {
        table.register(LibcFunction::Printf, printf);
        table.register(LibcFunction::Malloc, |args: &[u64]| unsafe {
            libc::malloc(args[0] as size_t) as u64
        });
        table.register(LibcFunction::Free, |args: &[u64]| {
            unsafe { libc::free(args[0] as *mut c_void) };
            0u64
        });
        table.register(LibcFunction::Fopen, |args: &[u64]| unsafe {
            libc::fopen(args[0] as *const c_char, args[1] as *const c_char) as u64
        });
        table.register(LibcFunction::Fclose, |args: &[u64]| unsafe {
            libc::fclose(args[0] as *mut FILE) as i64 as u64
        });
        table.register(LibcFunction::Fread, |args: &[u64]| unsafe {
            libc::fread(
                args[0] as *mut c_void,
                args[1] as size_t,
                args[2] as size_t,
                args[3] as *mut FILE,
            ) as u64
        });
        table.register(LibcFunction::Fwrite, |args: &[u64]| unsafe {
            libc::fwrite(
                args[0] as *const c_void,
                args[1] as size_t,
                args[2] as size_t,
                args[3] as *mut FILE,
            ) as u64
        });
        table.register(LibcFunction::Strlen, |args: &[u64]| unsafe {
            libc::strlen(args[0] as *const c_char) as u64
        });
        table.register(LibcFunction::Strcmp, |args: &[u64]| unsafe {
            libc::strcmp(args[0] as *const c_char, args[1] as *const c_char) as i64 as u64
        });
        table.register(LibcFunction::Memcpy, |args: &[u64]| unsafe {
            libc::memcpy(
                args[0] as *mut c_void,
                args[1] as *const c_void,
                args[2] as size_t,
            ) as u64
        });
        table.register(LibcFunction::Memset, |args: &[u64]| unsafe {
            libc::memset(args[0] as *mut c_void, args[1] as c_int, args[2] as size_t) as u64
        });
    }
}
