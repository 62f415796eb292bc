//! Runtime error types.

use rtme_codegen::AstcError;
use rtme_format::{Architecture, FormatError};
use std::path::PathBuf;

use crate::dispatch::LibcFunction;

/// Errors from the module loader.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// No module file matches the name on any search path
    #[error("Module not found: {name}")]
    NotFound {
        /// Requested module name
        name: String,
    },

    /// The file exists but is not a usable RT module
    #[error("Invalid module {}: {source}", path.display())]
    InvalidFormat {
        /// Module file
        path: PathBuf,
        /// Why the file was rejected
        #[source]
        source: FormatError,
    },

    /// Search path table is full
    #[error("Too many search paths (limit {max})")]
    TooManySearchPaths {
        /// Maximum number of search paths
        max: usize,
    },

    /// Export table is full
    #[error("Module '{module}' has too many exports (limit {max})")]
    TooManyExports {
        /// Module name
        module: String,
        /// Maximum number of exports
        max: usize,
    },

    /// Export offset lies outside the module's code
    #[error("Export '{name}' at offset {offset} is outside the {size}-byte code section")]
    ExportOutOfRange {
        /// Symbol name
        name: String,
        /// Requested offset
        offset: u32,
        /// Code size
        size: usize,
    },

    /// The module was already removed from the table
    #[error("Module '{name}' (id {id}) is not resident")]
    NotResident {
        /// Module name
        name: String,
        /// Module id
        id: u32,
    },
}

/// Errors from mapping and running module code.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The module was built for another architecture
    #[error("Module targets {module}, host is {host}")]
    WrongArchitecture {
        /// Module architecture
        module: Architecture,
        /// Host architecture
        host: Architecture,
    },

    /// Host has no executable-memory support
    #[error("Executable memory is not supported on this platform")]
    Unsupported,

    /// Module has no code to run
    #[error("Module has no code")]
    EmptyCode,

    /// mmap or mprotect failed
    #[error("Failed to map executable memory: {0}")]
    Map(#[source] std::io::Error),
}

/// Errors from the libc dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LibcError {
    /// Id outside the libc function set
    #[error("Unknown libc function id {0:#x}")]
    UnknownFunction(u32),

    /// Known function without a registered handler
    #[error("No handler registered for {0}")]
    Unregistered(LibcFunction),

    /// Wrong number of arguments for a fixed-arity function
    #[error("{function} expects {expected} arguments, got {actual}")]
    ArgumentCount {
        /// Called function
        function: LibcFunction,
        /// Expected argument count
        expected: usize,
        /// Supplied argument count
        actual: usize,
    },
}

/// Errors from scanning and analysis in the runtime selector.
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    /// Directory or file could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// Path being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Program to analyze is not valid ASTC
    #[error("Invalid program: {0}")]
    Program(#[from] AstcError),
}

/// Errors loading a loader configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        /// Config path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for the loader
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
