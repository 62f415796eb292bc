//! RTME runtime
//!
//! Loads `.rt` modules into a reference-counted table, injects the libc
//! dispatch table generated code calls through, and picks the best runtime
//! for a program among several candidates.

#![warn(rust_2018_idioms)]

pub mod analyze;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod loader;
pub mod module;
pub mod selector;

pub use analyze::{analyze_program, requirements_for};
pub use config::LoaderConfig;
pub use dispatch::{LibcFunction, LibcHandler, LibcTable};
pub use error::{ConfigError, ExecError, LibcError, LoaderError, SelectorError};
pub use exec::CodeRegion;
pub use loader::{LoaderStats, ModuleLoader, MAX_SEARCH_PATHS};
pub use module::{Export, Module, ModuleKind, ModuleState, ModuleSummary};
pub use selector::{
    Capabilities, OptimizationPreference, ProgramRequirements, RuntimeInfo, RuntimeSelector,
    ScoredRuntime, SelectionCriteria, SelectionStrategy,
};
