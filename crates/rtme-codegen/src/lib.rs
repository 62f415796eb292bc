//! ASTC to native code generation
//!
//! Lowers ASTC stack-machine bytecode to x86-64 or ARM64 machine code.
//! The generated code is position independent: branches are relative and
//! libc calls go through the dispatch context described in [`abi`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod abi;
pub mod astc;
pub mod backend;
pub mod buffer;
pub mod compile;

pub use abi::{read_args, slot_stride, DispatchContext, DispatchFn, EntryFn};
pub use astc::{AstcError, AstcProgram, AstcWriter, Instruction, Opcode};
pub use buffer::CodeBuffer;
pub use compile::{compile, CodeGen, CodegenError, CompiledCode};
