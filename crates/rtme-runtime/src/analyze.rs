//! Requirement profiles for ASTC programs

use crate::dispatch::LibcFunction;
use crate::error::SelectorError;
use crate::selector::{Capabilities, OptimizationPreference, ProgramRequirements};
use rtme_codegen::AstcProgram;
use std::collections::BTreeSet;
use std::path::Path;

/// Stack every program gets before locals are counted
pub const BASE_STACK: u64 = 64 * 1024;
/// Heap every program gets
pub const BASE_HEAP: u64 = 1024 * 1024;
/// Heap multiplier for programs that call malloc
pub const MALLOC_HEAP_FACTOR: u64 = 4;

/// Derive the requirements of the ASTC program at `path`
pub fn analyze_program(path: &Path) -> Result<ProgramRequirements, SelectorError> {
    let file_size = std::fs::metadata(path)
        .map_err(|source| SelectorError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    let program = AstcProgram::read(path)?;
    Ok(requirements_for(&program, file_size))
}

/// Requirements of a decoded program whose file is `file_size` bytes
pub fn requirements_for(program: &AstcProgram, file_size: u64) -> ProgramRequirements {
    let libc_ids: BTreeSet<u16> = program.libc_calls().map(|(id, _)| id).collect();
    let calls = |function: LibcFunction| libc_ids.contains(&function.id());

    let mut min_heap_size = BASE_HEAP;
    if calls(LibcFunction::Malloc) {
        min_heap_size *= MALLOC_HEAP_FACTOR;
    }
    let needs = Capabilities {
        file_io: LibcFunction::ALL
            .into_iter()
            .any(|f| f.is_file_io() && calls(f)),
        ..Capabilities::default()
    };

    ProgramRequirements {
        min_memory: 2 * file_size,
        min_stack_size: BASE_STACK + 8 * program.local_count() as u64,
        min_heap_size,
        needs,
        libc_functions_used: libc_ids.len() as u32,
        optimization_preference: OptimizationPreference::Balanced,
        max_memory_footprint: None,
    }
}
