//! `rtme inspect`: Print the header and metadata of an RT file.

use anyhow::Context;
use rtme_format::{features, flags};
use std::io::Write;
use std::path::Path;

const FLAG_NAMES: [(u8, &str); 8] = [
    (flags::COMPRESSED, "compressed"),
    (flags::ENCRYPTED, "encrypted"),
    (flags::DEBUG_INFO, "debug-info"),
    (flags::OPTIMIZED, "optimized"),
    (flags::RELOCATABLE, "relocatable"),
    (flags::SHARED, "shared"),
    (flags::EXECUTABLE, "executable"),
    (flags::PIC, "pic"),
];

const FEATURE_NAMES: [(u32, &str); 7] = [
    (features::LIBC_FORWARDING, "libc-forwarding"),
    (features::DYNAMIC_LINKING, "dynamic-linking"),
    (features::THREAD_SAFE, "thread-safe"),
    (features::FLOATING_POINT, "floating-point"),
    (features::FILE_IO, "file-io"),
    (features::GRAPHICS, "graphics"),
    (features::PROFILING, "profiling"),
];

pub fn execute(file: &Path, out: &mut impl Write) -> anyhow::Result<()> {
    let summary = rtme_format::inspect(file)
        .with_context(|| format!("cannot inspect {}", file.display()))?;
    let header = &summary.header;

    writeln!(out, "File:         {} ({} bytes)", file.display(), summary.file_size)?;
    writeln!(out, "Version:      {}", header.version)?;
    writeln!(out, "Target:       {}", header.target())?;
    writeln!(out, "Code:        {:>8} bytes", header.code_size)?;
    if header.is_compressed() {
        writeln!(out, "Uncompressed:{:>8} bytes", header.uncompressed_code_size)?;
    }
    writeln!(out, "Data:        {:>8} bytes", header.data_size)?;
    writeln!(out, "Entry point:  {:#x}", header.entry_point)?;
    writeln!(out, "Optimization: O{}", header.optimization_level)?;
    writeln!(out, "Stack:        {} bytes minimum", header.min_stack_size)?;
    writeln!(out, "Heap:         {} bytes minimum", header.min_heap_size)?;
    writeln!(out, "Checksum:     {:#010x}", header.checksum)?;

    let set_flags: Vec<&str> = FLAG_NAMES
        .iter()
        .filter(|(bit, _)| header.has_flag(*bit))
        .map(|(_, name)| *name)
        .collect();
    writeln!(out, "Flags:        {}", list_or_none(&set_flags))?;
    let set_features: Vec<&str> = FEATURE_NAMES
        .iter()
        .filter(|(bit, _)| header.has_feature(*bit))
        .map(|(_, name)| *name)
        .collect();
    writeln!(out, "Features:     {}", list_or_none(&set_features))?;

    if let Some(meta) = &summary.metadata {
        writeln!(out)?;
        writeln!(out, "Compiler:     {} {}", meta.compiler_name, meta.compiler_version)?;
        writeln!(out, "Built:        {}", meta.build_date)?;
        if !meta.build_flags.is_empty() {
            writeln!(out, "Build flags:  {}", meta.build_flags)?;
        }
        writeln!(out, "Compile time: {} ms", meta.compilation_time_ms)?;
        if meta.astc_instruction_count > 0 {
            writeln!(out, "ASTC instrs:  {}", meta.astc_instruction_count)?;
        }
        writeln!(out, "Libc funcs:   {}", meta.libc_function_count)?;
    }
    Ok(())
}

fn list_or_none(names: &[&str]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}
