//! RT module build pipeline behind `rt_builder`

use anyhow::{bail, Context};
use rtme_codegen::{AstcProgram, CodeGen, CodegenError};
use rtme_format::{features, flags, verify_integrity, write, RtHeader, RtMetadata, Target};
use rtme_runtime::LibcFunction;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// Default minimum stack size
pub const DEFAULT_STACK_SIZE: u32 = 64 * 1024;
/// Default minimum heap size
pub const DEFAULT_HEAP_SIZE: u32 = 1024 * 1024;

/// Settings for one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Target triple
    pub target: Target,
    /// Optimization level (0-3)
    pub optimization_level: u32,
    /// Minimum stack size in bytes
    pub stack_size: u32,
    /// Minimum heap size in bytes
    pub heap_size: u32,
    /// Mark as carrying debug information
    pub debug: bool,
    /// Store the code section compressed
    pub compress: bool,
}

impl BuildOptions {
    /// Defaults for `target`
    pub fn new(target: Target) -> Self {
        Self {
            target,
            optimization_level: 1,
            stack_size: DEFAULT_STACK_SIZE,
            heap_size: DEFAULT_HEAP_SIZE,
            debug: false,
            compress: false,
        }
    }

    /// Build flags as recorded in the metadata, e.g. `-O2 -g`
    pub fn build_flags(&self) -> String {
        let mut out = format!("-O{}", self.optimization_level);
        if self.debug {
            out.push_str(" -g");
        }
        if self.compress {
            out.push_str(" -z");
        }
        out
    }
}

/// Header, sections and metadata ready to be written
#[derive(Debug, Clone)]
pub struct BuiltModule {
    /// File header
    pub header: RtHeader,
    /// Code section
    pub code: Vec<u8>,
    /// Metadata trailer
    pub metadata: RtMetadata,
    /// Whether the input was ASTC bytecode
    pub from_astc: bool,
}

/// Turn an input buffer into a module.
///
/// ASTC input is compiled for the target; anything else is packaged as
/// raw machine code.
pub fn build_module(input: &[u8], options: &BuildOptions) -> anyhow::Result<BuiltModule> {
    let started = Instant::now();
    let mut header = RtHeader::new(options.target);
    header.optimization_level = options.optimization_level;
    header.min_stack_size = options.stack_size;
    header.min_heap_size = options.heap_size;
    if options.optimization_level > 0 {
        header.flags |= flags::OPTIMIZED;
    }
    if options.debug {
        header.flags |= flags::DEBUG_INFO;
        header.feature_flags |= features::PROFILING;
    }
    if options.compress {
        header.flags |= flags::COMPRESSED;
    }

    let mut metadata = RtMetadata::with_compiler("rt_builder", env!("CARGO_PKG_VERSION"));
    metadata.build_flags = options.build_flags();

    let from_astc = AstcProgram::is_astc(input);
    let code = if from_astc {
        let program = AstcProgram::decode(input)
            .map_err(|err| CodegenError::from_astc(err, options.target.arch))
            .context("invalid ASTC input")?;
        let compiled = CodeGen::for_target(&options.target)
            .and_then(|codegen| codegen.compile(&program))
            .with_context(|| format!("code generation for {} failed", options.target))?;

        let mut libc_ids: Vec<u16> = program.libc_calls().map(|(id, _)| id).collect();
        libc_ids.sort_unstable();
        libc_ids.dedup();
        if !libc_ids.is_empty() {
            header.feature_flags |= features::LIBC_FORWARDING;
        }
        let file_io = libc_ids
            .iter()
            .filter_map(|&id| LibcFunction::from_id(id as u32))
            .any(LibcFunction::is_file_io);
        if file_io {
            header.feature_flags |= features::FILE_IO;
        }

        header.entry_point = compiled.entry_point;
        metadata.astc_instruction_count = compiled.instruction_count;
        metadata.libc_function_count = LibcFunction::ALL.len() as u32;
        compiled.code
    } else {
        input.to_vec()
    };

    metadata.compilation_time_ms = started.elapsed().as_millis().min(u32::MAX as u128) as u32;
    Ok(BuiltModule {
        header,
        code,
        metadata,
        from_astc,
    })
}

/// Build `input` into `output` and verify the written file
pub fn build_file(input: &Path, output: &Path, options: &BuildOptions) -> anyhow::Result<BuiltModule> {
    let bytes = std::fs::read(input)
        .with_context(|| format!("cannot read input file {}", input.display()))?;
    let built = build_module(&bytes, options)?;

    let header = write(output, &built.header, &built.code, &[], Some(&built.metadata))
        .with_context(|| format!("cannot write {}", output.display()))?;
    if !verify_integrity(output) {
        bail!("integrity check failed for {}", output.display());
    }

    info!(
        input = %input.display(),
        output = %output.display(),
        target = %options.target,
        code_size = built.code.len(),
        astc = built.from_astc,
        "module built"
    );
    Ok(BuiltModule { header, ..built })
}
