//! `rtme select`: Rank the runtimes in a directory for a program.

use anyhow::Context;
use rtme_format::Target;
use rtme_runtime::{analyze_program, Capabilities, ProgramRequirements, RuntimeSelector, SelectionStrategy};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Program description assembled from the command line
#[derive(Debug, Clone, Default)]
pub struct SelectRequest {
    /// ASTC program to analyze
    pub program: Option<PathBuf>,
    /// Weighting preset
    pub strategy: SelectionStrategy,
    /// Overrides the analyzed memory requirement
    pub min_memory: Option<u64>,
    /// Footprint ceiling
    pub max_footprint: Option<u64>,
    /// Capabilities required on top of the analyzed ones
    pub needs: Capabilities,
    /// Restrict candidates to the running host
    pub host_only: bool,
    /// Emit JSON instead of a table
    pub json: bool,
}

impl SelectRequest {
    /// Requirements after applying command-line overrides
    pub fn requirements(&self) -> anyhow::Result<ProgramRequirements> {
        let mut req = match &self.program {
            Some(path) => analyze_program(path)
                .with_context(|| format!("cannot analyze {}", path.display()))?,
            None => ProgramRequirements::default(),
        };
        if let Some(min_memory) = self.min_memory {
            req.min_memory = min_memory;
        }
        if self.max_footprint.is_some() {
            req.max_memory_footprint = self.max_footprint;
        }
        req.needs.threading |= self.needs.threading;
        req.needs.floating_point |= self.needs.floating_point;
        req.needs.file_io |= self.needs.file_io;
        req.needs.graphics |= self.needs.graphics;
        Ok(req)
    }
}

/// Print the ranking; `Ok(false)` when no runtime qualifies
pub fn execute(dir: &Path, request: &SelectRequest, out: &mut impl Write) -> anyhow::Result<bool> {
    let mut selector = if request.host_only {
        let host = Target::host().context("unrecognized host target")?;
        RuntimeSelector::with_target(host)
    } else {
        RuntimeSelector::new()
    };
    let found = selector
        .scan_runtimes(dir)
        .with_context(|| format!("cannot scan {}", dir.display()))?;
    info!(dir = %dir.display(), found, strategy = %request.strategy, "scanned runtimes");

    let req = request.requirements()?;
    let ranked = selector.rank(&req, &request.strategy.criteria());

    if request.json {
        serde_json::to_writer_pretty(&mut *out, &ranked)?;
        writeln!(out)?;
        return Ok(!ranked.is_empty());
    }

    writeln!(
        out,
        "Strategy: {} ({} of {} runtimes eligible)",
        request.strategy,
        ranked.len(),
        selector.candidates().len()
    )?;
    if ranked.is_empty() {
        return Ok(false);
    }
    writeln!(
        out,
        "{:<4} {:<20} {:<24} {:>7} {:>7} {:>7} {:>7} {:>7}",
        "#", "runtime", "target", "speed", "size", "memory", "compat", "total"
    )?;
    for (rank, scored) in ranked.iter().enumerate() {
        writeln!(
            out,
            "{:<4} {:<20} {:<24} {:>7.1} {:>7.1} {:>7.1} {:>7.1} {:>7.1}",
            rank + 1,
            scored.info.name,
            scored.info.target.to_string(),
            scored.speed_score,
            scored.size_score,
            scored.memory_score,
            scored.compatibility_score,
            scored.total
        )?;
    }
    writeln!(out, "Selected: {}", ranked[0].info.filename.display())?;
    Ok(true)
}
