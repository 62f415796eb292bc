//! `rtme load`: Load modules through the loader and optionally run them.

use anyhow::Context;
use rtme_runtime::{LoaderConfig, ModuleLoader};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Load `modules` in order, report the loader state, then unload everything.
///
/// A name ending in `.rt` or naming an existing file is loaded directly;
/// anything else goes through the search paths.
pub fn execute(
    config: Option<&Path>,
    search_paths: &[PathBuf],
    modules: &[String],
    run: bool,
    verbose: bool,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => LoaderConfig::load(path)
            .with_context(|| format!("cannot read loader config {}", path.display()))?,
        None => LoaderConfig::default(),
    };
    config.verbose |= verbose;
    let loader = ModuleLoader::with_config(config)?;
    for path in search_paths {
        loader.add_search_path(path)?;
    }

    let mut loaded = Vec::with_capacity(modules.len());
    for name in modules {
        let path = Path::new(name);
        let module = if name.ends_with(".rt") || path.is_file() {
            loader.load_rt(path)
        } else {
            loader.load(name)
        }
        .with_context(|| format!("cannot load '{}'", name))?;
        writeln!(
            out,
            "loaded {} (id {}, {} bytes, refs {}) from {}",
            module.name(),
            module.id(),
            module.module_size(),
            module.reference_count(),
            module.path().display()
        )?;
        loaded.push(module);
    }

    if run {
        for module in &loaded {
            // SAFETY: the user asked to run these modules; execute() refuses
            // code built for another architecture.
            let result = unsafe { module.execute() }
                .with_context(|| format!("cannot execute '{}'", module.name()))?;
            writeln!(out, "{} returned {}", module.name(), result)?;
        }
    }

    for summary in loader.list_loaded() {
        writeln!(
            out,
            "  [{}] {} v{} refs={} {}",
            summary.id,
            summary.name,
            summary.version,
            summary.reference_count,
            summary.path.display()
        )?;
    }
    let stats = loader.statistics();
    writeln!(
        out,
        "{} modules resident, {} code bytes, {} references",
        stats.module_count, stats.total_code_bytes, stats.total_references
    )?;
    loader.unload_all();
    Ok(())
}
