//! Module loader
//!
//! [`ModuleLoader`] is a context object: it owns the resident-module table
//! and the search paths, and every operation goes through it. A single
//! mutex serializes table mutations, so a loader can be shared between
//! threads.

use crate::config::{LoaderConfig, DEFAULT_SEARCH_PATHS};
use crate::dispatch::LibcTable;
use crate::error::LoaderError;
use crate::module::{Module, ModuleSummary};
use parking_lot::Mutex;
use rtme_format::{FormatError, Target};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Maximum number of search paths
pub const MAX_SEARCH_PATHS: usize = 16;

/// Module file extensions, in lookup order
pub const MODULE_EXTENSIONS: [&str; 4] = [".rt", ".native", ".so", ".dll"];

/// Log at info when verbose, debug otherwise.
macro_rules! lifecycle {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Aggregate numbers over the resident table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Resident modules
    pub module_count: usize,
    /// Code bytes held by resident modules
    pub total_code_bytes: usize,
    /// Sum of reference counts
    pub total_references: u64,
}

#[derive(Debug, Default)]
struct LoaderState {
    modules: Vec<Arc<Module>>,
    search_paths: Vec<PathBuf>,
    verbose: bool,
    next_id: u32,
    initialized: bool,
}

impl LoaderState {
    fn find(&self, name: &str) -> Option<&Arc<Module>> {
        self.modules.iter().find(|m| m.name() == name)
    }

    fn find_module_file(&self, name: &str) -> Option<PathBuf> {
        self.search_paths.iter().find_map(|dir| {
            MODULE_EXTENSIONS.iter().find_map(|ext| {
                let candidate = dir.join(format!("{}{}", name, ext));
                candidate.is_file().then_some(candidate)
            })
        })
    }
}

/// Loads RT modules and tracks which are resident
#[derive(Debug)]
pub struct ModuleLoader {
    state: Mutex<LoaderState>,
    libc: Arc<LibcTable>,
    target: Option<Target>,
}

impl ModuleLoader {
    /// Uninitialized loader with the host libc table and no search paths
    pub fn new() -> Self {
        Self::with_libc(LibcTable::host())
    }

    /// Uninitialized loader injecting `libc` into every module it loads
    pub fn with_libc(libc: LibcTable) -> Self {
        Self {
            state: Mutex::new(LoaderState {
                next_id: 1,
                ..LoaderState::default()
            }),
            libc: Arc::new(libc),
            target: None,
        }
    }

    /// Initialized loader built from a config.
    ///
    /// Fails with `TooManySearchPaths` past [`MAX_SEARCH_PATHS`], like
    /// [`ModuleLoader::add_search_path`].
    pub fn with_config(config: LoaderConfig) -> Result<Self, LoaderError> {
        if config.search_paths.len() > MAX_SEARCH_PATHS {
            return Err(LoaderError::TooManySearchPaths {
                max: MAX_SEARCH_PATHS,
            });
        }
        let mut loader = Self::new();
        loader.target = config.target;
        {
            let state = loader.state.get_mut();
            state.search_paths = config.search_paths;
            state.verbose = config.verbose;
            state.initialized = true;
        }
        Ok(loader)
    }

    /// Reject modules that cannot run on `target`
    pub fn set_target(&mut self, target: Option<Target>) {
        self.target = target;
    }

    /// Install the default search paths on first use.
    ///
    /// Later calls only update verbosity and return `false`.
    pub fn init(&self, verbose: bool) -> bool {
        let mut state = self.state.lock();
        state.verbose = verbose;
        if state.initialized {
            return false;
        }
        state.initialized = true;
        state.search_paths = DEFAULT_SEARCH_PATHS.iter().map(PathBuf::from).collect();
        lifecycle!(verbose, paths = ?state.search_paths, "module loader initialized");
        true
    }

    /// Whether `init` (or `with_config`) has run
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Append a search path
    pub fn add_search_path(&self, path: impl Into<PathBuf>) -> Result<(), LoaderError> {
        let mut state = self.state.lock();
        if state.search_paths.len() >= MAX_SEARCH_PATHS {
            return Err(LoaderError::TooManySearchPaths {
                max: MAX_SEARCH_PATHS,
            });
        }
        let path = path.into();
        lifecycle!(state.verbose, path = %path.display(), "added search path");
        state.search_paths.push(path);
        Ok(())
    }

    /// Current search paths, in lookup order
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.state.lock().search_paths.clone()
    }

    /// First existing file for `name` (search path outer, extension inner)
    pub fn find_module_file(&self, name: &str) -> Option<PathBuf> {
        self.state.lock().find_module_file(name)
    }

    /// Load a module by name.
    ///
    /// A resident module with the same name gets its reference count
    /// raised and is returned as is.
    pub fn load(&self, name: &str) -> Result<Arc<Module>, LoaderError> {
        let mut state = self.state.lock();
        if let Some(module) = state.find(name) {
            let count = module.retain();
            lifecycle!(state.verbose, name, id = module.id(), count, "module already resident");
            return Ok(Arc::clone(module));
        }

        let Some(path) = state.find_module_file(name) else {
            lifecycle!(state.verbose, name, "module not found");
            return Err(LoaderError::NotFound {
                name: name.to_string(),
            });
        };
        self.load_file(&mut state, name.to_string(), path)
    }

    /// Load an RT file directly, naming the module after the file stem
    pub fn load_rt(&self, path: &Path) -> Result<Arc<Module>, LoaderError> {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut state = self.state.lock();
        self.load_file(&mut state, name, path.to_path_buf())
    }

    fn load_file(
        &self,
        state: &mut LoaderState,
        name: String,
        path: PathBuf,
    ) -> Result<Arc<Module>, LoaderError> {
        let image = rtme_format::read(&path).map_err(|source| match source {
            FormatError::NotFound { .. } => LoaderError::NotFound { name: name.clone() },
            source => LoaderError::InvalidFormat {
                path: path.clone(),
                source,
            },
        })?;

        if let Some(target) = &self.target {
            image
                .header
                .check_target(target)
                .map_err(|err| LoaderError::InvalidFormat {
                    path: path.clone(),
                    source: err.into(),
                })?;
        }

        let id = state.next_id;
        state.next_id += 1;
        let module = Arc::new(Module::new(id, name, path, image, Arc::clone(&self.libc)));
        lifecycle!(
            state.verbose,
            name = module.name(),
            id,
            path = %module.path().display(),
            size = module.module_size(),
            "module loaded"
        );
        state.modules.push(Arc::clone(&module));
        Ok(module)
    }

    /// Drop one reference, returning the remaining count.
    ///
    /// At zero the module is removed from the table in the same call.
    pub fn unload(&self, module: &Arc<Module>) -> Result<u32, LoaderError> {
        let mut state = self.state.lock();
        let Some(index) = state.modules.iter().position(|m| Arc::ptr_eq(m, module)) else {
            return Err(LoaderError::NotResident {
                name: module.name().to_string(),
                id: module.id(),
            });
        };

        let remaining = module.release();
        if remaining == 0 {
            let removed = state.modules.remove(index);
            removed.mark_unloaded();
            lifecycle!(state.verbose, name = removed.name(), id = removed.id(), "module unloaded");
        } else {
            lifecycle!(state.verbose, name = module.name(), remaining, "module released");
        }
        Ok(remaining)
    }

    /// Remove every resident module regardless of reference count
    pub fn unload_all(&self) -> usize {
        let mut state = self.state.lock();
        let modules = std::mem::take(&mut state.modules);
        for module in &modules {
            module.mark_unloaded();
        }
        lifecycle!(state.verbose, count = modules.len(), "all modules unloaded");
        modules.len()
    }

    /// Resident module with exactly this name
    pub fn find(&self, name: &str) -> Option<Arc<Module>> {
        self.state.lock().find(name).cloned()
    }

    /// Resident modules, in load order
    pub fn list_loaded(&self) -> Vec<ModuleSummary> {
        self.state
            .lock()
            .modules
            .iter()
            .map(|m| ModuleSummary::from(m.as_ref()))
            .collect()
    }

    /// Number of resident modules
    pub fn module_count(&self) -> usize {
        self.state.lock().modules.len()
    }

    /// Totals over the resident table
    pub fn statistics(&self) -> LoaderStats {
        let state = self.state.lock();
        LoaderStats {
            module_count: state.modules.len(),
            total_code_bytes: state.modules.iter().map(|m| m.module_size()).sum(),
            total_references: state
                .modules
                .iter()
                .map(|m| m.reference_count() as u64)
                .sum(),
        }
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}
