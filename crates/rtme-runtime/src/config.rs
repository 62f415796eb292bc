//! Loader configuration
//!
//! ```toml
//! search_paths = ["modules", "/opt/rtme/lib"]
//! verbose = true
//!
//! [target]
//! arch = "x86_64"
//! os = "linux"
//! abi = "sysv"
//! ```

use crate::error::ConfigError;
use rtme_format::Target;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Search paths installed by `ModuleLoader::init`
pub const DEFAULT_SEARCH_PATHS: [&str; 4] = [".", "bin", "lib", "modules"];

/// Module loader settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directories searched in order
    pub search_paths: Vec<PathBuf>,
    /// Log lifecycle events at info level
    pub verbose: bool,
    /// Reject modules that cannot run on this target
    pub target: Option<Target>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: DEFAULT_SEARCH_PATHS.iter().map(PathBuf::from).collect(),
            verbose: false,
            target: None,
        }
    }
}

impl LoaderConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
