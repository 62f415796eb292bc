//! Dynamic runtime selection
//!
//! Candidates are filtered by hard requirements first, then the survivors
//! are scored on speed, size, memory and compatibility and combined with
//! the weights of a [`SelectionStrategy`].

use crate::error::SelectorError;
use rtme_format::{features, inspect, RtHeader, RtSummary, Target, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Memory ceiling assumed when a module carries no metadata
pub const DEFAULT_MAX_MEMORY: u64 = 100 * 1024 * 1024;
/// Stack ceiling assumed when a module carries no metadata
pub const DEFAULT_MAX_STACK: u64 = 8 * 1024 * 1024;
/// Heap ceiling assumed when a module carries no metadata
pub const DEFAULT_MAX_HEAP: u64 = 64 * 1024 * 1024;
/// Libc function count assumed when a module carries no metadata
pub const DEFAULT_MAX_LIBC_FUNCTIONS: u32 = 50;

/// Runtime capabilities a program may depend on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Thread-safe runtime
    pub threading: bool,
    /// Floating-point support
    pub floating_point: bool,
    /// File I/O
    pub file_io: bool,
    /// Graphics output
    pub graphics: bool,
}

impl Capabilities {
    /// Number of capability kinds
    pub const COUNT: u32 = 4;

    /// Capabilities advertised by RT feature flags
    pub fn from_features(flags: u32) -> Self {
        Self {
            threading: flags & features::THREAD_SAFE != 0,
            floating_point: flags & features::FLOATING_POINT != 0,
            file_io: flags & features::FILE_IO != 0,
            graphics: flags & features::GRAPHICS != 0,
        }
    }

    /// Whether every capability in `needed` is present
    pub fn contains(&self, needed: &Capabilities) -> bool {
        (self.threading || !needed.threading)
            && (self.floating_point || !needed.floating_point)
            && (self.file_io || !needed.file_io)
            && (self.graphics || !needed.graphics)
    }

    /// Number of capabilities present
    pub fn count(&self) -> u32 {
        [self.threading, self.floating_point, self.file_io, self.graphics]
            .iter()
            .filter(|&&b| b)
            .count() as u32
    }
}

/// A runtime candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Runtime name (file stem)
    pub name: String,
    /// RT format version
    pub version: Version,
    /// File the runtime was read from
    pub filename: PathBuf,
    /// Target the runtime was built for
    pub target: Target,
    /// Optimization level it was built with
    pub optimization_level: u32,
    /// Relative execution speed score
    pub execution_speed: u32,
    /// File size in bytes
    pub file_size: u64,
    /// Code, data, stack and heap the runtime needs at minimum
    pub memory_footprint: u64,
    /// Supported capabilities
    pub capabilities: Capabilities,
    /// Number of libc functions provided
    pub max_libc_functions: u32,
    /// Startup time in microseconds
    pub startup_time_us: u32,
    /// Memory ceiling
    pub max_memory: u64,
    /// Stack ceiling
    pub max_stack_size: u64,
    /// Heap ceiling
    pub max_heap_size: u64,
}

impl RuntimeInfo {
    /// Candidate with default ceilings and no capabilities
    pub fn new(name: impl Into<String>, target: Target) -> Self {
        let name = name.into();
        Self {
            filename: PathBuf::from(format!("{}.rt", name)),
            name,
            version: rtme_format::FORMAT_VERSION,
            target,
            optimization_level: 0,
            execution_speed: 0,
            file_size: 0,
            memory_footprint: 0,
            capabilities: Capabilities::default(),
            max_libc_functions: DEFAULT_MAX_LIBC_FUNCTIONS,
            startup_time_us: 0,
            max_memory: DEFAULT_MAX_MEMORY,
            max_stack_size: DEFAULT_MAX_STACK,
            max_heap_size: DEFAULT_MAX_HEAP,
        }
    }

    /// Derive a candidate from an RT file's header and metadata
    pub fn from_summary(path: &Path, summary: &RtSummary) -> Self {
        let header = &summary.header;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut info = Self::new(name, header.target());
        info.filename = path.to_path_buf();
        info.version = header.version;
        info.optimization_level = header.optimization_level;
        info.file_size = summary.file_size;
        info.memory_footprint = header.code_len() as u64
            + header.data_size as u64
            + header.min_stack_size as u64
            + header.min_heap_size as u64;
        info.capabilities = Capabilities::from_features(header.feature_flags);

        if let Some(meta) = &summary.metadata {
            info.execution_speed = meta.execution_speed;
            info.startup_time_us = meta.startup_time_us;
            if meta.libc_function_count > 0 {
                info.max_libc_functions = meta.libc_function_count;
            }
            if meta.max_memory > 0 {
                info.max_memory = meta.max_memory;
            }
            if meta.max_stack_size > 0 {
                info.max_stack_size = meta.max_stack_size;
            }
            if meta.max_heap_size > 0 {
                info.max_heap_size = meta.max_heap_size;
            }
        }
        if info.execution_speed == 0 {
            info.execution_speed = 40 + 20 * header.optimization_level;
        }
        info
    }
}

/// What the program prefers when several runtimes qualify
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationPreference {
    /// Smallest runtime
    Size,
    /// Fastest runtime
    Speed,
    /// No strong preference
    #[default]
    Balanced,
}

/// Resource and capability profile of a program
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRequirements {
    /// Memory the program needs
    pub min_memory: u64,
    /// Stack the program needs
    pub min_stack_size: u64,
    /// Heap the program needs
    pub min_heap_size: u64,
    /// Capabilities the program needs
    pub needs: Capabilities,
    /// Distinct libc functions the program calls
    pub libc_functions_used: u32,
    /// Preferred trade-off
    pub optimization_preference: OptimizationPreference,
    /// Largest acceptable runtime footprint
    pub max_memory_footprint: Option<u64>,
}

/// Weights for the four sub-scores, in percent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionCriteria {
    /// Execution speed weight
    pub speed: u32,
    /// File size weight
    pub size: u32,
    /// Memory footprint weight
    pub memory: u32,
    /// Compatibility headroom weight
    pub compatibility: u32,
}

impl SelectionCriteria {
    fn total(&self) -> u32 {
        self.speed + self.size + self.memory + self.compatibility
    }
}

/// Named weight presets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Prefer execution speed
    Fastest,
    /// Prefer small files
    Smallest,
    /// Equal weights
    #[default]
    Balanced,
    /// Prefer small memory footprint
    MemoryEfficient,
    /// Prefer capability and libc headroom
    Compatibility,
}

impl SelectionStrategy {
    /// Every strategy
    pub const ALL: [SelectionStrategy; 5] = [
        SelectionStrategy::Fastest,
        SelectionStrategy::Smallest,
        SelectionStrategy::Balanced,
        SelectionStrategy::MemoryEfficient,
        SelectionStrategy::Compatibility,
    ];

    /// Weight quadruple for the strategy
    pub fn criteria(self) -> SelectionCriteria {
        let (speed, size, memory, compatibility) = match self {
            SelectionStrategy::Fastest => (70, 10, 10, 10),
            SelectionStrategy::Smallest => (10, 70, 10, 10),
            SelectionStrategy::Balanced => (25, 25, 25, 25),
            SelectionStrategy::MemoryEfficient => (10, 20, 60, 10),
            SelectionStrategy::Compatibility => (10, 10, 10, 70),
        };
        SelectionCriteria {
            speed,
            size,
            memory,
            compatibility,
        }
    }

    /// Strategy matching a program's preference
    pub fn from_preference(preference: OptimizationPreference) -> Self {
        match preference {
            OptimizationPreference::Size => SelectionStrategy::Smallest,
            OptimizationPreference::Speed => SelectionStrategy::Fastest,
            OptimizationPreference::Balanced => SelectionStrategy::Balanced,
        }
    }

    /// CLI name
    pub fn name(self) -> &'static str {
        match self {
            SelectionStrategy::Fastest => "fastest",
            SelectionStrategy::Smallest => "smallest",
            SelectionStrategy::Balanced => "balanced",
            SelectionStrategy::MemoryEfficient => "memory",
            SelectionStrategy::Compatibility => "compatibility",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fastest" | "speed" => Ok(SelectionStrategy::Fastest),
            "smallest" | "size" => Ok(SelectionStrategy::Smallest),
            "balanced" => Ok(SelectionStrategy::Balanced),
            "memory" | "memory_efficient" => Ok(SelectionStrategy::MemoryEfficient),
            "compatibility" | "compat" => Ok(SelectionStrategy::Compatibility),
            _ => Err(format!("Unknown strategy '{}'", s)),
        }
    }
}

/// A candidate with its scores
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRuntime {
    /// The candidate
    pub info: RuntimeInfo,
    /// Speed sub-score (0-100)
    pub speed_score: f64,
    /// Size sub-score (0-100)
    pub size_score: f64,
    /// Memory sub-score (0-100)
    pub memory_score: f64,
    /// Compatibility sub-score (0-100)
    pub compatibility_score: f64,
    /// Weighted total (0-100)
    pub total: f64,
}

/// Registry of runtime candidates
#[derive(Debug, Clone, Default)]
pub struct RuntimeSelector {
    candidates: Vec<RuntimeInfo>,
    target: Option<Target>,
}

impl RuntimeSelector {
    /// Selector accepting candidates for any target
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector accepting only candidates that run on `target`
    pub fn with_target(target: Target) -> Self {
        Self {
            candidates: Vec::new(),
            target: Some(target),
        }
    }

    /// Replace the candidates with the `.rt` files in `dir`.
    ///
    /// Files are visited in name order; unreadable or invalid files are
    /// skipped. Returns the number of candidates found.
    pub fn scan_runtimes(&mut self, dir: &Path) -> Result<usize, SelectorError> {
        let io_err = |source| SelectorError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "rt") {
                paths.push(path);
            }
        }
        paths.sort();

        self.candidates.clear();
        for path in paths {
            match inspect(&path) {
                Ok(summary) => {
                    let info = RuntimeInfo::from_summary(&path, &summary);
                    debug!(
                        name = %info.name,
                        target = %info.target,
                        speed = info.execution_speed,
                        size = info.file_size,
                        "found runtime"
                    );
                    self.candidates.push(info);
                }
                Err(err) => warn!(path = %path.display(), %err, "skipping runtime"),
            }
        }
        Ok(self.candidates.len())
    }

    /// Add a candidate after those already known
    pub fn register(&mut self, info: RuntimeInfo) {
        self.candidates.push(info);
    }

    /// Known candidates in scan order
    pub fn candidates(&self) -> &[RuntimeInfo] {
        &self.candidates
    }

    /// Whether a candidate passes every hard requirement
    pub fn is_eligible(&self, info: &RuntimeInfo, req: &ProgramRequirements) -> bool {
        if let Some(target) = &self.target {
            if !RtHeader::new(info.target).check_compatibility(target.arch, target.os) {
                return false;
            }
        }
        info.max_memory >= req.min_memory
            && info.max_stack_size >= req.min_stack_size
            && info.max_heap_size >= req.min_heap_size
            && req
                .max_memory_footprint
                .map_or(true, |budget| info.memory_footprint <= budget)
            && info.capabilities.contains(&req.needs)
            && req.libc_functions_used <= info.max_libc_functions
    }

    /// Eligible candidates, best first.
    ///
    /// The sort is stable, so equal totals keep scan order.
    pub fn rank(&self, req: &ProgramRequirements, criteria: &SelectionCriteria) -> Vec<ScoredRuntime> {
        let eligible: Vec<&RuntimeInfo> = self
            .candidates
            .iter()
            .filter(|info| {
                let ok = self.is_eligible(info, req);
                if !ok {
                    debug!(name = %info.name, "runtime filtered out");
                }
                ok
            })
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }

        let max_speed = eligible.iter().map(|i| i.execution_speed).max().unwrap_or(0);
        let min_size = eligible.iter().map(|i| i.file_size).min().unwrap_or(0);
        let min_footprint = eligible.iter().map(|i| i.memory_footprint).min().unwrap_or(0);
        let total_weight = criteria.total().max(1) as f64;

        let mut scored: Vec<ScoredRuntime> = eligible
            .into_iter()
            .map(|info| {
                let speed_score = ratio(info.execution_speed as u64, max_speed as u64);
                let size_score = inverse_ratio(min_size, info.file_size);
                let memory_score = inverse_ratio(min_footprint, info.memory_footprint);
                let compatibility_score = compatibility_score(info, req);
                let total = (criteria.speed as f64 * speed_score
                    + criteria.size as f64 * size_score
                    + criteria.memory as f64 * memory_score
                    + criteria.compatibility as f64 * compatibility_score)
                    / total_weight;
                ScoredRuntime {
                    info: info.clone(),
                    speed_score,
                    size_score,
                    memory_score,
                    compatibility_score,
                    total,
                }
            })
            .collect();

        scored.sort_by(|a, b| b.total.total_cmp(&a.total));
        scored
    }

    /// Best eligible candidate, or `None` when nothing qualifies
    pub fn select_best(
        &self,
        req: &ProgramRequirements,
        criteria: &SelectionCriteria,
    ) -> Option<RuntimeInfo> {
        let best = self.rank(req, criteria).into_iter().next();
        match &best {
            Some(scored) => debug!(name = %scored.info.name, total = scored.total, "selected runtime"),
            None => debug!(candidates = self.candidates.len(), "no suitable runtime"),
        }
        best.map(|scored| scored.info)
    }
}

/// `100 * value / max`, 0 when `max` is 0
fn ratio(value: u64, max: u64) -> f64 {
    if max == 0 {
        0.0
    } else {
        100.0 * value as f64 / max as f64
    }
}

/// `100 * min / value`, 100 when `value` is 0
fn inverse_ratio(min: u64, value: u64) -> f64 {
    if value == 0 {
        100.0
    } else {
        100.0 * min as f64 / value as f64
    }
}

fn compatibility_score(info: &RuntimeInfo, req: &ProgramRequirements) -> f64 {
    let spare_capabilities = info.capabilities.count().saturating_sub(req.needs.count());
    let capability_part = 50.0 * spare_capabilities as f64 / Capabilities::COUNT as f64;
    let libc_part = if info.max_libc_functions == 0 {
        0.0
    } else {
        let spare = info.max_libc_functions.saturating_sub(req.libc_functions_used);
        50.0 * spare as f64 / info.max_libc_functions as f64
    };
    capability_part + libc_part
}
