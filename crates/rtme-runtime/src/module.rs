//! Loaded runtime modules

use crate::dispatch::LibcTable;
use crate::error::{ExecError, LoaderError};
use crate::exec::CodeRegion;
use parking_lot::RwLock;
use rtme_codegen::abi::DispatchContext;
use rtme_format::{Architecture, RtHeader, RtImage, RtMetadata, Version};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Maximum number of exported symbols per module
pub const MAX_EXPORTS: usize = 64;

/// Kind of loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Runtime module read from an `.rt` file
    Runtime,
}

/// Lifecycle state of a module
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Resident in a loader table
    Loaded = 1,
    /// Removed from its loader table
    Unloaded = 2,
}

/// Exported symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Symbol name
    pub name: String,
    /// Offset into the module code
    pub offset: u32,
}

/// A module loaded from an RT file.
///
/// Modules are shared as `Arc<Module>`; the loader owns the reference
/// count and is the only place it changes.
pub struct Module {
    id: u32,
    name: String,
    path: PathBuf,
    kind: ModuleKind,
    state: AtomicU8,
    header: RtHeader,
    metadata: Option<RtMetadata>,
    module_data: Box<[u8]>,
    data: Box<[u8]>,
    reference_count: AtomicU32,
    load_time: SystemTime,
    exports: RwLock<Vec<Export>>,
    dependencies: RwLock<Vec<String>>,
    libc: Arc<LibcTable>,
}

impl Module {
    pub(crate) fn new(
        id: u32,
        name: String,
        path: PathBuf,
        image: RtImage,
        libc: Arc<LibcTable>,
    ) -> Self {
        Self {
            id,
            name,
            path,
            kind: ModuleKind::Runtime,
            state: AtomicU8::new(ModuleState::Loaded as u8),
            header: image.header,
            metadata: image.metadata,
            module_data: image.code.into_boxed_slice(),
            data: image.data.into_boxed_slice(),
            reference_count: AtomicU32::new(1),
            load_time: SystemTime::now(),
            exports: RwLock::new(Vec::new()),
            dependencies: RwLock::new(Vec::new()),
            libc,
        }
    }

    /// Loader-assigned id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File the module was read from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Module kind
    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Current lifecycle state
    pub fn state(&self) -> ModuleState {
        if self.state.load(Ordering::Acquire) == ModuleState::Loaded as u8 {
            ModuleState::Loaded
        } else {
            ModuleState::Unloaded
        }
    }

    /// Whether the module is still in its loader's table
    pub fn is_resident(&self) -> bool {
        self.state() == ModuleState::Loaded
    }

    /// RT format version of the file
    pub fn version(&self) -> Version {
        self.header.version
    }

    /// File header
    pub fn header(&self) -> &RtHeader {
        &self.header
    }

    /// File metadata, if present
    pub fn metadata(&self) -> Option<&RtMetadata> {
        self.metadata.as_ref()
    }

    /// Code section
    pub fn module_data(&self) -> &[u8] {
        &self.module_data
    }

    /// Code size in bytes
    pub fn module_size(&self) -> usize {
        self.module_data.len()
    }

    /// Data section
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Entry point offset into the code
    pub fn entry_offset(&self) -> u32 {
        self.header.entry_point
    }

    /// Address of the entry point within the module's code buffer
    pub fn entry_point(&self) -> *const u8 {
        self.module_data
            .as_ptr()
            .wrapping_add(self.header.entry_point as usize)
    }

    /// Number of outstanding loads
    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::Acquire)
    }

    /// When the module was first loaded
    pub fn load_time(&self) -> SystemTime {
        self.load_time
    }

    pub(crate) fn retain(&self) -> u32 {
        self.reference_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release(&self) -> u32 {
        self.reference_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn mark_unloaded(&self) {
        self.state
            .store(ModuleState::Unloaded as u8, Ordering::Release);
        self.exports.write().clear();
        self.dependencies.write().clear();
    }

    /// Export a symbol at a code offset
    pub fn add_export(&self, name: impl Into<String>, offset: u32) -> Result<(), LoaderError> {
        let name = name.into();
        if offset as usize > self.module_data.len() {
            return Err(LoaderError::ExportOutOfRange {
                name,
                offset,
                size: self.module_data.len(),
            });
        }
        let mut exports = self.exports.write();
        if let Some(existing) = exports.iter_mut().find(|e| e.name == name) {
            existing.offset = offset;
            return Ok(());
        }
        if exports.len() >= MAX_EXPORTS {
            return Err(LoaderError::TooManyExports {
                module: self.name.clone(),
                max: MAX_EXPORTS,
            });
        }
        exports.push(Export { name, offset });
        Ok(())
    }

    /// Address of an exported symbol
    pub fn find_symbol(&self, name: &str) -> Option<*const u8> {
        self.exports
            .read()
            .iter()
            .find(|e| e.name == name)
            .map(|e| self.module_data.as_ptr().wrapping_add(e.offset as usize))
    }

    /// Exported symbols
    pub fn exports(&self) -> Vec<Export> {
        self.exports.read().clone()
    }

    /// Record a module this one depends on
    pub fn add_dependency(&self, name: impl Into<String>) {
        let name = name.into();
        let mut dependencies = self.dependencies.write();
        if !dependencies.contains(&name) {
            dependencies.push(name);
        }
    }

    /// Recorded dependencies
    pub fn dependencies(&self) -> Vec<String> {
        self.dependencies.read().clone()
    }

    /// Libc table injected at load time
    pub fn libc(&self) -> &Arc<LibcTable> {
        &self.libc
    }

    /// Dispatch context for this module's code
    pub fn dispatch_context(&self) -> DispatchContext {
        self.libc.dispatch_context(self.header.arch)
    }

    /// Map the code executable and run it from the entry point.
    ///
    /// # Safety
    /// The module code must be generated code for the host; it runs with
    /// the privileges of the current process.
    pub unsafe fn execute(&self) -> Result<i64, ExecError> {
        let host = Architecture::host().ok_or(ExecError::Unsupported)?;
        if self.header.arch != host {
            return Err(ExecError::WrongArchitecture {
                module: self.header.arch,
                host,
            });
        }
        let region = CodeRegion::map(&self.module_data)?;
        let ctx = self.dispatch_context();
        Ok(region.call(self.header.entry_point, &ctx))
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("state", &self.state())
            .field("size", &self.module_data.len())
            .field("reference_count", &self.reference_count())
            .finish()
    }
}

/// Diagnostic view of a resident module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSummary {
    /// Module id
    pub id: u32,
    /// Module name
    pub name: String,
    /// Source file
    pub path: PathBuf,
    /// Code size in bytes
    pub size: usize,
    /// Outstanding loads
    pub reference_count: u32,
    /// RT format version
    pub version: Version,
}

impl From<&Module> for ModuleSummary {
    fn from(module: &Module) -> Self {
        Self {
            id: module.id,
            name: module.name.clone(),
            path: module.path.clone(),
            size: module.module_size(),
            reference_count: module.reference_count(),
            version: module.version(),
        }
    }
}
