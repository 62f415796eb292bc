//! RT file header

use crate::encoder::{ByteReader, ByteWriter, DecodeError};
use crate::target::{Abi, Architecture, OperatingSystem, Target};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic number for RT module files: "RTME"
pub const MAGIC: [u8; 4] = *b"RTME";

/// Format version written by this crate
pub const FORMAT_VERSION: Version = Version::new(1, 0, 0);

/// Encoded header size in bytes
pub const HEADER_SIZE: u32 = 64;

/// Header flags (one byte)
pub mod flags {
    /// Code section is DEFLATE-compressed
    pub const COMPRESSED: u8 = 1 << 0;
    /// Module payload is encrypted
    pub const ENCRYPTED: u8 = 1 << 1;
    /// Module carries debug information
    pub const DEBUG_INFO: u8 = 1 << 2;
    /// Code was built with optimizations
    pub const OPTIMIZED: u8 = 1 << 3;
    /// Code is relocatable
    pub const RELOCATABLE: u8 = 1 << 4;
    /// Module may be shared between processes
    pub const SHARED: u8 = 1 << 5;
    /// Module has an executable entry point
    pub const EXECUTABLE: u8 = 1 << 6;
    /// Code is position independent
    pub const PIC: u8 = 1 << 7;
}

/// Runtime feature bits
pub mod features {
    /// Calls into libc are forwarded through the dispatch table
    pub const LIBC_FORWARDING: u32 = 1 << 0;
    /// Module may load other modules
    pub const DYNAMIC_LINKING: u32 = 1 << 1;
    /// Safe to call from multiple threads
    pub const THREAD_SAFE: u32 = 1 << 2;
    /// Supports floating point workloads
    pub const FLOATING_POINT: u32 = 1 << 3;
    /// Supports file I/O
    pub const FILE_IO: u32 = 1 << 4;
    /// Supports graphics output
    pub const GRAPHICS: u32 = 1 << 5;
    /// Built with profiling hooks
    pub const PROFILING: u32 = 1 << 6;
}

/// Semantic version triple
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Patch version
    pub patch: u8,
}

impl Version {
    /// Create a version triple
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether a reader at [`FORMAT_VERSION`] understands this version
    pub fn is_supported(self) -> bool {
        self.major == FORMAT_VERSION.major && self.minor <= FORMAT_VERSION.minor
    }

    /// Pack as `0x00MMmmpp`
    pub fn to_u32(self) -> u32 {
        (self.major as u32) << 16 | (self.minor as u32) << 8 | self.patch as u32
    }

    /// Unpack from `0x00MMmmpp`
    pub fn from_u32(value: u32) -> Self {
        Self::new((value >> 16) as u8, (value >> 8) as u8, value as u8)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Header validation failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeaderError {
    /// Magic number mismatch
    #[error("Invalid magic number: expected RTME, got {0:?}")]
    BadMagic([u8; 4]),

    /// Version outside the supported range
    #[error("Unsupported format version {0} (reader supports {})", FORMAT_VERSION)]
    UnsupportedVersion(Version),

    /// Declared header size differs from the fixed layout
    #[error("Invalid header size {0} (expected {})", HEADER_SIZE)]
    BadHeaderSize(u32),

    /// Metadata size is neither zero nor the fixed metadata size
    #[error("Invalid metadata size {0}")]
    BadMetadataSize(u32),

    /// Entry point lies outside the code section
    #[error("Entry point {entry_point:#x} outside code section of {code_size} bytes")]
    EntryPointOutOfRange {
        /// Declared entry point
        entry_point: u32,
        /// Declared (uncompressed) code size
        code_size: u32,
    },

    /// Declared sections exceed the physical file size
    #[error("Declared size {declared} exceeds file size {actual}")]
    Truncated {
        /// Sum of header, code, data and metadata sizes
        declared: u64,
        /// Physical size
        actual: u64,
    },
}

/// Target mismatch between a module and the host it would run on
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompatibilityError {
    /// Architecture mismatch
    #[error("Architecture mismatch: module targets {module}, host is {host}")]
    Architecture {
        /// Module architecture
        module: Architecture,
        /// Requested architecture
        host: Architecture,
    },

    /// Operating system mismatch
    #[error("OS mismatch: module targets {module}, host is {host}")]
    OperatingSystem {
        /// Module operating system
        module: OperatingSystem,
        /// Requested operating system
        host: OperatingSystem,
    },

    /// ABI mismatch
    #[error("ABI mismatch: module uses {module}, host uses {host}")]
    Abi {
        /// Module ABI
        module: Abi,
        /// Requested ABI
        host: Abi,
    },
}

/// Fixed-size RT file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtHeader {
    /// Magic number (must be "RTME")
    pub magic: [u8; 4],
    /// Format version
    pub version: Version,
    /// Header flags, see [`flags`]
    pub flags: u8,
    /// Target architecture
    pub arch: Architecture,
    /// Target operating system
    pub os: OperatingSystem,
    /// Target ABI
    pub abi: Abi,
    /// Encoded header size
    pub header_size: u32,
    /// Stored code size (compressed size when [`flags::COMPRESSED`] is set)
    pub code_size: u32,
    /// Data section size
    pub data_size: u32,
    /// Metadata section size (0 or [`crate::METADATA_SIZE`])
    pub metadata_size: u32,
    /// Entry point offset into the uncompressed code
    pub entry_point: u32,
    /// Build timestamp, seconds since the unix epoch
    pub timestamp: u64,
    /// Optimization level (0-3)
    pub optimization_level: u32,
    /// Runtime feature bits, see [`features`]
    pub feature_flags: u32,
    /// Minimum stack size in bytes
    pub min_stack_size: u32,
    /// Minimum heap size in bytes
    pub min_heap_size: u32,
    /// CRC32 over the stored code, data and metadata
    pub checksum: u32,
    /// Code size after decompression
    pub uncompressed_code_size: u32,
}

impl RtHeader {
    /// Create a header for `target` with all sizes zeroed
    pub fn new(target: Target) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            flags: 0,
            arch: target.arch,
            os: target.os,
            abi: target.abi,
            header_size: HEADER_SIZE,
            code_size: 0,
            data_size: 0,
            metadata_size: 0,
            entry_point: 0,
            timestamp: 0,
            optimization_level: 0,
            feature_flags: 0,
            min_stack_size: 0,
            min_heap_size: 0,
            checksum: 0,
            uncompressed_code_size: 0,
        }
    }

    /// The header's target triple
    pub fn target(&self) -> Target {
        Target {
            arch: self.arch,
            os: self.os,
            abi: self.abi,
        }
    }

    /// Check a header flag
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Check a feature bit
    pub fn has_feature(&self, feature: u32) -> bool {
        self.feature_flags & feature != 0
    }

    /// Whether the code section is compressed
    pub fn is_compressed(&self) -> bool {
        self.has_flag(flags::COMPRESSED)
    }

    /// Whether the module carries debug information
    pub fn has_debug_info(&self) -> bool {
        self.has_flag(flags::DEBUG_INFO)
    }

    /// Size of the code once decompressed
    pub fn code_len(&self) -> u32 {
        if self.is_compressed() {
            self.uncompressed_code_size
        } else {
            self.code_size
        }
    }

    /// Total bytes the header declares for the whole file
    pub fn declared_file_size(&self) -> u64 {
        self.header_size as u64
            + self.code_size as u64
            + self.data_size as u64
            + self.metadata_size as u64
    }

    /// Validate the header on its own
    pub fn check(&self) -> Result<(), HeaderError> {
        if self.magic != MAGIC {
            return Err(HeaderError::BadMagic(self.magic));
        }
        if !self.version.is_supported() {
            return Err(HeaderError::UnsupportedVersion(self.version));
        }
        if self.header_size != HEADER_SIZE {
            return Err(HeaderError::BadHeaderSize(self.header_size));
        }
        if self.metadata_size != 0 && self.metadata_size != crate::METADATA_SIZE {
            return Err(HeaderError::BadMetadataSize(self.metadata_size));
        }
        let code_len = self.code_len();
        if code_len > 0 && self.entry_point > code_len {
            return Err(HeaderError::EntryPointOutOfRange {
                entry_point: self.entry_point,
                code_size: code_len,
            });
        }
        Ok(())
    }

    /// Validate the header against the physical file size
    pub fn check_against_len(&self, file_len: u64) -> Result<(), HeaderError> {
        self.check()?;
        let declared = self.declared_file_size();
        if declared > file_len {
            return Err(HeaderError::Truncated {
                declared,
                actual: file_len,
            });
        }
        Ok(())
    }

    /// Whether [`RtHeader::check`] accepts this header
    pub fn validate(&self) -> bool {
        self.check().is_ok()
    }

    /// Whether the module can run on `arch`/`os`.
    ///
    /// An x86_32 module is accepted on an x86_64 host.
    pub fn check_compatibility(&self, arch: Architecture, os: OperatingSystem) -> bool {
        self.compatibility(arch, os).is_ok()
    }

    fn compatibility(&self, arch: Architecture, os: OperatingSystem) -> Result<(), CompatibilityError> {
        let arch_ok = self.arch == arch
            || (self.arch == Architecture::X86_32 && arch == Architecture::X86_64);
        if !arch_ok {
            return Err(CompatibilityError::Architecture {
                module: self.arch,
                host: arch,
            });
        }
        if self.os != os {
            return Err(CompatibilityError::OperatingSystem {
                module: self.os,
                host: os,
            });
        }
        Ok(())
    }

    /// Full target check including the ABI
    pub fn check_target(&self, target: &Target) -> Result<(), CompatibilityError> {
        self.compatibility(target.arch, target.os)?;
        if self.abi != target.abi && self.arch == target.arch {
            return Err(CompatibilityError::Abi {
                module: self.abi,
                host: target.abi,
            });
        }
        Ok(())
    }

    /// Encode to exactly [`HEADER_SIZE`] bytes
    pub fn encode(&self, writer: &mut ByteWriter) {
        let start = writer.offset();
        writer.emit_bytes(&self.magic);
        writer.emit_u8(self.version.major);
        writer.emit_u8(self.version.minor);
        writer.emit_u8(self.version.patch);
        writer.emit_u8(self.flags);
        writer.emit_u8(self.arch.to_u8());
        writer.emit_u8(self.os.to_u8());
        writer.emit_u8(self.abi.to_u8());
        writer.emit_u8(0); // little-endian
        writer.emit_u32(self.header_size);
        writer.emit_u32(self.code_size);
        writer.emit_u32(self.data_size);
        writer.emit_u32(self.metadata_size);
        writer.emit_u32(self.entry_point);
        writer.emit_u64(self.timestamp);
        writer.emit_u32(self.optimization_level);
        writer.emit_u32(self.feature_flags);
        writer.emit_u32(self.min_stack_size);
        writer.emit_u32(self.min_heap_size);
        writer.emit_u32(self.checksum);
        writer.emit_u32(self.uncompressed_code_size);
        debug_assert_eq!(writer.offset() - start, HEADER_SIZE as usize);
    }

    /// Byte offset of the checksum field within the encoded header
    pub const CHECKSUM_OFFSET: usize = 56;

    /// Decode a header.
    ///
    /// Only the layout is decoded here; magic and version are checked by
    /// [`RtHeader::check`] so callers can report them distinctly.
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let magic = reader.read_array::<4>()?;
        let version = Version::new(reader.read_u8()?, reader.read_u8()?, reader.read_u8()?);
        let flags = reader.read_u8()?;

        let offset = reader.position();
        let raw_arch = reader.read_u8()?;
        let arch = Architecture::from_u8(raw_arch).ok_or(DecodeError::InvalidValue {
            field: "architecture",
            value: raw_arch as u32,
            offset,
        })?;
        let raw_os = reader.read_u8()?;
        let os = OperatingSystem::from_u8(raw_os).ok_or(DecodeError::InvalidValue {
            field: "os",
            value: raw_os as u32,
            offset: offset + 1,
        })?;
        let raw_abi = reader.read_u8()?;
        let abi = Abi::from_u8(raw_abi).ok_or(DecodeError::InvalidValue {
            field: "abi",
            value: raw_abi as u32,
            offset: offset + 2,
        })?;
        let endianness = reader.read_u8()?;
        if endianness != 0 {
            return Err(DecodeError::InvalidValue {
                field: "endianness",
                value: endianness as u32,
                offset: offset + 3,
            });
        }

        Ok(Self {
            magic,
            version,
            flags,
            arch,
            os,
            abi,
            header_size: reader.read_u32()?,
            code_size: reader.read_u32()?,
            data_size: reader.read_u32()?,
            metadata_size: reader.read_u32()?,
            entry_point: reader.read_u32()?,
            timestamp: reader.read_u64()?,
            optimization_level: reader.read_u32()?,
            feature_flags: reader.read_u32()?,
            min_stack_size: reader.read_u32()?,
            min_heap_size: reader.read_u32()?,
            checksum: reader.read_u32()?,
            uncompressed_code_size: reader.read_u32()?,
        })
    }
}
