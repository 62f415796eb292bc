//! Trailing metadata section

use crate::encoder::{ByteReader, ByteWriter, DecodeError};
use crate::header::Version;

/// Encoded metadata size in bytes
pub const METADATA_SIZE: u32 = 160;

const COMPILER_NAME_LEN: usize = 32;
const COMPILER_VERSION_LEN: usize = 16;
const BUILD_DATE_LEN: usize = 16;
const BUILD_FLAGS_LEN: usize = 32;

/// Build provenance and runtime profile of a module
///
/// Text fields are fixed-width on disk; longer values are truncated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtMetadata {
    /// Name of the producing compiler
    pub compiler_name: String,
    /// Version of the producing compiler
    pub compiler_version: String,
    /// Build date, `YYYY-MM-DD`
    pub build_date: String,
    /// Flags the module was built with
    pub build_flags: String,
    /// Minimum runtime version required to load the module
    pub required_runtime_version: Version,
    /// Wall time spent compiling, in milliseconds
    pub compilation_time_ms: u32,
    /// Number of libc functions the runtime provides
    pub libc_function_count: u32,
    /// Relative execution speed score (0 = unknown)
    pub execution_speed: u32,
    /// Startup time in microseconds
    pub startup_time_us: u32,
    /// Memory ceiling in bytes
    pub max_memory: u64,
    /// Stack ceiling in bytes
    pub max_stack_size: u64,
    /// Heap ceiling in bytes
    pub max_heap_size: u64,
    /// Number of ASTC instructions the code was generated from
    pub astc_instruction_count: u32,
}

impl RtMetadata {
    /// Metadata stamped with a compiler identity
    pub fn with_compiler(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            compiler_name: name.into(),
            compiler_version: version.into(),
            ..Self::default()
        }
    }

    /// Encode to exactly [`METADATA_SIZE`] bytes
    pub fn encode(&self, writer: &mut ByteWriter) {
        let start = writer.offset();
        writer.emit_fixed_str(&self.compiler_name, COMPILER_NAME_LEN);
        writer.emit_fixed_str(&self.compiler_version, COMPILER_VERSION_LEN);
        writer.emit_fixed_str(&self.build_date, BUILD_DATE_LEN);
        writer.emit_fixed_str(&self.build_flags, BUILD_FLAGS_LEN);
        writer.emit_u32(self.required_runtime_version.to_u32());
        writer.emit_u32(self.compilation_time_ms);
        writer.emit_u32(self.libc_function_count);
        writer.emit_u32(self.execution_speed);
        writer.emit_u32(self.startup_time_us);
        writer.emit_u64(self.max_memory);
        writer.emit_u64(self.max_stack_size);
        writer.emit_u64(self.max_heap_size);
        writer.emit_u32(self.astc_instruction_count);
        writer.pad_to(start + METADATA_SIZE as usize);
    }

    /// Decode from exactly [`METADATA_SIZE`] bytes
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let start = reader.position();
        let metadata = Self {
            compiler_name: reader.read_fixed_str(COMPILER_NAME_LEN)?,
            compiler_version: reader.read_fixed_str(COMPILER_VERSION_LEN)?,
            build_date: reader.read_fixed_str(BUILD_DATE_LEN)?,
            build_flags: reader.read_fixed_str(BUILD_FLAGS_LEN)?,
            required_runtime_version: Version::from_u32(reader.read_u32()?),
            compilation_time_ms: reader.read_u32()?,
            libc_function_count: reader.read_u32()?,
            execution_speed: reader.read_u32()?,
            startup_time_us: reader.read_u32()?,
            max_memory: reader.read_u64()?,
            max_stack_size: reader.read_u64()?,
            max_heap_size: reader.read_u64()?,
            astc_instruction_count: reader.read_u32()?,
        };
        let reserved = start + METADATA_SIZE as usize - reader.position();
        reader.read_slice(reserved)?;
        Ok(metadata)
    }
}

/// Format a unix timestamp as a UTC `YYYY-MM-DD` date
pub fn format_date(unix_seconds: u64) -> String {
    let days = (unix_seconds / 86_400) as i64;
    // civil-from-days, proleptic Gregorian calendar
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    format!("{:04}-{:02}-{:02}", year, month, day)
}
