//! RT file reading and writing
//!
//! Layout: `[header][code][data][metadata]`. The header records the size of
//! every section, and a CRC32 over everything after the header guards the
//! payload.

use crate::encoder::{ByteReader, ByteWriter, DecodeError};
use crate::header::{CompatibilityError, HeaderError, RtHeader, Version, HEADER_SIZE, MAGIC};
use crate::metadata::{format_date, RtMetadata, METADATA_SIZE};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, trace};

/// RT file errors
#[derive(Debug, Error)]
pub enum FormatError {
    /// File does not exist
    #[error("File not found: {}", path.display())]
    NotFound {
        /// Missing path
        path: PathBuf,
    },

    /// Other I/O failure
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Fewer bytes present than the header declares
    #[error("Truncated file: expected {expected} bytes, found {actual}")]
    Truncated {
        /// Declared size
        expected: u64,
        /// Physical size
        actual: u64,
    },

    /// Magic number mismatch
    #[error("Invalid magic number: expected RTME, got {0:?}")]
    BadMagic([u8; 4]),

    /// Unsupported format version
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(Version),

    /// Structurally invalid header
    #[error("Invalid header: {0}")]
    InvalidHeader(HeaderError),

    /// Malformed section contents
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Payload checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum stored in the header
        expected: u32,
        /// Checksum of the bytes on disk
        actual: u32,
    },

    /// Compressed code section could not be inflated
    #[error("Corrupt compressed code section: {0}")]
    Compression(#[source] io::Error),

    /// Module does not match the requested target
    #[error(transparent)]
    Incompatible(#[from] CompatibilityError),
}

impl From<HeaderError> for FormatError {
    fn from(err: HeaderError) -> Self {
        match err {
            HeaderError::BadMagic(magic) => FormatError::BadMagic(magic),
            HeaderError::UnsupportedVersion(version) => FormatError::UnsupportedVersion(version),
            HeaderError::Truncated { declared, actual } => FormatError::Truncated {
                expected: declared,
                actual,
            },
            other => FormatError::InvalidHeader(other),
        }
    }
}

impl FormatError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            FormatError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            FormatError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// A decoded RT module image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtImage {
    /// File header
    pub header: RtHeader,
    /// Machine code (always uncompressed in memory)
    pub code: Vec<u8>,
    /// Initialized data
    pub data: Vec<u8>,
    /// Optional trailing metadata
    pub metadata: Option<RtMetadata>,
}

impl RtImage {
    /// Create an image; section sizes are filled in on encode
    pub fn new(header: RtHeader, code: Vec<u8>, data: Vec<u8>, metadata: Option<RtMetadata>) -> Self {
        Self {
            header,
            code,
            data,
            metadata,
        }
    }

    /// Encode to bytes.
    ///
    /// Section sizes, checksum and uncompressed size in the header are
    /// recomputed from the image contents.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut header = self.header.clone();
        header.header_size = HEADER_SIZE;

        let stored_code = if header.is_compressed() {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&self.code)
                .and_then(|_| encoder.finish())
                .map_err(FormatError::Compression)?
        } else {
            self.code.clone()
        };

        header.code_size = stored_code.len() as u32;
        header.uncompressed_code_size = self.code.len() as u32;
        header.data_size = self.data.len() as u32;
        header.metadata_size = if self.metadata.is_some() {
            METADATA_SIZE
        } else {
            0
        };

        let mut writer = ByteWriter::with_capacity(header.declared_file_size() as usize);
        header.encode(&mut writer);
        writer.emit_bytes(&stored_code);
        writer.emit_bytes(&self.data);
        if let Some(metadata) = &self.metadata {
            metadata.encode(&mut writer);
        }

        let checksum = crc32fast::hash(&writer.buffer()[HEADER_SIZE as usize..]);
        writer.patch_u32(RtHeader::CHECKSUM_OFFSET, checksum);
        Ok(writer.into_bytes())
    }

    /// Decode and fully validate an image
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        check_magic(bytes)?;
        if bytes.len() < HEADER_SIZE as usize {
            return Err(FormatError::Truncated {
                expected: HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        let mut reader = ByteReader::new(bytes);
        let header = RtHeader::decode(&mut reader)?;
        header.check_against_len(bytes.len() as u64)?;

        let payload_end = header.declared_file_size() as usize;
        let actual = crc32fast::hash(&bytes[HEADER_SIZE as usize..payload_end]);
        if actual != header.checksum {
            return Err(FormatError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        let stored_code = reader.read_slice(header.code_size as usize)?;
        let code = if header.is_compressed() {
            // One byte past the declared size is enough to detect a mismatch.
            let limit = header.uncompressed_code_size as u64 + 1;
            let mut code = Vec::new();
            DeflateDecoder::new(stored_code)
                .take(limit)
                .read_to_end(&mut code)
                .map_err(FormatError::Compression)?;
            if code.len() != header.uncompressed_code_size as usize {
                return Err(FormatError::Compression(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "inflated {} bytes, header declares {}",
                        code.len(),
                        header.uncompressed_code_size
                    ),
                )));
            }
            code
        } else {
            stored_code.to_vec()
        };
        let data = reader.read_slice(header.data_size as usize)?.to_vec();
        let metadata = if header.metadata_size > 0 {
            Some(RtMetadata::decode(&mut reader)?)
        } else {
            None
        };

        Ok(Self {
            header,
            code,
            data,
            metadata,
        })
    }
}

fn check_magic(bytes: &[u8]) -> Result<(), FormatError> {
    match bytes.get(..4) {
        Some(magic) if magic != MAGIC => {
            let mut found = [0u8; 4];
            found.copy_from_slice(magic);
            Err(FormatError::BadMagic(found))
        }
        Some(_) => Ok(()),
        None => Err(FormatError::Truncated {
            expected: HEADER_SIZE as u64,
            actual: bytes.len() as u64,
        }),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Write an RT file.
///
/// Stamps the header timestamp and, when the caller left it empty, the
/// metadata build date. Returns the header as written.
pub fn write(
    path: &Path,
    header: &RtHeader,
    code: &[u8],
    data: &[u8],
    metadata: Option<&RtMetadata>,
) -> Result<RtHeader, FormatError> {
    let mut header = header.clone();
    header.timestamp = unix_now();

    let metadata = metadata.map(|m| {
        let mut m = m.clone();
        if m.build_date.is_empty() {
            m.build_date = format_date(header.timestamp);
        }
        m
    });

    let image = RtImage::new(header, code.to_vec(), data.to_vec(), metadata);
    let bytes = image.encode()?;
    std::fs::write(path, &bytes).map_err(|e| FormatError::io(path, e))?;

    let mut reader = ByteReader::new(&bytes);
    let written = RtHeader::decode(&mut reader)?;
    debug!(
        path = %path.display(),
        arch = %written.arch,
        code_size = written.code_size,
        data_size = written.data_size,
        "wrote RT module"
    );
    Ok(written)
}

/// Read and fully validate an RT file
pub fn read(path: &Path) -> Result<RtImage, FormatError> {
    let bytes = std::fs::read(path).map_err(|e| FormatError::io(path, e))?;
    let image = RtImage::decode(&bytes)?;
    trace!(path = %path.display(), size = bytes.len(), "read RT module");
    Ok(image)
}

/// Header-level validation
pub fn validate(header: &RtHeader) -> bool {
    header.validate()
}

/// Whether a module built for `header` can run on `arch`/`os`
pub fn check_compatibility(
    header: &RtHeader,
    arch: crate::Architecture,
    os: crate::OperatingSystem,
) -> bool {
    header.check_compatibility(arch, os)
}

/// Re-read `path` from disk and check header consistency and checksum
pub fn check_integrity(path: &Path) -> Result<(), FormatError> {
    read(path).map(|_| ())
}

/// Whether `path` holds a consistent RT file
pub fn verify_integrity(path: &Path) -> bool {
    match check_integrity(path) {
        Ok(()) => true,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "integrity check failed");
            false
        }
    }
}

/// Header and metadata of an RT file, without its code
#[derive(Debug, Clone)]
pub struct RtSummary {
    /// File header
    pub header: RtHeader,
    /// Metadata, if present
    pub metadata: Option<RtMetadata>,
    /// Physical file size
    pub file_size: u64,
}

/// Read only the header and metadata of an RT file.
///
/// The payload checksum is not verified.
pub fn inspect(path: &Path) -> Result<RtSummary, FormatError> {
    let mut file = File::open(path).map_err(|e| FormatError::io(path, e))?;
    let file_size = file
        .metadata()
        .map_err(|e| FormatError::io(path, e))?
        .len();

    let mut raw = Vec::with_capacity(HEADER_SIZE as usize);
    (&mut file)
        .take(HEADER_SIZE as u64)
        .read_to_end(&mut raw)
        .map_err(|e| FormatError::io(path, e))?;
    check_magic(&raw)?;
    if raw.len() < HEADER_SIZE as usize {
        return Err(FormatError::Truncated {
            expected: HEADER_SIZE as u64,
            actual: raw.len() as u64,
        });
    }

    let header = RtHeader::decode(&mut ByteReader::new(&raw))?;
    header.check_against_len(file_size)?;

    let metadata = if header.metadata_size > 0 {
        let offset = HEADER_SIZE as u64 + header.code_size as u64 + header.data_size as u64;
        let mut raw = vec![0u8; METADATA_SIZE as usize];
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut raw))
            .map_err(|e| FormatError::io(path, e))?;
        Some(RtMetadata::decode(&mut ByteReader::new(&raw))?)
    } else {
        None
    };

    Ok(RtSummary {
        header,
        metadata,
        file_size,
    })
}
