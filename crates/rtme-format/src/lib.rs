//! RT module format
//!
//! This crate defines the `.rt` runtime-module binary format: a fixed
//! 64-byte header, the code and data sections, and an optional fixed-size
//! metadata trailer. It also provides the target identifiers shared by the
//! code generator and the runtime.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod encoder;
pub mod file;
pub mod header;
pub mod metadata;
pub mod target;

pub use encoder::{ByteReader, ByteWriter, DecodeError};
pub use file::{
    check_compatibility, check_integrity, inspect, read, validate, verify_integrity, write,
    FormatError, RtImage, RtSummary,
};
pub use header::{
    features, flags, CompatibilityError, HeaderError, RtHeader, Version, FORMAT_VERSION,
    HEADER_SIZE, MAGIC,
};
pub use metadata::{format_date, RtMetadata, METADATA_SIZE};
pub use target::{Abi, Architecture, OperatingSystem, ParseTargetError, Target};
