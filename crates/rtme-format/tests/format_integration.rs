//! Integration tests for RT file reading and writing

use rtme_format::{
    check_compatibility, features, flags, inspect, read, validate, verify_integrity, write,
    Architecture, FormatError, OperatingSystem, RtHeader, RtMetadata, Target, Version,
    HEADER_SIZE, METADATA_SIZE,
};
use tempfile::TempDir;

fn linux_x64_header() -> RtHeader {
    RtHeader::new(Target::new(Architecture::X86_64, OperatingSystem::Linux))
}

#[test]
fn test_single_ret_module_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.rt");

    let header = linux_x64_header();
    assert_eq!(&header.magic, b"RTME");
    assert_eq!(header.version, Version::new(1, 0, 0));

    write(&path, &header, &[0xC3], &[], None).unwrap();
    let image = read(&path).unwrap();

    assert_eq!(image.code, vec![0xC3]);
    assert!(validate(&image.header));
    assert_eq!(image.header.arch, Architecture::X86_64);
    assert_eq!(image.header.os, OperatingSystem::Linux);
}

#[test]
fn test_round_trip_preserves_all_sections() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("full.rt");

    let mut header = RtHeader::new(Target::new(Architecture::Arm64, OperatingSystem::MacOs));
    header.flags = flags::DEBUG_INFO | flags::OPTIMIZED;
    header.optimization_level = 2;
    header.feature_flags = features::LIBC_FORWARDING | features::THREAD_SAFE;
    header.min_stack_size = 64 * 1024;
    header.min_heap_size = 1024 * 1024;
    header.entry_point = 4;

    let code: Vec<u8> = (0..=255u8).collect();
    let data = b"hello, world\0".to_vec();
    let metadata = RtMetadata {
        build_flags: "-O2 -g".to_string(),
        compilation_time_ms: 3,
        ..RtMetadata::with_compiler("rt_builder", "0.1.0")
    };

    let written = write(&path, &header, &code, &data, Some(&metadata)).unwrap();
    assert!(written.timestamp > 0);
    assert_eq!(written.metadata_size, METADATA_SIZE);

    let image = read(&path).unwrap();
    assert_eq!(image.code, code);
    assert_eq!(image.data, data);
    assert_eq!(image.header, written);
    assert!(image.header.has_debug_info());

    let read_meta = image.metadata.unwrap();
    assert_eq!(read_meta.compiler_name, "rt_builder");
    assert_eq!(read_meta.build_flags, "-O2 -g");
    // build date is stamped when left empty
    assert_eq!(read_meta.build_date.len(), 10);

    let file_len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(
        file_len,
        HEADER_SIZE as u64 + code.len() as u64 + data.len() as u64 + METADATA_SIZE as u64
    );
}

#[test]
fn test_compressed_round_trip_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("z.rt");

    let mut header = linux_x64_header();
    header.flags |= flags::COMPRESSED;
    let code = vec![0x90; 4096];

    write(&path, &header, &code, &[], None).unwrap();
    assert!(std::fs::metadata(&path).unwrap().len() < 4096);
    assert_eq!(read(&path).unwrap().code, code);
}

#[test]
fn test_bad_magic_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("elf.rt");

    write(&path, &linux_x64_header(), &[0xC3], &[], None).unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[..4].copy_from_slice(b"\x7fELF");
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(read(&path), Err(FormatError::BadMagic(_))));
    assert!(matches!(inspect(&path), Err(FormatError::BadMagic(_))));
    assert!(!verify_integrity(&path));

    let mut header = linux_x64_header();
    header.magic = *b"\x7fELF";
    assert!(!validate(&header));
}

#[test]
fn test_verify_integrity_rereads_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("m.rt");

    write(&path, &linux_x64_header(), &[0x90, 0x90, 0xC3], &[7; 16], None).unwrap();
    assert!(verify_integrity(&path));

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();
    assert!(!verify_integrity(&path));

    bytes.truncate(HEADER_SIZE as usize + 1);
    std::fs::write(&path, &bytes).unwrap();
    assert!(matches!(read(&path), Err(FormatError::Truncated { .. })));
}

#[test]
fn test_inspect_reads_header_and_metadata() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("runtime.rt");

    let metadata = RtMetadata {
        execution_speed: 90,
        libc_function_count: 13,
        max_memory: 32 << 20,
        ..RtMetadata::default()
    };
    write(&path, &linux_x64_header(), &[0xC3; 100], &[], Some(&metadata)).unwrap();

    let summary = inspect(&path).unwrap();
    assert_eq!(summary.header.code_size, 100);
    assert_eq!(summary.file_size, 64 + 100 + METADATA_SIZE as u64);
    let meta = summary.metadata.unwrap();
    assert_eq!(meta.execution_speed, 90);
    assert_eq!(meta.max_memory, 32 << 20);
}

#[test]
fn test_compatibility_of_written_module() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("c.rt");
    write(&path, &linux_x64_header(), &[0xC3], &[], None).unwrap();

    let header = read(&path).unwrap().header;
    assert!(check_compatibility(&header, Architecture::X86_64, OperatingSystem::Linux));
    assert!(!check_compatibility(&header, Architecture::Arm64, OperatingSystem::Linux));
    assert!(!check_compatibility(&header, Architecture::X86_64, OperatingSystem::MacOs));
}
