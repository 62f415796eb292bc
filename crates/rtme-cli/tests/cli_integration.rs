//! Integration tests for the `rt_builder` pipeline and `rtme` subcommands.

use rtme_cli::build::{build_file, BuildOptions};
use rtme_cli::commands::{inspect, load, select, verify};
use rtme_codegen::{AstcWriter, Instruction};
use rtme_format::{features, Architecture, OperatingSystem, RtHeader, RtMetadata, Target};
use rtme_runtime::{Capabilities, LibcFunction, SelectionStrategy};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn linux_x64() -> Target {
    Target::new(Architecture::X86_64, OperatingSystem::Linux)
}

fn write_astc(dir: &Path, name: &str, writer: AstcWriter) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, writer.into_program().encode()).unwrap();
    path
}

fn write_runtime(dir: &Path, name: &str, speed: u32, code_len: usize, feature_flags: u32) -> PathBuf {
    let mut header = RtHeader::new(linux_x64());
    header.feature_flags = feature_flags;
    let mut meta = RtMetadata::with_compiler("test", "1.0");
    meta.execution_speed = speed;
    let path = dir.join(format!("{}.rt", name));
    rtme_format::write(&path, &header, &vec![0xC3; code_len], &[], Some(&meta)).unwrap();
    path
}

fn output(buf: Vec<u8>) -> String {
    String::from_utf8(buf).unwrap()
}

// ────────────────────────────────────────────────────────────────────────────
// rt_builder
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_build_astc_module_and_inspect() {
    let tmp = TempDir::new().unwrap();
    let mut writer = AstcWriter::new();
    writer.emit_const_i32(7);
    writer.emit_libc_call(LibcFunction::Malloc.id(), 1);
    writer.emit_return();
    let input = write_astc(tmp.path(), "prog.astc", writer);
    let output_path = tmp.path().join("prog.rt");

    let mut options = BuildOptions::new(linux_x64());
    options.optimization_level = 2;
    options.debug = true;
    let built = build_file(&input, &output_path, &options).unwrap();
    assert!(built.from_astc);
    assert_ne!(built.header.timestamp, 0);
    assert!(rtme_format::verify_integrity(&output_path));

    let mut out = Vec::new();
    inspect::execute(&output_path, &mut out).unwrap();
    let text = output(out);
    assert!(text.contains("x86_64-linux-sysv"), "{}", text);
    assert!(text.contains("Optimization: O2"));
    assert!(text.contains("debug-info"));
    assert!(text.contains("libc-forwarding"));
    assert!(text.contains("Compiler:     rt_builder"));
    assert!(text.contains("Build flags:  -O2 -g"));
    assert!(text.contains("ASTC instrs:  3"));
}

#[test]
fn test_build_raw_code() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("code.bin");
    std::fs::write(&input, [0x90, 0x90, 0xC3]).unwrap();
    let output_path = tmp.path().join("code.rt");

    let built = build_file(&input, &output_path, &BuildOptions::new(linux_x64())).unwrap();
    assert!(!built.from_astc);

    let image = rtme_format::read(&output_path).unwrap();
    assert_eq!(image.code, vec![0x90, 0x90, 0xC3]);
    assert_eq!(image.header.entry_point, 0);
    let meta = image.metadata.unwrap();
    assert_eq!(meta.astc_instruction_count, 0);
    assert_eq!(meta.build_flags, "-O1");
}

#[test]
fn test_build_missing_input_fails() {
    let tmp = TempDir::new().unwrap();
    let err = build_file(
        &tmp.path().join("missing.astc"),
        &tmp.path().join("out.rt"),
        &BuildOptions::new(linux_x64()),
    )
    .unwrap_err();
    assert!(err.to_string().contains("cannot read input file"));
    assert!(!tmp.path().join("out.rt").exists());
}

#[test]
fn test_build_bad_jump_fails() {
    let tmp = TempDir::new().unwrap();
    let mut writer = AstcWriter::new();
    writer.emit(Instruction::Jump(1000));
    let input = write_astc(tmp.path(), "bad.astc", writer);
    assert!(build_file(&input, &tmp.path().join("bad.rt"), &BuildOptions::new(linux_x64())).is_err());
}

// ────────────────────────────────────────────────────────────────────────────
// rtme verify
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_verify_reports_each_file() {
    let tmp = TempDir::new().unwrap();
    let good = write_runtime(tmp.path(), "good", 50, 16, 0);
    let bad = write_runtime(tmp.path(), "bad", 50, 16, 0);
    let mut bytes = std::fs::read(&bad).unwrap();
    bytes[70] ^= 0xFF;
    std::fs::write(&bad, bytes).unwrap();

    let mut out = Vec::new();
    verify::execute(std::slice::from_ref(&good), &mut out).unwrap();
    assert!(output(out).starts_with("OK"));

    let mut out = Vec::new();
    let err = verify::execute(&[good, bad], &mut out).unwrap_err();
    assert_eq!(err.to_string(), "1 of 2 files failed verification");
    let text = output(out);
    assert!(text.contains("OK      "));
    assert!(text.contains("FAILED  "));
}

// ────────────────────────────────────────────────────────────────────────────
// rtme select
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_select_prefers_fastest() {
    let tmp = TempDir::new().unwrap();
    write_runtime(tmp.path(), "slow", 20, 64, 0);
    let fast = write_runtime(tmp.path(), "fast", 90, 4096, 0);

    let request = select::SelectRequest {
        strategy: SelectionStrategy::Fastest,
        ..Default::default()
    };
    let mut out = Vec::new();
    assert!(select::execute(tmp.path(), &request, &mut out).unwrap());
    let text = output(out);
    assert!(text.contains("2 of 2 runtimes eligible"), "{}", text);
    assert!(text.contains(&format!("Selected: {}", fast.display())));
}

#[test]
fn test_select_filters_on_capabilities() {
    let tmp = TempDir::new().unwrap();
    write_runtime(tmp.path(), "plain", 90, 64, 0);
    write_runtime(tmp.path(), "io", 10, 64, features::FILE_IO);

    let request = select::SelectRequest {
        needs: Capabilities {
            file_io: true,
            ..Default::default()
        },
        json: true,
        ..Default::default()
    };
    let mut out = Vec::new();
    assert!(select::execute(tmp.path(), &request, &mut out).unwrap());
    let ranked: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let ranked = ranked.as_array().unwrap();
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0]["info"]["name"], "io");
}

#[test]
fn test_select_nothing_qualifies() {
    let tmp = TempDir::new().unwrap();
    write_runtime(tmp.path(), "plain", 90, 64, 0);

    let request = select::SelectRequest {
        needs: Capabilities {
            graphics: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut out = Vec::new();
    assert!(!select::execute(tmp.path(), &request, &mut out).unwrap());
    assert!(output(out).contains("0 of 1 runtimes eligible"));
}

#[test]
fn test_select_uses_program_requirements() {
    let tmp = TempDir::new().unwrap();
    let runtimes = tmp.path().join("runtimes");
    std::fs::create_dir(&runtimes).unwrap();
    write_runtime(&runtimes, "plain", 90, 64, 0);
    write_runtime(&runtimes, "io", 10, 64, features::FILE_IO);

    let mut writer = AstcWriter::new();
    writer.emit_const_i32(0);
    writer.emit_const_i32(0);
    writer.emit_libc_call(LibcFunction::Fopen.id(), 2);
    writer.emit_return();
    let program = write_astc(tmp.path(), "prog.astc", writer);

    let request = select::SelectRequest {
        program: Some(program),
        ..Default::default()
    };
    let req = request.requirements().unwrap();
    assert!(req.needs.file_io);

    let mut out = Vec::new();
    assert!(select::execute(&runtimes, &request, &mut out).unwrap());
    assert!(output(out).contains("io.rt"));
}

#[test]
fn test_select_missing_directory() {
    let request = select::SelectRequest::default();
    let mut out = Vec::new();
    assert!(select::execute(Path::new("/nonexistent/runtimes"), &request, &mut out).is_err());
}

// ────────────────────────────────────────────────────────────────────────────
// rtme load
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_load_by_name_and_path() {
    let tmp = TempDir::new().unwrap();
    let direct = write_runtime(tmp.path(), "direct", 50, 8, 0);
    let modules_dir = tmp.path().join("mods");
    std::fs::create_dir(&modules_dir).unwrap();
    write_runtime(&modules_dir, "libfoo", 50, 32, 0);

    let mut out = Vec::new();
    load::execute(
        None,
        &[modules_dir],
        &[
            "libfoo".to_string(),
            direct.display().to_string(),
            "libfoo".to_string(),
        ],
        false,
        false,
        &mut out,
    )
    .unwrap();
    let text = output(out);
    assert!(text.contains("loaded libfoo (id 1, 32 bytes, refs 1)"), "{}", text);
    assert!(text.contains("loaded direct (id 2, 8 bytes, refs 1)"), "{}", text);
    assert!(text.contains("loaded libfoo (id 1, 32 bytes, refs 2)"), "{}", text);
    assert!(text.contains("2 modules resident, 40 code bytes, 3 references"), "{}", text);
}

#[test]
fn test_load_with_config_file() {
    let tmp = TempDir::new().unwrap();
    write_runtime(tmp.path(), "configured", 50, 8, 0);
    let config = tmp.path().join("loader.toml");
    std::fs::write(
        &config,
        format!("search_paths = [{:?}]\n", tmp.path().display().to_string()),
    )
    .unwrap();

    let mut out = Vec::new();
    load::execute(Some(&config), &[], &["configured".to_string()], false, true, &mut out).unwrap();
    assert!(output(out).contains("loaded configured"));
}

#[test]
fn test_load_unknown_module() {
    let tmp = TempDir::new().unwrap();
    let mut out = Vec::new();
    let err = load::execute(
        None,
        &[tmp.path().to_path_buf()],
        &["nothing_here".to_string()],
        false,
        false,
        &mut out,
    )
    .unwrap_err();
    assert!(err.to_string().contains("cannot load 'nothing_here'"));
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_build_then_run() {
    let tmp = TempDir::new().unwrap();
    let mut writer = AstcWriter::new();
    writer.emit_const_i32(40);
    writer.emit_const_i32(2);
    writer.emit(Instruction::Add);
    writer.emit_return();
    let input = write_astc(tmp.path(), "answer.astc", writer);
    let module = tmp.path().join("answer.rt");
    build_file(&input, &module, &BuildOptions::new(linux_x64())).unwrap();

    let mut out = Vec::new();
    load::execute(None, &[], &[module.display().to_string()], true, false, &mut out).unwrap();
    assert!(output(out).contains("answer returned 42"));
}
