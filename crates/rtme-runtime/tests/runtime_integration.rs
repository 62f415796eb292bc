//! Integration tests for loading, selecting and running modules

use rtme_codegen::AstcWriter;
use rtme_format::{
    features, write, Architecture, OperatingSystem, RtHeader, RtMetadata, Target,
};
use rtme_runtime::{
    analyze_program, Capabilities, LibcFunction, LibcTable, LoaderError, ModuleLoader,
    ProgramRequirements, RuntimeInfo, RuntimeSelector, SelectionStrategy,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn linux_x64() -> Target {
    Target::new(Architecture::X86_64, OperatingSystem::Linux)
}

fn write_rt(path: &Path, code: &[u8], header: RtHeader, metadata: Option<&RtMetadata>) {
    write(path, &header, code, &[], metadata).unwrap();
}

// ============================================================================
// Loader
// ============================================================================

#[test]
fn test_load_idempotence() {
    let dir = TempDir::new().unwrap();
    write_rt(&dir.path().join("x.rt"), &[0xC3], RtHeader::new(linux_x64()), None);

    let loader = ModuleLoader::with_libc(LibcTable::new());
    loader.add_search_path(dir.path()).unwrap();

    let first = loader.load("x").unwrap();
    assert_eq!(first.reference_count(), 1);
    let second = loader.load("x").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.reference_count(), 2);

    loader.unload(&first).unwrap();
    assert!(first.is_resident());
    assert_eq!(first.reference_count(), 1);
    assert_eq!(loader.module_count(), 1);

    loader.unload(&second).unwrap();
    assert_eq!(loader.module_count(), 0);
    assert!(loader.list_loaded().is_empty());
}

#[test]
fn test_missing_module_leaves_table_unchanged() {
    let dir = TempDir::new().unwrap();
    write_rt(&dir.path().join("present.rt"), &[0xC3], RtHeader::new(linux_x64()), None);

    let loader = ModuleLoader::with_libc(LibcTable::new());
    loader.init(false);
    loader.add_search_path(dir.path()).unwrap();
    loader.load("present").unwrap();

    let before = loader.module_count();
    assert!(matches!(
        loader.load("m"),
        Err(LoaderError::NotFound { name }) if name == "m"
    ));
    assert_eq!(loader.module_count(), before);
}

#[test]
fn test_bad_magic_rejected_by_load_rt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("m.rt");
    write_rt(&path, &[0xC3], RtHeader::new(linux_x64()), None);

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] = b'X';
    std::fs::write(&path, &bytes).unwrap();

    let loader = ModuleLoader::with_libc(LibcTable::new());
    assert!(matches!(
        loader.load_rt(&path),
        Err(LoaderError::InvalidFormat { .. })
    ));
    assert_eq!(loader.module_count(), 0);
}

#[test]
fn test_loaded_module_carries_header_and_metadata() {
    let dir = TempDir::new().unwrap();
    let mut header = RtHeader::new(linux_x64());
    header.entry_point = 2;
    let metadata = RtMetadata::with_compiler("rt_builder", "0.2.0");
    write_rt(&dir.path().join("m.rt"), &[0x90, 0x90, 0xC3], header, Some(&metadata));

    let loader = ModuleLoader::with_libc(LibcTable::new());
    loader.add_search_path(dir.path()).unwrap();
    let module = loader.load("m").unwrap();

    assert_eq!(module.module_data(), &[0x90, 0x90, 0xC3]);
    assert_eq!(module.entry_offset(), 2);
    assert_eq!(module.metadata().unwrap().compiler_name, "rt_builder");
    assert_eq!(module.header().arch, Architecture::X86_64);
}

#[test]
fn test_shared_loader_across_threads() {
    let dir = TempDir::new().unwrap();
    write_rt(&dir.path().join("shared.rt"), &[0xC3], RtHeader::new(linux_x64()), None);

    let loader = Arc::new(ModuleLoader::with_libc(LibcTable::new()));
    loader.add_search_path(dir.path()).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let loader = Arc::clone(&loader);
            std::thread::spawn(move || loader.load("shared").unwrap())
        })
        .collect();
    let modules: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(loader.module_count(), 1);
    assert_eq!(modules[0].reference_count(), 8);
    for module in &modules {
        loader.unload(module).unwrap();
    }
    assert_eq!(loader.module_count(), 0);
}

// ============================================================================
// Selector
// ============================================================================

fn candidate(name: &str, speed: u32, size: u64, footprint: u64) -> RuntimeInfo {
    RuntimeInfo {
        execution_speed: speed,
        file_size: size,
        memory_footprint: footprint,
        ..RuntimeInfo::new(name, linux_x64())
    }
}

#[test]
fn test_memory_budget_leaves_single_candidate() {
    let mut selector = RuntimeSelector::new();
    selector.register(candidate("A", 100, 50_000, 2 * 1024 * 1024));
    selector.register(candidate("B", 40, 5_000, 512 * 1024));

    let req = ProgramRequirements {
        max_memory_footprint: Some(1024 * 1024),
        ..ProgramRequirements::default()
    };
    for strategy in SelectionStrategy::ALL {
        let best = selector.select_best(&req, &strategy.criteria()).unwrap();
        assert_eq!(best.name, "B", "strategy {}", strategy);
    }
}

#[test]
fn test_filter_never_returns_ineligible_candidate() {
    // Deterministic sweep over ceilings and capability sets
    let mut seed = 0x2545_F491u32;
    let mut next = || {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        seed
    };

    for _ in 0..200 {
        let mut selector = RuntimeSelector::new();
        for i in 0..4 {
            let bits = next();
            let speed = next() % 200;
            let size = next() as u64 % 100_000;
            let footprint = next() as u64 % 10_000_000;
            let mut info = candidate(&format!("c{}", i), speed, size, footprint);
            info.max_memory = (next() % 8 + 1) as u64 * 1024 * 1024;
            info.capabilities = Capabilities {
                threading: bits & 1 != 0,
                floating_point: bits & 2 != 0,
                file_io: bits & 4 != 0,
                graphics: bits & 8 != 0,
            };
            selector.register(info);
        }

        let bits = next();
        let req = ProgramRequirements {
            min_memory: (next() % 8) as u64 * 1024 * 1024,
            needs: Capabilities {
                threading: bits & 1 != 0,
                floating_point: bits & 2 != 0,
                file_io: bits & 4 != 0,
                graphics: bits & 8 != 0,
            },
            ..ProgramRequirements::default()
        };

        for strategy in SelectionStrategy::ALL {
            if let Some(best) = selector.select_best(&req, &strategy.criteria()) {
                assert!(best.max_memory >= req.min_memory);
                assert!(best.capabilities.contains(&req.needs));
            }
        }
    }
}

#[test]
fn test_fastest_never_demotes_fastest_candidate() {
    let sets = [
        vec![
            candidate("a", 100, 90_000, 9_000_000),
            candidate("b", 60, 1_000, 100_000),
            candidate("c", 30, 500, 50_000),
        ],
        vec![
            candidate("a", 10, 1_000, 1_000),
            candidate("b", 11, 100_000, 100_000),
        ],
        vec![
            candidate("a", 80, 20_000, 2_000_000),
            candidate("b", 90, 40_000, 4_000_000),
            candidate("c", 85, 10_000, 1_000_000),
            candidate("d", 20, 2_000, 100_000),
        ],
    ];

    for candidates in sets {
        let mut selector = RuntimeSelector::new();
        let fastest = candidates
            .iter()
            .max_by_key(|c| c.execution_speed)
            .unwrap()
            .name
            .clone();
        for c in candidates {
            selector.register(c);
        }

        let rank_of = |strategy: SelectionStrategy| {
            selector
                .rank(&ProgramRequirements::default(), &strategy.criteria())
                .iter()
                .position(|s| s.info.name == fastest)
                .unwrap()
        };
        assert!(rank_of(SelectionStrategy::Fastest) <= rank_of(SelectionStrategy::Balanced));
    }
}

#[test]
fn test_scan_runtimes_from_directory() {
    let dir = TempDir::new().unwrap();

    let mut fast = RtHeader::new(linux_x64());
    fast.optimization_level = 3;
    fast.feature_flags = features::THREAD_SAFE | features::FLOATING_POINT;
    write_rt(&dir.path().join("runtime_fast.rt"), &[0x90; 256], fast, None);

    let mut small = RtHeader::new(linux_x64());
    small.optimization_level = 0;
    let metadata = RtMetadata {
        execution_speed: 35,
        libc_function_count: 11,
        max_memory: 4 * 1024 * 1024,
        ..RtMetadata::with_compiler("rt_builder", "0.2.0")
    };
    write_rt(&dir.path().join("runtime_small.rt"), &[0xC3], small, Some(&metadata));

    std::fs::write(dir.path().join("broken.rt"), b"garbage").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

    let mut selector = RuntimeSelector::new();
    assert_eq!(selector.scan_runtimes(dir.path()).unwrap(), 2);

    let names: Vec<_> = selector.candidates().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["runtime_fast", "runtime_small"]);

    let fast = &selector.candidates()[0];
    assert_eq!(fast.execution_speed, 100);
    assert!(fast.capabilities.threading && fast.capabilities.floating_point);
    assert_eq!(fast.max_libc_functions, 50);

    let small = &selector.candidates()[1];
    assert_eq!(small.execution_speed, 35);
    assert_eq!(small.max_libc_functions, 11);
    assert_eq!(small.max_memory, 4 * 1024 * 1024);

    let needs_threads = ProgramRequirements {
        needs: Capabilities {
            threading: true,
            ..Capabilities::default()
        },
        ..ProgramRequirements::default()
    };
    let best = selector
        .select_best(&needs_threads, &SelectionStrategy::Smallest.criteria())
        .unwrap();
    assert_eq!(best.name, "runtime_fast");
}

#[test]
fn test_scan_missing_directory() {
    let mut selector = RuntimeSelector::new();
    assert!(selector.scan_runtimes(Path::new("/nonexistent/runtimes")).is_err());
}

#[test]
fn test_analyze_program_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prog.astc");

    let mut writer = AstcWriter::new();
    writer.emit_const_i32(0);
    writer.emit_const_i32(0);
    writer.emit_libc_call(LibcFunction::Fopen.id(), 2);
    writer.emit_return();
    let bytes = writer.into_program().encode();
    std::fs::write(&path, &bytes).unwrap();

    let req = analyze_program(&path).unwrap();
    assert_eq!(req.min_memory, 2 * bytes.len() as u64);
    assert!(req.needs.file_io);
    assert_eq!(req.libc_functions_used, 1);

    std::fs::write(&path, b"not astc").unwrap();
    assert!(analyze_program(&path).is_err());
}

// ============================================================================
// Execution (x86-64 Linux only)
// ============================================================================

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod execution {
    use super::*;
    use rtme_codegen::{compile, AstcProgram, Instruction};

    fn run(program: &AstcProgram, libc: LibcTable) -> i64 {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prog.rt");
        let compiled = compile(program, &linux_x64()).unwrap();
        let mut header = RtHeader::new(linux_x64());
        header.entry_point = compiled.entry_point;
        write_rt(&path, &compiled.code, header, None);

        let loader = ModuleLoader::with_libc(libc);
        let module = loader.load_rt(&path).unwrap();
        unsafe { module.execute().unwrap() }
    }

    fn constant(value: i32) -> AstcProgram {
        AstcProgram::new(vec![Instruction::ConstI32(value), Instruction::Return])
    }

    #[test]
    fn test_constants_reach_return_value() {
        for value in [0, 1, -1, 127, -128, 128, 123456, -70000, i32::MAX, i32::MIN] {
            assert_eq!(run(&constant(value), LibcTable::new()), value as i64);
        }
    }

    #[test]
    fn test_empty_stack_returns_zero() {
        assert_eq!(run(&AstcProgram::new(vec![]), LibcTable::new()), 0);
        assert_eq!(
            run(&AstcProgram::new(vec![Instruction::Nop, Instruction::Return]), LibcTable::new()),
            0
        );
    }

    #[test]
    fn test_return_reached_by_backward_jump() {
        // JUMP 6; RETURN; CONST 5; JUMP 5
        let program = AstcProgram::new(vec![
            Instruction::Jump(6),
            Instruction::Return,
            Instruction::ConstI32(5),
            Instruction::Jump(5),
        ]);
        assert_eq!(run(&program, LibcTable::new()), 5);
    }

    #[test]
    fn test_mid_stream_entry_starts_with_empty_stack() {
        let mut skipped = AstcProgram::new(vec![
            Instruction::ConstI32(7),
            Instruction::Nop,
            Instruction::Return,
        ]);
        skipped.entry_point = 5;
        assert_eq!(run(&skipped, LibcTable::new()), 0);

        let mut second = AstcProgram::new(vec![
            Instruction::ConstI32(7),
            Instruction::ConstI32(9),
            Instruction::Return,
        ]);
        second.entry_point = 5;
        assert_eq!(run(&second, LibcTable::new()), 9);
    }

    #[test]
    fn test_arithmetic() {
        // ((7 - 3) * 6) / 2
        let program = AstcProgram::new(vec![
            Instruction::ConstI32(7),
            Instruction::ConstI32(3),
            Instruction::Sub,
            Instruction::ConstI32(6),
            Instruction::Mul,
            Instruction::ConstI32(2),
            Instruction::Div,
            Instruction::Return,
        ]);
        assert_eq!(run(&program, LibcTable::new()), 12);

        let negative = AstcProgram::new(vec![
            Instruction::ConstI32(-20),
            Instruction::ConstI32(3),
            Instruction::Div,
            Instruction::Return,
        ]);
        assert_eq!(run(&negative, LibcTable::new()), -6);
    }

    #[test]
    fn test_locals_and_loop() {
        // local0 = 5; local1 = 0; while local0 { local1 += local0; local0 -= 1 }; return local1
        let mut w = AstcWriter::new();
        w.emit_const_i32(5);
        w.emit_store_local(0);
        w.emit_const_i32(0);
        w.emit_store_local(1);
        let head = w.emit_load_local(0);
        let exit = w.emit_forward_jump(true);
        w.emit_load_local(1);
        w.emit_load_local(0);
        w.emit(Instruction::Add);
        w.emit_store_local(1);
        w.emit_load_local(0);
        w.emit_const_i32(1);
        w.emit(Instruction::Sub);
        w.emit_store_local(0);
        w.emit(Instruction::Jump(head));
        let done = w.emit_load_local(1);
        w.emit_return();
        w.patch_target(exit, done);

        assert_eq!(run(&w.into_program(), LibcTable::new()), 15);
    }

    #[test]
    fn test_entry_point_skips_prefix() {
        let mut w = AstcWriter::new();
        w.emit_const_i32(1);
        w.emit_return();
        let entry = w.emit_const_i32(2);
        w.emit_return();
        w.set_entry_point(entry);
        assert_eq!(run(&w.into_program(), LibcTable::new()), 2);
    }

    #[test]
    fn test_libc_call_goes_through_table() {
        let mut libc = LibcTable::new();
        libc.register(LibcFunction::Strcmp, |args: &[u64]| args[0] * 10 + args[1]);

        let mut w = AstcWriter::new();
        w.emit_const_i32(2);
        w.emit_const_i32(3);
        w.emit_libc_call(LibcFunction::Strcmp.id(), 2);
        w.emit_const_i32(100);
        w.emit(Instruction::Add);
        w.emit_return();

        assert_eq!(run(&w.into_program(), libc), 123);
    }

    #[test]
    fn test_host_libc_strlen() {
        // p = malloc(8); memset(p, 0, 8); memset(p, 'a', 7); strlen(p); free(p)
        let mut w = AstcWriter::new();
        w.emit_const_i32(8);
        w.emit_libc_call(LibcFunction::Malloc.id(), 1);
        w.emit_store_local(0);
        w.emit_load_local(0);
        w.emit_const_i32(0);
        w.emit_const_i32(8);
        w.emit_libc_call(LibcFunction::Memset.id(), 3);
        w.emit_store_local(1);
        w.emit_load_local(0);
        w.emit_const_i32(b'a' as i32);
        w.emit_const_i32(7);
        w.emit_libc_call(LibcFunction::Memset.id(), 3);
        w.emit_libc_call(LibcFunction::Strlen.id(), 1);
        w.emit_load_local(0);
        w.emit_libc_call(LibcFunction::Free.id(), 1);
        w.emit_store_local(1);
        w.emit_return();

        assert_eq!(run(&w.into_program(), LibcTable::host()), 7);
    }

    #[test]
    fn test_wrong_architecture_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arm.rt");
        let target = Target::new(Architecture::Arm64, OperatingSystem::Linux);
        write_rt(&path, &[0xC0, 0x03, 0x5F, 0xD6], RtHeader::new(target), None);

        let loader = ModuleLoader::with_libc(LibcTable::new());
        let module = loader.load_rt(&path).unwrap();
        assert!(unsafe { module.execute() }.is_err());
    }
}
