//! Command-line arguments for `rt_builder` and `rtme`

use crate::build::{BuildOptions, DEFAULT_HEAP_SIZE, DEFAULT_STACK_SIZE};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use rtme_format::{Abi, Architecture, OperatingSystem, Target};
use rtme_runtime::{Capabilities, SelectionStrategy};
use std::path::PathBuf;

/// `rt_builder` arguments.
///
/// `-h` is the heap size, so help is only available as `--help`.
#[derive(Parser, Debug)]
#[command(name = "rt_builder")]
#[command(about = "Package machine code or ASTC bytecode as an RT module", long_about = None)]
#[command(version, disable_help_flag = true)]
pub struct BuilderArgs {
    /// Input file: ASTC bytecode or raw machine code
    pub input: PathBuf,

    /// Output .rt file
    pub output: PathBuf,

    /// Target architecture (default: host)
    #[arg(short = 'a', long = "arch")]
    pub arch: Option<Architecture>,

    /// Target operating system (default: host)
    #[arg(short = 'o', long = "os")]
    pub os: Option<OperatingSystem>,

    /// Calling convention (default: conventional for arch/os)
    #[arg(short = 'b', long = "abi")]
    pub abi: Option<Abi>,

    /// Optimization level
    #[arg(short = 'O', long = "optimize", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(0..=3))]
    pub optimize: u32,

    /// Minimum stack size in bytes
    #[arg(short = 's', long = "stack", default_value_t = DEFAULT_STACK_SIZE)]
    pub stack: u32,

    /// Minimum heap size in bytes
    #[arg(short = 'h', long = "heap", default_value_t = DEFAULT_HEAP_SIZE)]
    pub heap: u32,

    /// Mark the module as carrying debug information
    #[arg(short = 'g', long = "debug")]
    pub debug: bool,

    /// Mark the code section as compressed
    #[arg(short = 'z', long = "compress")]
    pub compress: bool,

    /// Log each build step
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

impl BuilderArgs {
    /// Resolve the target, filling unset parts from the host
    pub fn target(&self) -> anyhow::Result<Target> {
        let host = Target::host();
        let arch = match (self.arch, host) {
            (Some(arch), _) => arch,
            (None, Some(host)) => host.arch,
            (None, None) => anyhow::bail!("unrecognized host architecture; pass --arch"),
        };
        let os = match (self.os, host) {
            (Some(os), _) => os,
            (None, Some(host)) => host.os,
            (None, None) => anyhow::bail!("unrecognized host operating system; pass --os"),
        };
        let mut target = Target::new(arch, os);
        if let Some(abi) = self.abi {
            target.abi = abi;
        }
        Ok(target)
    }

    /// Build settings for these arguments
    pub fn options(&self) -> anyhow::Result<BuildOptions> {
        let mut options = BuildOptions::new(self.target()?);
        options.optimization_level = self.optimize;
        options.stack_size = self.stack;
        options.heap_size = self.heap;
        options.debug = self.debug;
        options.compress = self.compress;
        Ok(options)
    }
}

/// `rtme` arguments
#[derive(Parser, Debug)]
#[command(name = "rtme")]
#[command(about = "Inspect, verify, select and load RT runtime modules", long_about = None)]
#[command(version)]
pub struct RtmeCli {
    /// Log lifecycle events
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Capability names accepted by `--needs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Capability {
    /// Thread-safe runtime
    Threading,
    /// Floating-point support
    FloatingPoint,
    /// File I/O through libc
    FileIo,
    /// Graphics output
    Graphics,
}

impl Capability {
    /// Fold a list of names into a capability set
    pub fn collect(names: &[Capability]) -> Capabilities {
        let mut caps = Capabilities::default();
        for name in names {
            match name {
                Capability::Threading => caps.threading = true,
                Capability::FloatingPoint => caps.floating_point = true,
                Capability::FileIo => caps.file_io = true,
                Capability::Graphics => caps.graphics = true,
            }
        }
        caps
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the header and metadata of an RT file
    Inspect {
        /// RT file
        file: PathBuf,
    },

    /// Check the integrity of RT files
    Verify {
        /// RT files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Choose the best runtime in a directory for a program
    Select {
        /// Directory of .rt runtimes
        dir: PathBuf,
        /// ASTC program to derive requirements from
        #[arg(short, long)]
        program: Option<PathBuf>,
        /// Weighting preset
        #[arg(short, long, default_value_t = SelectionStrategy::Balanced)]
        strategy: SelectionStrategy,
        /// Memory the program needs, in bytes
        #[arg(long)]
        min_memory: Option<u64>,
        /// Largest acceptable runtime footprint, in bytes
        #[arg(long)]
        max_footprint: Option<u64>,
        /// Required capabilities
        #[arg(long, value_enum, value_delimiter = ',')]
        needs: Vec<Capability>,
        /// Only consider runtimes compatible with this host
        #[arg(long)]
        host: bool,
        /// Print the ranking as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load modules through the module loader
    Load {
        /// Loader configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Additional search directory
        #[arg(short = 'L', long = "search-path")]
        search_paths: Vec<PathBuf>,
        /// Module names or .rt paths
        #[arg(required = true)]
        modules: Vec<String>,
        /// Execute each module's entry point after loading
        #[arg(long)]
        run: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_definitions_are_consistent() {
        BuilderArgs::command().debug_assert();
        RtmeCli::command().debug_assert();
    }

    #[test]
    fn test_builder_defaults() {
        let args = BuilderArgs::try_parse_from(["rt_builder", "in.astc", "out.rt"]).unwrap();
        assert_eq!(args.optimize, 1);
        assert_eq!(args.stack, DEFAULT_STACK_SIZE);
        assert_eq!(args.heap, DEFAULT_HEAP_SIZE);
        assert!(!args.debug && !args.compress && !args.verbose);
    }

    #[test]
    fn test_builder_short_flags() {
        let args = BuilderArgs::try_parse_from([
            "rt_builder", "-a", "arm64", "-o", "macos", "-O", "3", "-h", "4096", "-s", "512",
            "-g", "-z", "in", "out.rt",
        ])
        .unwrap();
        let options = args.options().unwrap();
        assert_eq!(options.target, Target::new(Architecture::Arm64, OperatingSystem::MacOs));
        assert_eq!(options.optimization_level, 3);
        assert_eq!(options.heap_size, 4096);
        assert_eq!(options.stack_size, 512);
        assert!(options.debug && options.compress);
    }

    #[test]
    fn test_builder_abi_override() {
        let args = BuilderArgs::try_parse_from([
            "rt_builder", "--arch", "x86_64", "--os", "windows", "--abi", "sysv", "in", "out",
        ])
        .unwrap();
        assert_eq!(args.target().unwrap().abi, Abi::SysV);
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(BuilderArgs::try_parse_from(["rt_builder", "-O", "4", "in", "out"]).is_err());
        assert!(BuilderArgs::try_parse_from(["rt_builder", "-a", "sparc", "in", "out"]).is_err());
        assert!(BuilderArgs::try_parse_from(["rt_builder", "in"]).is_err());
    }

    #[test]
    fn test_select_arguments() {
        let cli = RtmeCli::try_parse_from([
            "rtme", "select", "runtimes", "--strategy", "fastest", "--needs",
            "file-io,threading", "--min-memory", "1024", "--json",
        ])
        .unwrap();
        match cli.command {
            Command::Select { strategy, needs, min_memory, json, .. } => {
                assert_eq!(strategy, SelectionStrategy::Fastest);
                let caps = Capability::collect(&needs);
                assert!(caps.file_io && caps.threading && !caps.graphics);
                assert_eq!(min_memory, Some(1024));
                assert!(json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_verbose_and_load() {
        let cli = RtmeCli::try_parse_from([
            "rtme", "load", "-L", "a", "-L", "b", "libfoo", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Load { search_paths, modules, run, .. } => {
                assert_eq!(search_paths, vec![PathBuf::from("a"), PathBuf::from("b")]);
                assert_eq!(modules, vec!["libfoo".to_string()]);
                assert!(!run);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_verify_needs_files() {
        assert!(RtmeCli::try_parse_from(["rtme", "verify"]).is_err());
    }
}
