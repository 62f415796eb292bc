//! Target identifiers: architecture, operating system and ABI
//!
//! Each identifier is a closed enum with a one-byte wire value. Zero is
//! reserved and never decodes. `parse` and `Display` are total over the
//! variants, so there is no catch-all "unknown" variant.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a target name is not recognized
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown {kind} '{name}'")]
pub struct ParseTargetError {
    /// Which identifier was being parsed ("architecture", "os", "abi")
    pub kind: &'static str,
    /// The rejected input
    pub name: String,
}

macro_rules! target_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, $canonical:literal $(| $alias:literal)*; )+
        }
    ) => {
        $(#[$meta])*
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            /// All variants in wire order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Decode from the one-byte wire value
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $( $value => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// The one-byte wire value
            pub fn to_u8(self) -> u8 {
                self as u8
            }

            /// Canonical lowercase name
            pub fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => $canonical, )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $name {
            type Err = ParseTargetError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $( $canonical $(| $alias)* => Ok($name::$variant), )+
                    _ => Err(ParseTargetError {
                        kind: $kind,
                        name: s.to_string(),
                    }),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.name())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let name = String::deserialize(deserializer)?;
                name.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

target_enum! {
    /// Target instruction-set architecture
    Architecture, "architecture" {
        /// 32-bit x86
        X86_32 = 1, "x86_32" | "x86" | "i386" | "i686";
        /// 64-bit x86
        X86_64 = 2, "x86_64" | "amd64" | "x64";
        /// 32-bit ARM
        Arm32 = 3, "arm32" | "arm" | "armv7";
        /// 64-bit ARM
        Arm64 = 4, "arm64" | "aarch64";
        /// 32-bit RISC-V
        RiscV32 = 5, "riscv32";
        /// 64-bit RISC-V
        RiscV64 = 6, "riscv64";
        /// 32-bit WebAssembly
        Wasm32 = 7, "wasm32";
        /// 64-bit WebAssembly
        Wasm64 = 8, "wasm64";
    }
}

target_enum! {
    /// Target operating system
    OperatingSystem, "os" {
        /// Microsoft Windows
        Windows = 1, "windows" | "win32";
        /// Linux
        Linux = 2, "linux";
        /// macOS
        MacOs = 3, "macos" | "darwin" | "osx";
        /// FreeBSD
        FreeBsd = 4, "freebsd";
        /// OpenBSD
        OpenBsd = 5, "openbsd";
        /// NetBSD
        NetBsd = 6, "netbsd";
        /// Android
        Android = 7, "android";
        /// iOS
        Ios = 8, "ios";
        /// No operating system
        BareMetal = 9, "bare" | "baremetal" | "none";
    }
}

target_enum! {
    /// Calling convention / ABI
    Abi, "abi" {
        /// System V AMD64 and i386 conventions
        SysV = 1, "sysv";
        /// Microsoft x64 convention
        Win64 = 2, "win64";
        /// 32-bit ARM procedure call standard
        Aapcs = 3, "aapcs";
        /// 64-bit ARM procedure call standard
        Aapcs64 = 4, "aapcs64";
        /// RISC-V calling convention
        RiscV = 5, "riscv";
        /// WebAssembly basic C ABI
        Wasm = 6, "wasm";
    }
}

impl Architecture {
    /// Pointer width in bits
    pub fn pointer_width(self) -> u32 {
        match self {
            Architecture::X86_32
            | Architecture::Arm32
            | Architecture::RiscV32
            | Architecture::Wasm32 => 32,
            Architecture::X86_64
            | Architecture::Arm64
            | Architecture::RiscV64
            | Architecture::Wasm64 => 64,
        }
    }

    /// Architecture of the running host
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Architecture::X86_64)
        } else if cfg!(target_arch = "x86") {
            Some(Architecture::X86_32)
        } else if cfg!(target_arch = "aarch64") {
            Some(Architecture::Arm64)
        } else if cfg!(target_arch = "arm") {
            Some(Architecture::Arm32)
        } else if cfg!(target_arch = "riscv64") {
            Some(Architecture::RiscV64)
        } else if cfg!(target_arch = "riscv32") {
            Some(Architecture::RiscV32)
        } else if cfg!(target_arch = "wasm32") {
            Some(Architecture::Wasm32)
        } else if cfg!(target_arch = "wasm64") {
            Some(Architecture::Wasm64)
        } else {
            None
        }
    }
}

impl OperatingSystem {
    /// Operating system of the running host
    pub fn host() -> Option<Self> {
        if cfg!(target_os = "windows") {
            Some(OperatingSystem::Windows)
        } else if cfg!(target_os = "android") {
            Some(OperatingSystem::Android)
        } else if cfg!(target_os = "linux") {
            Some(OperatingSystem::Linux)
        } else if cfg!(target_os = "macos") {
            Some(OperatingSystem::MacOs)
        } else if cfg!(target_os = "ios") {
            Some(OperatingSystem::Ios)
        } else if cfg!(target_os = "freebsd") {
            Some(OperatingSystem::FreeBsd)
        } else if cfg!(target_os = "openbsd") {
            Some(OperatingSystem::OpenBsd)
        } else if cfg!(target_os = "netbsd") {
            Some(OperatingSystem::NetBsd)
        } else if cfg!(target_os = "none") {
            Some(OperatingSystem::BareMetal)
        } else {
            None
        }
    }
}

impl Abi {
    /// Conventional ABI for an architecture/OS pair
    pub fn default_for(arch: Architecture, os: OperatingSystem) -> Self {
        match (arch, os) {
            (Architecture::X86_64, OperatingSystem::Windows) => Abi::Win64,
            (Architecture::Arm64, _) => Abi::Aapcs64,
            (Architecture::Arm32, _) => Abi::Aapcs,
            (Architecture::RiscV32 | Architecture::RiscV64, _) => Abi::RiscV,
            (Architecture::Wasm32 | Architecture::Wasm64, _) => Abi::Wasm,
            (Architecture::X86_32 | Architecture::X86_64, _) => Abi::SysV,
        }
    }
}

/// A complete target triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Instruction-set architecture
    pub arch: Architecture,
    /// Operating system
    pub os: OperatingSystem,
    /// Calling convention
    pub abi: Abi,
}

impl Target {
    /// Create a target with the conventional ABI for `arch`/`os`
    pub fn new(arch: Architecture, os: OperatingSystem) -> Self {
        Self {
            arch,
            os,
            abi: Abi::default_for(arch, os),
        }
    }

    /// The running host, if it is a recognized target
    pub fn host() -> Option<Self> {
        Some(Self::new(Architecture::host()?, OperatingSystem::host()?))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.arch, self.os, self.abi)
    }
}
