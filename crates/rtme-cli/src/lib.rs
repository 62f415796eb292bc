//! Command-line front ends for RTME
//!
//! `rt_builder` packages machine code or ASTC bytecode as `.rt` modules;
//! `rtme` inspects, verifies, selects and loads them.

pub mod args;
pub mod build;
pub mod commands;
pub mod logging;
