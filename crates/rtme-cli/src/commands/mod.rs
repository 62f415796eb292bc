//! `rtme` subcommands
//!
//! Each command writes its report to the given writer so the binary and
//! the tests share one code path.

pub mod inspect;
pub mod load;
pub mod select;
pub mod verify;
