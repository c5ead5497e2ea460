//! Platform abstraction layer for process memory statistics.
//!
//! The real platform reads what the operating system exposes about the current process.
//! Unit tests substitute a mock to exercise parsing and error paths deterministically.

mod abstractions;
mod facade;
mod real;

pub(crate) use abstractions::*;
pub(crate) use facade::*;
pub(crate) use real::*;
