//! Generic utility primitives with zero domain knowledge.
//!
//! - `command` - Captured command output
//! - `io` - File I/O with consistent error handling
//! - `shell` - Shell quoting for display of argument lists

pub mod command;
pub mod io;
pub mod shell;
