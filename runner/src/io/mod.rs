//! I/O helpers for runner commands.

pub mod config;
pub mod driver;
pub mod gates;
pub mod process;
pub mod prompt;
pub mod session_store;
pub mod state_machine;
