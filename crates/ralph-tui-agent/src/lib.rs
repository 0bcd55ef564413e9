//! Process-backed agent adapter for the ralph-tui engine.
//!
//! Provides:
//! - `CommandBuilder` - agent command-line construction
//! - `ProcessAgent` - spawn a CLI agent, stream stdout/stderr/JSONL,
//!   interrupt via process-group signal

pub mod command;
pub mod jsonl;
pub mod process;

pub use command::{resolve_executable_path, CommandBuilder, CommandParts};
pub use process::ProcessAgent;
