//! I/O helpers for runner commands.

pub mod artifacts;
pub mod checkpoint_store;
pub mod config;
pub mod debug_bundle;
pub mod engine;
pub mod git;
pub mod json;
pub mod prd_store;
pub mod process;
pub mod prompt;
pub mod run_dir;
pub mod run_log;
pub mod run_record;
