//! Checkpointed story executor.
//!
//! Runs an ordered task list of small stories through an external AI coding
//! agent, one subprocess call per story, persisting progress by story id so
//! an interrupted run resumes exactly where it stopped. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (next-story selection, checkpoint
//!   migration, policy and output-contract checks). No I/O.
//! - **[`io`]**: Side-effecting operations (run directories, atomic JSON
//!   persistence, git, engine subprocesses). Isolated behind small APIs and
//!   the [`io::engine::Engine`] trait so tests can script them.
//!
//! Orchestration modules ([`executor`], [`run`], [`status`], [`validate`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod prd;
pub mod run;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
