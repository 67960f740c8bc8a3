//! PyTorch job queue: dispatch coding agents to investigate PyTorch issues.
//!
//! A job is one tracked unit of work (an issue number or a freeform task) bound
//! to a target machine. Each job gets its own git worktree of a shared, pinned
//! PyTorch checkout, so concurrent jobs never see each other's edits. The
//! architecture keeps the same split as the rest of our tooling:
//!
//! - **[`core`]**: Pure, deterministic logic (job ids, lifecycle transitions,
//!   retention, event rendering). No I/O.
//! - **[`io`]**: Side-effecting adapters (job store, shell backends, git,
//!   workspace setup, worktrees, agent processes, results, reservations).
//!
//! Orchestration modules ([`controller`], [`auto`]) coordinate core logic with
//! I/O to implement CLI commands.

pub mod auto;
pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod interrupt;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
