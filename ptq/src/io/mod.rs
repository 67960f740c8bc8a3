//! I/O adapters for ptq commands.

pub mod agent;
pub mod apply;
pub mod backend;
pub mod config;
pub mod git;
pub mod issue;
pub mod job_store;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod reservation;
pub mod results;
pub mod skills;
pub mod workspace;
pub mod worktree;
