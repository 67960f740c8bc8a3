//! Deterministic, pure logic shared by the ptq commands.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod cuda;
pub mod events;
pub mod job_id;
pub mod layout;
pub mod lifecycle;
pub mod retention;
pub mod types;
