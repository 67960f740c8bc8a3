//! Process-wide Ctrl-C flag.
//!
//! Installing the handler stops SIGINT from killing ptq outright, so blocking
//! loops can notice the interrupt and unwind (and scoped reservations still get
//! released on the way out).

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::debug;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Install the Ctrl-C handler. Call once from `main`.
pub fn install() -> Result<()> {
    ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
    })
    .context("install ctrl-c handler")?;
    debug!("ctrl-c handler installed");
    Ok(())
}

/// True once Ctrl-C was pressed.
pub fn requested() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Fail with [`crate::error::PtqError::Interrupted`] if Ctrl-C was pressed.
pub fn check() -> Result<()> {
    if requested() {
        return Err(crate::error::PtqError::Interrupted.into());
    }
    Ok(())
}
