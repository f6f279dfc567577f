//! Ctrl+C handling.
//!
//! The first press cancels the active generation. A second press, or a press
//! while nothing is generating, exits with status 130.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use parley_core::StopHandle;

static PRESSED: AtomicBool = AtomicBool::new(false);
static STOP: OnceLock<StopHandle> = OnceLock::new();

#[derive(Debug)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

/// Installs the handler. Call once per process.
///
/// # Errors
/// Returns an error if a handler is already installed.
pub fn init(stop: StopHandle) -> Result<()> {
    let _ = STOP.set(stop);
    ctrlc::set_handler(trigger_ctrl_c).context("install Ctrl+C handler")
}

fn trigger_ctrl_c() {
    let cancelled = STOP.get().is_some_and(StopHandle::stop);
    if !cancelled || PRESSED.swap(true, Ordering::SeqCst) {
        std::process::exit(130);
    }
}

/// Re-arms the first-press behavior after a generation settles.
pub fn reset() {
    PRESSED.store(false, Ordering::SeqCst);
}
