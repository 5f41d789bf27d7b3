//! Process-wide shutdown flags.
//!
//! Signal delivery only stores into these atomics; the reactor and the master
//! read them at one well-defined point per loop iteration. Forked workers get
//! their own copies, so a signal sent to a worker's pid flips that worker's
//! flags only.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use once_cell::sync::Lazy;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};

static TERMINATE: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));
static QUIT: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

/// Routes `SIGTERM`/`SIGINT` to hard stop and `SIGQUIT` to graceful drain.
pub fn install() -> std::io::Result<()> {
    signal_hook::flag::register(SIGTERM, Arc::clone(&TERMINATE))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&TERMINATE))?;
    signal_hook::flag::register(SIGQUIT, Arc::clone(&QUIT))?;
    Ok(())
}

#[inline]
pub fn terminate_requested() -> bool {
    TERMINATE.load(Ordering::Relaxed)
}

/// Consumes a pending quit request, if any.
#[inline]
pub fn take_quit() -> bool {
    QUIT.swap(false, Ordering::Relaxed)
}

#[inline]
pub fn request_terminate() {
    TERMINATE.store(true, Ordering::Relaxed);
}

#[inline]
pub fn request_quit() {
    QUIT.store(true, Ordering::Relaxed);
}
