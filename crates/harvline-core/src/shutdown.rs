//! Graceful shutdown between work units

use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag, set by SIGTERM/SIGINT
pub fn shutdown_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

/// Checked by the harvest loop before each unit
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    shutdown_flag().store(true, Ordering::Relaxed);
}

/// First SIGINT/SIGTERM finishes the in-flight unit and stops; a second one
/// exits immediately. Every record already appended is synced, so the next
/// run resumes from the store.
pub fn install_signal_handlers() -> std::io::Result<()> {
    for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        // SAFETY: AtomicBool::swap and low_level::exit (`_exit`) are async-signal-safe
        unsafe {
            signal_hook::low_level::register(sig, || {
                if shutdown_flag().swap(true, Ordering::Relaxed) {
                    signal_hook::low_level::exit(130);
                }
            })?;
        }
    }
    Ok(())
}
