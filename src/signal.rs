//! Graceful shutdown on SIGINT, SIGTERM and SIGHUP.
//!
//! A background thread flips a shared flag and notifies a condvar so the
//! mount-owning thread can block efficiently instead of polling. This is
//! orthogonal to the request-handling error taxonomy (§7) — it exists
//! purely to drive an orderly unmount (§5's shutdown contract).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::consts::signal::SIGHUP;
use signal_hook::flag;

/// Installs handlers for `TERM_SIGNALS` (SIGINT, SIGTERM) and SIGHUP.
///
/// `shutdown` is flipped to `true` on first signal and a waiting thread is
/// woken via the returned condvar pair. A second signal of the same kind
/// terminates the process immediately (`register_conditional_shutdown`),
/// matching the double-Ctrl+C escape hatch the mount binary this repository
/// is grounded on provides.
pub fn install_signal_handler(shutdown: Arc<AtomicBool>) -> std::io::Result<Arc<(Mutex<bool>, Condvar)>> {
    for &sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(sig, 1, Arc::clone(&shutdown))?;
        flag::register(sig, Arc::clone(&shutdown))?;
    }
    flag::register_conditional_shutdown(SIGHUP, 1, Arc::clone(&shutdown))?;
    flag::register(SIGHUP, Arc::clone(&shutdown))?;

    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    let gate_clone = Arc::clone(&gate);
    let shutdown_clone = Arc::clone(&shutdown);
    std::thread::Builder::new()
        .name("signal-monitor".into())
        .spawn(move || {
            while !shutdown_clone.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            let (lock, cvar) = &*gate_clone;
            let mut guard = lock.lock();
            *guard = true;
            cvar.notify_all();
            eprintln!("shutdown requested, unmounting...");
        })
        .map(|_| ())?;

    Ok(gate)
}

/// Blocks the calling thread until [`install_signal_handler`]'s monitor
/// thread observes a shutdown signal.
pub fn wait_for_shutdown(gate: &(Mutex<bool>, Condvar)) {
    let (lock, cvar) = gate;
    let mut guard = lock.lock();
    if !*guard {
        cvar.wait(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_starts_closed_and_wakes_on_notify() {
        let gate: Arc<(Mutex<bool>, Condvar)> = Arc::new((Mutex::new(false), Condvar::new()));
        let gate_clone = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            wait_for_shutdown(&gate_clone);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        {
            let (lock, cvar) = &*gate;
            let mut guard = lock.lock();
            *guard = true;
            cvar.notify_all();
        }
        handle.join().unwrap();
    }
}
