//! Process exit signals.
//!
//! Handlers only flip an atomic flag; the main loop polls it once per tick
//! and runs the orderly shutdown itself.

use std::sync::atomic::{AtomicBool, Ordering};

static EXIT_SIGNAL: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_exit_signal(_signum: libc::c_int) {
    EXIT_SIGNAL.store(true, Ordering::SeqCst);
}

/// Install the signal handlers.
///
/// SIGINT is always caught. SIGTERM is caught only when running under init,
/// so a stray process can still be killed from the command line. SIGHUP is
/// ignored.
pub fn install(catch_sigterm: bool) {
    unsafe {
        libc::signal(libc::SIGINT, handle_exit_signal as libc::sighandler_t);
        if catch_sigterm {
            libc::signal(libc::SIGTERM, handle_exit_signal as libc::sighandler_t);
        }
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }
}

pub fn exit_requested() -> bool {
    EXIT_SIGNAL.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_reflects_a_requested_exit() {
        assert!(!exit_requested());
        EXIT_SIGNAL.store(true, Ordering::SeqCst);
        assert!(exit_requested());
        EXIT_SIGNAL.store(false, Ordering::SeqCst);
    }
}
