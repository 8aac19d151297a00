use std::sync::atomic::{AtomicBool, Ordering};
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use crate::models::Error;

static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn sigint_handler(_sig: libc::c_int) {
    SIGINT_RECEIVED.store(true, Ordering::SeqCst);
}

pub(super) fn sigint_received() -> bool {
    SIGINT_RECEIVED.load(Ordering::SeqCst)
}

pub(super) fn install_signal_handlers() -> Result<(), Error> {

    // The SA_RESTART flag stays un-set so that a SIGINT arriving while the
    // shutdown poll sleeps interrupts the syscall instead of restarting it.
    let sigint_action = SigAction::new(
        SigHandler::Handler(sigint_handler), SaFlags::empty(), SigSet::empty()
    );

    unsafe {
        sigaction(Signal::SIGINT, &sigint_action).map_err(|e| {
            Error::new(format!("Unable to install SIGINT handler: {e}"))
        })?;
    }

    Ok(())
}
