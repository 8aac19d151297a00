use std::thread;
use std::time::Duration;
use log::info;
use crate::linux::signals::{install_signal_handlers, sigint_received};
use crate::linux::watcher::DirectoryWatcher;
use crate::models::{Error, WatchConfig};

pub(self) mod event;
pub(self) mod inotify;
pub(self) mod signals;
pub(self) mod watch_cache;
pub(self) mod watcher;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runs the watcher on a worker thread until either SIGINT arrives or the
/// loop terminates on its own (e.g. because the watched root disappeared).
pub(crate) fn run_fs_listener(config: WatchConfig) -> Result<(), Error> {

    install_signal_handlers()?;

    let mut watcher = DirectoryWatcher::new(&config.root, &config.ignored_dirs)?;
    let stop = watcher.stop_handle();

    info!("Watching directory: {}", config.root.display());
    info!("Press Ctrl+C to stop");

    let worker = thread::spawn(move || watcher.run());

    while !sigint_received() && !worker.is_finished() {
        thread::sleep(SHUTDOWN_POLL_INTERVAL);
    }

    // Harmless when the worker already terminated by itself
    stop.stop();

    match worker.join() {
        Ok(result) => result,
        Err(_) => Err(Error::new("Watcher thread panicked"))
    }
}
