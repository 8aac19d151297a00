use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::{Arc, Mutex};
use inotify::{Events, Inotify, WatchDescriptor, WatchMask};
use log::debug;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use crate::models::Error;

type Result<T> = std::result::Result<T, Error>;

/* Only one slot is needed since a single readable descriptor is enough to
 * decide between draining events and re-checking the stop flag. */
const MAX_EPOLL_EVENTS: usize = 1;

const WATCH_TOKEN: u64 = 0;
const INTERRUPT_TOKEN: u64 = 1;

fn watch_mask(root: bool) -> WatchMask {
    let mut mask = WatchMask::MODIFY |
        WatchMask::CREATE |
        WatchMask::DELETE |
        WatchMask::MOVE |
        // Watches are only placed on directories; ONLYDIR makes the kernel
        // reject anything else, and symbolic links are never followed.
        WatchMask::DONT_FOLLOW |
        WatchMask::ONLYDIR;

    if root {
        // Only the root watch needs to report its own removal; for every
        // other directory the parent watch already reports the non-self event.
        mask |= WatchMask::DELETE_SELF | WatchMask::MOVE_SELF;
    }

    mask
}

/// Outcome of waiting on the multiplexed descriptors.
pub(super) enum Readiness {
    Watch,
    Interrupted
}

/// Wakes a blocked [`EventSource::wait_readable`] call from another thread.
#[derive(Clone)]
pub(crate) struct Waker {
    interrupt: Arc<Mutex<EventFd>>
}

impl Waker {
    /// A single write of a nonzero value guarantees one wakeup. The counter
    /// is never drained: after a wakeup the loop either observes the stop
    /// flag and exits, or the descriptor is replaced wholesale on recovery.
    pub(crate) fn wake(&self) {
        let interrupt = self.interrupt.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Err(e) = interrupt.write(1) {
            debug!("Failed to signal the interrupt descriptor: {e}");
        }
    }
}

/// The kernel-side event plumbing: the inotify instance that accumulates
/// file-change records, the eventfd used to interrupt a blocked wait, and
/// the epoll instance multiplexing readiness of the two.
pub(super) struct EventSource {
    inotify: Inotify,
    epoll: Epoll,
    interrupt: Arc<Mutex<EventFd>>
}

impl EventSource {
    pub(super) fn open() -> Result<Self> {
        let (inotify, epoll, interrupt) = Self::open_fds()?;

        Ok(EventSource {
            inotify,
            epoll,
            interrupt: Arc::new(Mutex::new(interrupt))
        })
    }

    /// Rebuilds all three descriptors in place. The replacement eventfd is
    /// installed into the shared interrupt slot so that wakers handed out
    /// before the rebuild keep working; the old descriptors are closed when
    /// they are dropped here.
    pub(super) fn reopen(&mut self) -> Result<()> {
        let (inotify, epoll, interrupt) = Self::open_fds()?;

        self.inotify = inotify;
        self.epoll = epoll;

        let mut slot = self.interrupt.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = interrupt;

        Ok(())
    }

    fn open_fds() -> Result<(Inotify, Epoll, EventFd)> {
        let inotify = Inotify::init().map_err(|e| {
            Error::new(format!("Failed to create inotify instance: {e}"))
        })?;

        let interrupt = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(|e| Error::new(format!("Failed to create interrupt descriptor: {e}")))?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| {
            Error::new(format!("Failed to create epoll instance: {e}"))
        })?;

        // The inotify crate only exposes the raw descriptor; it stays owned
        // by the instance for the duration of the borrow.
        let inotify_fd = unsafe { BorrowedFd::borrow_raw(inotify.as_raw_fd()) };
        epoll.add(inotify_fd, EpollEvent::new(EpollFlags::EPOLLIN, WATCH_TOKEN))
            .map_err(|e| Error::new(format!("Failed to register inotify descriptor with epoll: {e}")))?;

        epoll.add(interrupt.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, INTERRUPT_TOKEN))
            .map_err(|e| Error::new(format!("Failed to register interrupt descriptor with epoll: {e}")))?;

        Ok((inotify, epoll, interrupt))
    }

    pub(super) fn waker(&self) -> Waker {
        Waker { interrupt: Arc::clone(&self.interrupt) }
    }

    /// Registers `path` with the kernel. Re-adding an already watched path
    /// returns the existing descriptor; the kernel does not treat it as an
    /// error and neither does the caller.
    pub(super) fn add_watch(&mut self, path: &Path, root: bool) -> Result<WatchDescriptor> {
        self.inotify
            .watches()
            .add(path, watch_mask(root))
            .map_err(|e| Error::new(format!("Failed to register watch for '{}': {e}", path.display())))
    }

    pub(super) fn remove_watch(&mut self, wd: WatchDescriptor) -> Result<()> {
        self.inotify
            .watches()
            .remove(wd)
            .map_err(|e| Error::new(format!("Failed to remove watch: {e}")))
    }

    /// Blocks until the watch source has readable data or the interrupt
    /// descriptor has been signalled. EINTR counts as an interrupt so the
    /// caller re-checks its stop flag instead of dying on a stray signal.
    pub(super) fn wait_readable(&self) -> Result<Readiness> {
        let mut ready = [EpollEvent::empty(); MAX_EPOLL_EVENTS];

        let triggered = match self.epoll.wait(&mut ready, EpollTimeout::NONE) {
            Ok(triggered) => triggered,
            Err(Errno::EINTR) => return Ok(Readiness::Interrupted),
            Err(e) => {
                return Err(Error::new(format!("Failed to wait for readable descriptors: {e}")));
            }
        };

        if triggered > 0 && ready[0].data() == WATCH_TOKEN {
            return Ok(Readiness::Watch);
        }

        Ok(Readiness::Interrupted)
    }

    /// Reads one burst of tightly packed event records into `buffer`.
    /// Records are atomic, so a partial read cannot occur; `WouldBlock`
    /// means the burst was empty.
    pub(super) fn drain<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<Events<'a>> {
        self.inotify.read_events(buffer)
    }
}
