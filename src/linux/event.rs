use std::ffi::{OsStr, OsString};
use inotify::{Event, EventMask, WatchDescriptor};

/// A single decoded change record, owned so it can sit in the event queue
/// across read bursts.
///
/// `name` is the base-name of the affected child, relative to the directory
/// the record's watch descriptor points at; it is absent for self-events
/// and queue-overflow records. `cookie` is nonzero only for the two halves
/// of a move pair.
#[derive(Debug, Clone)]
pub(super) struct WatchEvent {
    pub(super) wd: WatchDescriptor,
    pub(super) mask: EventMask,
    pub(super) cookie: u32,
    pub(super) name: Option<OsString>
}

impl From<Event<&OsStr>> for WatchEvent {
    fn from(event: Event<&OsStr>) -> Self {
        WatchEvent {
            wd: event.wd,
            mask: event.mask,
            cookie: event.cookie,
            name: event.name.map(OsStr::to_os_string)
        }
    }
}
