use std::collections::VecDeque;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use inotify::EventMask;
use log::{debug, info, warn};
use crate::models::Error;
use crate::util::fs::subdirectories;
use super::event::WatchEvent;
use super::inotify::{EventSource, Readiness, Waker};
use super::watch_cache::WatchCache;

type Result<T> = std::result::Result<T, Error>;

/* Room for one large burst of packed records. A record is a fixed header
 * plus the child's base-name, so the actual record count per burst varies
 * with name lengths. */
const EVENT_BUFFER_LEN: usize = 128 * 1024;

/// Requests termination of a running [`DirectoryWatcher`] from any thread.
///
/// Stopping is idempotent: the flag is sticky and every call wakes the
/// blocked wait once more, which the loop absorbs without re-entering it.
pub(crate) struct StopHandle {
    stopped: Arc<AtomicBool>,
    waker: Waker
}

impl StopHandle {
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// Watches one root directory and its entire subtree, logging every
/// observed change. Owns the watch-descriptor cache, the decoded event
/// queue, the ingest buffer and the kernel-facing descriptors; everything
/// is rebuilt from scratch when the cache desynchronizes from the kernel.
pub(crate) struct DirectoryWatcher {
    root: PathBuf,
    ignored_dirs: Vec<String>,
    fds: EventSource,
    cache: WatchCache,
    queue: VecDeque<WatchEvent>,
    buffer: Vec<u8>,
    stopped: Arc<AtomicBool>
}

impl DirectoryWatcher {
    /// Eagerly watches `root` and all of its subdirectories. Fails when
    /// the root does not exist, is not a directory, carries an ignored
    /// base-name, or any watch in the initial walk cannot be established.
    pub(crate) fn new(root: &Path, ignored_dirs: &[String]) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::new(format!("'{}' does not reference a directory!", root.display())));
        }

        let mut watcher = DirectoryWatcher {
            root: root.to_path_buf(),
            ignored_dirs: ignored_dirs.to_vec(),
            fds: EventSource::open()?,
            cache: WatchCache::new(),
            queue: VecDeque::new(),
            buffer: vec![0u8; EVENT_BUFFER_LEN],
            stopped: Arc::new(AtomicBool::new(false))
        };

        if root.file_name().is_some_and(|name| watcher.is_ignored(name)) {
            return Err(Error::new(format!(
                "No watch established: the root directory '{}' is itself on the ignore list",
                root.display()
            )));
        }

        let root = watcher.root.clone();
        watcher.watch_subtree(&root)?;

        Ok(watcher)
    }

    pub(crate) fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopped: Arc::clone(&self.stopped),
            waker: self.fds.waker()
        }
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn is_ignored(&self, name: &OsStr) -> bool {
        self.ignored_dirs.iter().any(|ignored| OsStr::new(ignored) == name)
    }

    /// Runs the event loop until stopped or until an error survives
    /// recovery.
    pub(crate) fn run(&mut self) -> Result<()> {
        self.stopped.store(false, Ordering::Release);

        while !self.stopped() {
            self.run_once()?;
        }

        Ok(())
    }

    /// One loop iteration: block until records are available, then
    /// interpret the queue. The stop flag is re-checked at every step
    /// boundary, so a concurrent stop takes effect promptly even with
    /// events still queued.
    fn run_once(&mut self) -> Result<()> {
        while self.queue.is_empty() && !self.stopped() {
            match self.fds.wait_readable()? {
                Readiness::Watch => {
                    if let Err(e) = self.refill() {
                        warn!("Failed to read events from the watch source: {e}");
                        self.reinitialize()?;
                    }
                }
                Readiness::Interrupted => {} /* Loop condition re-checks the stop flag */
            }
        }

        while !self.stopped() {
            let Some(event) = self.queue.pop_front() else {
                break;
            };

            self.dispatch(event)?;
        }

        Ok(())
    }

    /// Drains one burst from the watch source into the queue, preserving
    /// kernel delivery order.
    ///
    /// Records whose mask carries IGNORED announce a watch revocation the
    /// kernel performed on its own. Watch removal is managed explicitly by
    /// the event handlers, so these records are dropped here; replaying
    /// them would oscillate the cache.
    fn refill(&mut self) -> std::io::Result<usize> {
        let events = match self.fds.drain(&mut self.buffer) {
            Ok(events) => events,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e)
        };

        let mut appended = 0;

        for event in events {
            if event.mask.contains(EventMask::IGNORED) {
                continue;
            }

            self.queue.push_back(WatchEvent::from(event));
            appended += 1;
        }

        Ok(appended)
    }

    fn dispatch(&mut self, event: WatchEvent) -> Result<()> {
        /* The watched root itself was deleted or moved away */
        if event.mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF) {
            self.stopped.store(true, Ordering::Release);
            info!("Nothing to watch.");
            return Ok(());
        }

        /* The kernel dropped records, so the cache no longer mirrors the tree */
        if event.mask.contains(EventMask::Q_OVERFLOW) {
            warn!("Event queue overflow occurred");
            return self.reinitialize();
        }

        let Some(parent) = self.cache.path_of(&event.wd).map(Path::to_path_buf) else {
            warn!("Received an event for a watch descriptor that is not in the cache");
            return self.reinitialize();
        };

        let Some(name) = event.name.as_deref() else {
            /* Child events always carry the affected base-name */
            debug!("Dropping nameless event with mask {:?}", event.mask);
            return Ok(());
        };
        let full = parent.join(name);

        if event.mask.contains(EventMask::ISDIR) {
            self.handle_directory_event(&event, &parent, &full)
        } else {
            self.handle_file_event(&event, &parent, &full)
        }
    }

    fn handle_directory_event(&mut self, event: &WatchEvent, parent: &Path, full: &Path) -> Result<()> {
        if event.mask.contains(EventMask::DELETE) {
            /* Directory removal is bottom-up, so by the time this entry's
             * DELETE arrives its descendants have already been erased by
             * their own events; the kernel revokes the descendant watches
             * itself and those IGNORED records are filtered during ingest.
             * Dropping the one cache entry is all that is left to do. */
            if let Some(wd) = self.cache.wd_of(full).cloned() {
                self.cache.erase(&wd);
                info!("Deleted directory: {}", full.display());
            }
        } else if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
            if full.file_name().is_some_and(|name| self.is_ignored(name)) {
                return Ok(());
            }

            info!("Created directory: {}", full.display());

            if let Err(e) = self.watch_subtree(full) {
                /* The subtree may have vanished again mid-walk, or the
                 * kernel refused a watch; the cache no longer mirrors it */
                warn!("Failed to watch new subtree '{}': {e}", full.display());
                self.reinitialize()?;
            }
        } else if event.mask.contains(EventMask::MOVED_FROM) {
            match self.take_matching_move_target(event.cookie) {
                Some(target) => {
                    let Some(new_parent) = self.cache.path_of(&target.wd).map(Path::to_path_buf) else {
                        warn!("Move target refers to a watch descriptor that is not in the cache");
                        return self.reinitialize();
                    };

                    let Some(new_name) = target.name.as_deref() else {
                        debug!("Dropping move pair without a target name");
                        return Ok(());
                    };
                    let new_full = new_parent.join(new_name);

                    if parent == new_parent {
                        info!("Renamed directory: {} -> {}", full.display(), new_full.display());
                    } else {
                        info!("Moved directory: {} -> {}", full.display(), new_full.display());
                    }

                    /* The kernel keeps the subtree's watches valid across
                     * in-tree moves; only the cached paths change */
                    self.cache.rewrite_prefix(full, &new_full);
                }
                None => {
                    info!("Moved out of watch directory: {}", full.display());

                    if let Err(e) = self.zap_subtree(full) {
                        warn!("Failed to revoke watches under '{}': {e}", full.display());
                        self.reinitialize()?;
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_file_event(&mut self, event: &WatchEvent, parent: &Path, full: &Path) -> Result<()> {
        if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
            info!("Created file: {}", full.display());
        } else if event.mask.contains(EventMask::DELETE) {
            info!("Deleted file: {}", full.display());
        } else if event.mask.contains(EventMask::MODIFY) {
            info!("Modified file: {}", full.display());
        } else if event.mask.contains(EventMask::MOVED_FROM) {
            match self.take_matching_move_target(event.cookie) {
                Some(target) => {
                    let Some(new_parent) = self.cache.path_of(&target.wd).map(Path::to_path_buf) else {
                        warn!("Move target refers to a watch descriptor that is not in the cache");
                        return self.reinitialize();
                    };

                    let Some(new_name) = target.name.as_deref() else {
                        debug!("Dropping move pair without a target name");
                        return Ok(());
                    };
                    let new_full = new_parent.join(new_name);

                    if parent == new_parent {
                        info!("Renamed file: {} -> {}", full.display(), new_full.display());
                    } else {
                        info!("Moved file: {} -> {}", full.display(), new_full.display());
                    }
                }
                None => {
                    info!("Moved file out of watch directory: {}", full.display());
                }
            }
        }

        Ok(())
    }

    /// Consumes and returns the queued head iff it is the MOVED_TO half of
    /// the move pair identified by `cookie`. A head that does not match,
    /// in mask bits or in cookie, stays queued and is interpreted on its
    /// own; an empty queue means the other half never made it into this
    /// burst and the move is treated as leaving the tree.
    fn take_matching_move_target(&mut self, cookie: u32) -> Option<WatchEvent> {
        let matches = self.queue.front().is_some_and(|next| {
            next.mask.contains(EventMask::MOVED_TO) && next.cookie == cookie
        });

        if matches {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Adds watches for `path` and every directory below it. The walk
    /// keeps its own stack so the ignore decision is taken before
    /// descending into a subtree rather than after.
    fn watch_subtree(&mut self, path: &Path) -> Result<()> {
        let mut dirs = vec![path.to_path_buf()];

        while let Some(dir) = dirs.pop() {
            self.add_watch(&dir)?;

            for subdir in subdirectories(&dir)? {
                let ignored = subdir.file_name().is_some_and(|name| self.is_ignored(name));

                if !ignored {
                    dirs.push(subdir);
                }
            }
        }

        debug!("Done adding watches below '{}'", path.display());
        Ok(())
    }

    fn add_watch(&mut self, path: &Path) -> Result<()> {
        /* The first watch ever taken is the root's and is the only one
         * armed for self-deletion and self-move */
        let wd = self.fds.add_watch(path, self.cache.is_empty())?;
        self.cache.insert(wd, path.to_path_buf());
        debug!("Added watch for '{}'", path.display());
        Ok(())
    }

    /// Revokes the watch and drops the cache entry for `path` and for
    /// everything below it. Used when a subtree leaves the watched tree,
    /// where the kernel-side watches stay valid and must be removed
    /// explicitly.
    fn zap_subtree(&mut self, path: &Path) -> Result<()> {
        for (wd, _) in self.cache.remove_prefix(path) {
            self.fds.remove_watch(wd)?;
        }

        Ok(())
    }

    /// Tears down and rebuilds everything kernel-facing: revokes every
    /// cached watch best-effort, recreates all three descriptors,
    /// re-watches the configured root recursively, clears the queue and
    /// zeroes the ingest buffer. Records that arrived between the
    /// inconsistency and the rebuild are lost, which matches the kernel's
    /// own contract after an overflow. A failure to re-watch the root is
    /// fatal and propagates out of [`DirectoryWatcher::run`].
    fn reinitialize(&mut self) -> Result<()> {
        info!("Cache reached inconsistent state; Reinitializing...");

        for (wd, _) in self.cache.drain_all() {
            let _ = self.fds.remove_watch(wd);
        }

        self.fds.reopen()?;

        let root = self.root.clone();
        if let Err(e) = self.watch_subtree(&root) {
            return Err(Error::new(format!(
                "Failed to rebuild watches for '{}': {}",
                root.display(),
                e.msg
            )));
        }
        debug!("Rebuilt {} watches below '{}'", self.cache.len(), root.display());

        self.queue.clear();
        self.buffer.fill(0);

        info!("Cache reached inconsistent state; Success.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;
    use std::thread;
    use std::time::Duration;
    use inotify::{Inotify, WatchMask};
    use tempfile::tempdir;

    fn watcher_for(root: &Path, ignored: &[&str]) -> DirectoryWatcher {
        let ignored: Vec<String> = ignored.iter().map(|s| s.to_string()).collect();
        DirectoryWatcher::new(root, &ignored).unwrap()
    }

    fn cached_paths(watcher: &DirectoryWatcher) -> HashSet<PathBuf> {
        watcher.cache.paths().into_iter().collect()
    }

    #[test]
    fn initial_walk_watches_subtree_and_skips_ignored() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("a/b")).unwrap();
        fs::create_dir(root.path().join(".git")).unwrap();

        let watcher = watcher_for(root.path(), &[".git"]);

        assert_eq!(
            cached_paths(&watcher),
            HashSet::from([
                root.path().to_path_buf(),
                root.path().join("a"),
                root.path().join("a/b")
            ])
        );
    }

    #[test]
    fn construction_rejects_missing_root() {
        let dir = tempdir().unwrap();
        assert!(DirectoryWatcher::new(&dir.path().join("gone"), &[]).is_err());
    }

    #[test]
    fn construction_rejects_file_root() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();

        assert!(DirectoryWatcher::new(&file, &[]).is_err());
    }

    #[test]
    fn construction_rejects_ignored_root() {
        let root = tempdir().unwrap();
        let basename = root.path().file_name().unwrap().to_str().unwrap().to_string();

        assert!(DirectoryWatcher::new(root.path(), &[basename]).is_err());
    }

    #[test]
    fn created_subtree_becomes_watched() {
        let root = tempdir().unwrap();
        let mut watcher = watcher_for(root.path(), &[]);

        fs::create_dir_all(root.path().join("d/e")).unwrap();
        fs::write(root.path().join("d/e/f"), b"").unwrap();

        watcher.run_once().unwrap();

        assert_eq!(
            cached_paths(&watcher),
            HashSet::from([
                root.path().to_path_buf(),
                root.path().join("d"),
                root.path().join("d/e")
            ])
        );
    }

    #[test]
    fn in_tree_rename_rewrites_cached_prefixes() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("d/e")).unwrap();
        let mut watcher = watcher_for(root.path(), &[]);

        fs::rename(root.path().join("d"), root.path().join("D")).unwrap();

        watcher.run_once().unwrap();

        assert_eq!(
            cached_paths(&watcher),
            HashSet::from([
                root.path().to_path_buf(),
                root.path().join("D"),
                root.path().join("D/e")
            ])
        );
    }

    #[test]
    fn move_out_of_tree_prunes_cache() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();
        fs::create_dir_all(root.path().join("d/e")).unwrap();
        let mut watcher = watcher_for(root.path(), &[]);

        fs::rename(root.path().join("d"), outside.path().join("d")).unwrap();

        watcher.run_once().unwrap();

        assert_eq!(cached_paths(&watcher), HashSet::from([root.path().to_path_buf()]));
    }

    #[test]
    fn move_into_tree_watches_subtree() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();
        fs::create_dir_all(outside.path().join("x/y")).unwrap();
        let mut watcher = watcher_for(root.path(), &[]);

        fs::rename(outside.path().join("x"), root.path().join("x")).unwrap();

        watcher.run_once().unwrap();

        assert_eq!(
            cached_paths(&watcher),
            HashSet::from([
                root.path().to_path_buf(),
                root.path().join("x"),
                root.path().join("x/y")
            ])
        );
    }

    #[test]
    fn ignored_directory_is_never_watched() {
        let root = tempdir().unwrap();
        let mut watcher = watcher_for(root.path(), &[".git"]);

        fs::create_dir(root.path().join(".git")).unwrap();
        fs::write(root.path().join(".git/HEAD"), b"ref").unwrap();

        watcher.run_once().unwrap();

        assert_eq!(cached_paths(&watcher), HashSet::from([root.path().to_path_buf()]));
    }

    #[test]
    fn deleted_directory_is_erased_from_cache() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("d")).unwrap();
        let mut watcher = watcher_for(root.path(), &[]);

        fs::remove_dir(root.path().join("d")).unwrap();

        watcher.run_once().unwrap();

        assert_eq!(cached_paths(&watcher), HashSet::from([root.path().to_path_buf()]));
    }

    #[test]
    fn root_deletion_terminates_run_cleanly() {
        let root = tempdir().unwrap();
        let mut watcher = watcher_for(root.path(), &[]);

        fs::remove_dir(root.path()).unwrap();

        assert!(watcher.run().is_ok());
        assert!(watcher.stopped());
    }

    #[test]
    fn stop_interrupts_a_blocked_run() {
        let root = tempdir().unwrap();
        let mut watcher = watcher_for(root.path(), &[]);
        let handle = watcher.stop_handle();

        let worker = thread::spawn(move || watcher.run());

        thread::sleep(Duration::from_millis(100));
        handle.stop();
        /* Stopping again must be harmless */
        handle.stop();

        /* Re-issue in case the worker had not entered run() yet when the
         * first stop landed; run() resets the flag on entry */
        while !worker.is_finished() {
            handle.stop();
            thread::sleep(Duration::from_millis(10));
        }

        assert!(worker.join().unwrap().is_ok());
    }

    #[test]
    fn overflow_rebuilds_cache_from_scratch() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("a/b")).unwrap();
        let mut watcher = watcher_for(root.path(), &[]);
        let before = cached_paths(&watcher);

        let wd = watcher.cache.wd_of(root.path()).unwrap().clone();
        watcher.queue.push_back(WatchEvent {
            wd,
            mask: EventMask::Q_OVERFLOW,
            cookie: 0,
            name: None
        });

        watcher.run_once().unwrap();

        assert_eq!(cached_paths(&watcher), before);
        assert!(watcher.queue.is_empty());
    }

    #[test]
    fn unknown_descriptor_rebuilds_cache_from_scratch() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("a")).unwrap();
        let mut watcher = watcher_for(root.path(), &[]);
        let before = cached_paths(&watcher);

        /* A descriptor minted by an unrelated instance can never be in the cache */
        let foreign_dir = tempdir().unwrap();
        let mut foreign = Inotify::init().unwrap();
        let foreign_wd = foreign.watches().add(foreign_dir.path(), WatchMask::CREATE).unwrap();

        watcher.queue.push_back(WatchEvent {
            wd: foreign_wd,
            mask: EventMask::CREATE,
            cookie: 0,
            name: Some("x.txt".into())
        });

        watcher.run_once().unwrap();

        assert_eq!(cached_paths(&watcher), before);
    }

    #[test]
    fn matching_cookie_pairs_rename_and_rewrites() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("a/c")).unwrap();
        let mut watcher = watcher_for(root.path(), &[]);
        let root_wd = watcher.cache.wd_of(root.path()).unwrap().clone();

        watcher.queue.push_back(WatchEvent {
            wd: root_wd.clone(),
            mask: EventMask::MOVED_FROM | EventMask::ISDIR,
            cookie: 9,
            name: Some("a".into())
        });
        watcher.queue.push_back(WatchEvent {
            wd: root_wd,
            mask: EventMask::MOVED_TO | EventMask::ISDIR,
            cookie: 9,
            name: Some("b".into())
        });

        watcher.run_once().unwrap();

        assert_eq!(
            cached_paths(&watcher),
            HashSet::from([
                root.path().to_path_buf(),
                root.path().join("b"),
                root.path().join("b/c")
            ])
        );
        assert!(watcher.queue.is_empty());
    }

    #[test]
    fn unrelated_follower_is_not_consumed() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("a")).unwrap();
        let mut watcher = watcher_for(root.path(), &[]);
        let root_wd = watcher.cache.wd_of(root.path()).unwrap().clone();
        let a_wd = watcher.cache.wd_of(&root.path().join("a")).unwrap().clone();

        watcher.queue.push_back(WatchEvent {
            wd: root_wd.clone(),
            mask: EventMask::MOVED_FROM | EventMask::ISDIR,
            cookie: 7,
            name: Some("a".into())
        });
        watcher.queue.push_back(WatchEvent {
            wd: root_wd,
            mask: EventMask::CREATE,
            cookie: 0,
            name: Some("x.txt".into())
        });

        watcher.run_once().unwrap();

        /* The unpaired move-from zaps 'a'; the follower is interpreted on
         * its own instead of being swallowed by the pairing */
        assert!(!watcher.cache.contains(&a_wd));
        assert_eq!(cached_paths(&watcher), HashSet::from([root.path().to_path_buf()]));
        assert!(watcher.queue.is_empty());
    }

    #[test]
    fn move_target_with_different_cookie_is_not_paired() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("a")).unwrap();
        fs::create_dir_all(root.path().join("b/c")).unwrap();
        let mut watcher = watcher_for(root.path(), &[]);
        let root_wd = watcher.cache.wd_of(root.path()).unwrap().clone();
        let a_wd = watcher.cache.wd_of(&root.path().join("a")).unwrap().clone();

        watcher.queue.push_back(WatchEvent {
            wd: root_wd.clone(),
            mask: EventMask::MOVED_FROM | EventMask::ISDIR,
            cookie: 1,
            name: Some("a".into())
        });
        watcher.queue.push_back(WatchEvent {
            wd: root_wd,
            mask: EventMask::MOVED_TO | EventMask::ISDIR,
            cookie: 2,
            name: Some("b".into())
        });

        watcher.run_once().unwrap();

        /* Had the follower been consumed as the pair's second half, 'a's
         * descriptor would still be cached under the rewritten path */
        assert!(!watcher.cache.contains(&a_wd));
        assert_eq!(
            cached_paths(&watcher),
            HashSet::from([
                root.path().to_path_buf(),
                root.path().join("b"),
                root.path().join("b/c")
            ])
        );
        assert!(watcher.queue.is_empty());
    }
}
