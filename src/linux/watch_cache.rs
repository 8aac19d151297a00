use std::collections::HashMap;
use std::path::{Path, PathBuf};
use inotify::WatchDescriptor;

/// The authoritative mapping between kernel watch descriptors and the
/// absolute directory paths they were registered for, with a reverse map so
/// both directions resolve in constant time. Both maps are always updated
/// together.
///
/// The cache itself never talks to the kernel: callers removing entries are
/// handed the affected descriptors and issue the watch removals themselves.
pub(super) struct WatchCache {
    wd_to_path: HashMap<WatchDescriptor, PathBuf>,
    path_to_wd: HashMap<PathBuf, WatchDescriptor>
}

/// Prefix membership uses component-wise comparison, so `/foo` is a prefix
/// of `/foo` and `/foo/bar` but never of `/foobar`.
fn in_subtree(path: &Path, prefix: &Path) -> bool {
    path.starts_with(prefix)
}

impl WatchCache {
    pub(super) fn new() -> Self {
        WatchCache {
            wd_to_path: HashMap::new(),
            path_to_wd: HashMap::new()
        }
    }

    pub(super) fn insert(&mut self, wd: WatchDescriptor, path: PathBuf) {
        self.wd_to_path.insert(wd.clone(), path.clone());
        self.path_to_wd.insert(path, wd);
    }

    pub(super) fn erase(&mut self, wd: &WatchDescriptor) -> Option<PathBuf> {
        let path = self.wd_to_path.remove(wd)?;
        self.path_to_wd.remove(&path);
        Some(path)
    }

    pub(super) fn contains(&self, wd: &WatchDescriptor) -> bool {
        self.wd_to_path.contains_key(wd)
    }

    pub(super) fn path_of(&self, wd: &WatchDescriptor) -> Option<&Path> {
        self.wd_to_path.get(wd).map(PathBuf::as_path)
    }

    pub(super) fn wd_of(&self, path: &Path) -> Option<&WatchDescriptor> {
        self.path_to_wd.get(path)
    }

    pub(super) fn is_empty(&self) -> bool {
        self.wd_to_path.is_empty()
    }

    pub(super) fn len(&self) -> usize {
        self.wd_to_path.len()
    }

    /// All cached paths, unordered. Primarily for state assertions.
    #[cfg(test)]
    pub(super) fn paths(&self) -> Vec<PathBuf> {
        self.path_to_wd.keys().cloned().collect()
    }

    /// The subtree rooted at `old_prefix` was renamed or moved to
    /// `new_prefix` without leaving the watched tree. The kernel keeps the
    /// watches valid across such moves, so only the cached paths change:
    /// every entry equal to `old_prefix` or below it has that prefix
    /// substituted in place.
    pub(super) fn rewrite_prefix(&mut self, old_prefix: &Path, new_prefix: &Path) {
        let affected: Vec<PathBuf> = self
            .path_to_wd
            .keys()
            .filter(|path| in_subtree(path, old_prefix))
            .cloned()
            .collect();

        for path in affected {
            if let Some(wd) = self.path_to_wd.remove(&path) {
                let rewritten = match path.strip_prefix(old_prefix) {
                    Ok(suffix) if suffix.as_os_str().is_empty() => new_prefix.to_path_buf(),
                    Ok(suffix) => new_prefix.join(suffix),
                    Err(_) => path
                };

                self.wd_to_path.insert(wd.clone(), rewritten.clone());
                self.path_to_wd.insert(rewritten, wd);
            }
        }
    }

    /// Drops every entry whose path is `prefix` or below it and returns the
    /// removed pairs so the caller can revoke the kernel watches.
    pub(super) fn remove_prefix(&mut self, prefix: &Path) -> Vec<(WatchDescriptor, PathBuf)> {
        let doomed: Vec<PathBuf> = self
            .path_to_wd
            .keys()
            .filter(|path| in_subtree(path, prefix))
            .cloned()
            .collect();

        let mut removed = vec![];

        for path in doomed {
            if let Some(wd) = self.path_to_wd.remove(&path) {
                self.wd_to_path.remove(&wd);
                removed.push((wd, path));
            }
        }

        removed
    }

    /// Empties the cache, returning every pair for kernel-side cleanup.
    pub(super) fn drain_all(&mut self) -> Vec<(WatchDescriptor, PathBuf)> {
        self.path_to_wd.clear();
        self.wd_to_path.drain().collect()
    }
}
