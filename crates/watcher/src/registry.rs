//! Watch registry
//!
//! The registry owns the set of watched paths and their masks. Every change
//! is applied to the event source before the call returns, so it is visible
//! to the next poll cycle of the dispatch loop.
//!
//! Locking: writers take the source mutex first and the entry table second.
//! Readers only take the entry table's read lock.

use crate::source::EventSource;
use fanwatch_core::{EventMask, MarkError};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event source shared between the registry and the dispatch loop
pub type SharedSource<S> = Arc<Mutex<S>>;

/// Opaque handle assigned to a watch when it is first added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchDescriptor(u64);

impl WatchDescriptor {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd{}", self.0)
    }
}

/// A watched path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub path: PathBuf,
    /// Union of every mask requested while active
    pub mask: EventMask,
    pub descriptor: WatchDescriptor,
    /// False once the watched object has disappeared
    pub active: bool,
    pub recursive: bool,
}

/// Owner of the watch set
pub struct WatchRegistry<S> {
    source: SharedSource<S>,
    entries: RwLock<BTreeMap<PathBuf, WatchEntry>>,
    next_descriptor: AtomicU64,
}

impl<S: EventSource> WatchRegistry<S> {
    /// Take ownership of a source
    pub fn new(source: S) -> Self {
        Self::with_shared(Arc::new(Mutex::new(source)))
    }

    /// Use a source that is already shared
    pub fn with_shared(source: SharedSource<S>) -> Self {
        Self {
            source,
            entries: RwLock::new(BTreeMap::new()),
            next_descriptor: AtomicU64::new(1),
        }
    }

    /// The shared source, for handing to the dispatch loop
    pub fn source(&self) -> SharedSource<S> {
        Arc::clone(&self.source)
    }

    /// Watch `path` for `mask`, widening any existing watch on it
    pub fn add_watch(
        &self,
        path: impl AsRef<Path>,
        mask: EventMask,
        recursive: bool,
    ) -> Result<WatchEntry, MarkError> {
        let path = normalize(path.as_ref());

        let mut requested = mask;
        if recursive {
            requested |= EventMask::recursive_flags();
        }
        if !requested.is_requestable() {
            return Err(MarkError::Unsupported(mask));
        }

        let mut source = self.source.lock();
        let mut entries = self.entries.write();

        let existing = entries.get(&path).filter(|entry| entry.active);
        let union = match existing {
            Some(entry) => entry.mask | requested,
            None => requested,
        };
        let recursive = recursive || existing.map_or(false, |entry| entry.recursive);

        // Nothing in the table changes unless the kernel accepted the mark
        source.mark(&path, union, recursive)?;

        let entry = match entries.get_mut(&path) {
            Some(entry) => {
                // An inactive entry restarts from the requested mask
                entry.active = true;
                entry.mask = union;
                entry.recursive = recursive;
                entry.clone()
            }
            None => {
                let entry = WatchEntry {
                    path: path.clone(),
                    mask: union,
                    descriptor: WatchDescriptor(self.next_descriptor.fetch_add(1, Ordering::Relaxed)),
                    active: true,
                    recursive,
                };
                entries.insert(path.clone(), entry.clone());
                entry
            }
        };

        info!(
            path = %entry.path.display(),
            wd = %entry.descriptor,
            mask = %entry.mask,
            recursive = entry.recursive,
            "Watch added"
        );
        Ok(entry)
    }

    /// Stop watching `path`. Unknown paths are a no-op.
    pub fn remove_watch(&self, path: impl AsRef<Path>) -> Result<(), MarkError> {
        let path = normalize(path.as_ref());

        let mut source = self.source.lock();
        let mut entries = self.entries.write();

        if !entries.contains_key(&path) {
            debug!(path = %path.display(), "Remove of unknown watch ignored");
            return Ok(());
        }

        match source.unmark(&path) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Watch removal failed");
                return Err(err);
            }
        }

        entries.remove(&path);
        info!(path = %path.display(), "Watch removed");
        Ok(())
    }

    /// Snapshot of active watches, ordered by path
    pub fn list_active(&self) -> Vec<WatchEntry> {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.active)
            .cloned()
            .collect()
    }

    /// Snapshot of every watch, including inactive ones
    pub fn list_all(&self) -> Vec<WatchEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Entry for `path`, if watched
    pub fn get(&self, path: impl AsRef<Path>) -> Option<WatchEntry> {
        self.entries.read().get(&normalize(path.as_ref())).cloned()
    }

    /// Number of active watches
    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|entry| entry.active).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every watch and close the source
    pub fn teardown(&self) {
        let mut source = self.source.lock();
        let mut entries = self.entries.write();

        if !source.is_closed() {
            for path in entries.keys() {
                if let Err(err) = source.unmark(path) {
                    debug!(path = %path.display(), error = %err, "Unmark during teardown failed");
                }
            }
            source.close();
        }
        entries.clear();
        info!("Watch registry torn down");
    }

    /// Locked access for reconciliation: source first, entries second
    pub(crate) fn with_locked<T>(
        &self,
        f: impl FnOnce(&mut S, &mut BTreeMap<PathBuf, WatchEntry>) -> T,
    ) -> T {
        let mut source = self.source.lock();
        let mut entries = self.entries.write();
        f(&mut source, &mut entries)
    }
}

/// Lexical normalization: drops `.` components and trailing separators and
/// resolves `..` against preceding components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedSource;

    fn registry(source: ScriptedSource) -> WatchRegistry<ScriptedSource> {
        WatchRegistry::new(source)
    }

    #[test]
    fn test_add_watch_is_idempotent() {
        let registry = registry(ScriptedSource::new());

        let first = registry.add_watch("/data", EventMask::CREATE, false).unwrap();
        let second = registry.add_watch("/data", EventMask::CREATE, false).unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.source().lock().mark_of(Path::new("/data")),
            Some(EventMask::CREATE)
        );
    }

    #[test]
    fn test_masks_union() {
        let registry = registry(ScriptedSource::new());

        registry.add_watch("/data", EventMask::CREATE, false).unwrap();
        let entry = registry.add_watch("/data/", EventMask::MODIFY, false).unwrap();

        assert_eq!(entry.mask, EventMask::CREATE | EventMask::MODIFY);
        assert_eq!(registry.list_active().len(), 1);
    }

    #[test]
    fn test_recursive_sets_propagation_flags() {
        let registry = registry(ScriptedSource::new());

        let entry = registry.add_watch("/srv", EventMask::content(), true).unwrap();

        assert!(entry.mask.contains(EventMask::ONDIR | EventMask::EVENT_ON_CHILD));
        assert!(entry.recursive);
    }

    #[test]
    fn test_mark_limit_leaves_registry_unchanged() {
        let registry = registry(ScriptedSource::new().with_mark_limit(1));
        registry.add_watch("/a", EventMask::MODIFY, false).unwrap();

        let before = registry.list_all();
        let err = registry.add_watch("/b", EventMask::MODIFY, false).unwrap_err();

        assert!(matches!(err, MarkError::MarkLimitExceeded(_)));
        assert_eq!(registry.list_all(), before);
        assert!(registry.get("/b").is_none());
    }

    #[test]
    fn test_failed_widen_keeps_old_mask() {
        let registry = registry(ScriptedSource::new().without_names());
        registry.add_watch("/a", EventMask::MODIFY, false).unwrap();

        let err = registry.add_watch("/a", EventMask::CREATE, false).unwrap_err();

        assert!(matches!(err, MarkError::Unsupported(_)));
        assert_eq!(registry.get("/a").unwrap().mask, EventMask::MODIFY);
    }

    #[test]
    fn test_empty_and_report_only_masks_rejected() {
        let registry = registry(ScriptedSource::new());

        assert!(matches!(
            registry.add_watch("/a", EventMask::empty(), false),
            Err(MarkError::Unsupported(_))
        ));
        assert!(matches!(
            registry.add_watch("/a", EventMask::QUEUE_OVERFLOW, false),
            Err(MarkError::Unsupported(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_permission_denied_only_affects_that_path() {
        let registry = registry(ScriptedSource::new().deny("/root"));

        assert!(matches!(
            registry.add_watch("/root", EventMask::MODIFY, false),
            Err(MarkError::PermissionDenied(_))
        ));
        registry.add_watch("/home", EventMask::MODIFY, false).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_watch_is_idempotent() {
        let registry = registry(ScriptedSource::new());
        registry.add_watch("/data", EventMask::MODIFY, false).unwrap();

        registry.remove_watch("/data").unwrap();
        registry.remove_watch("/data").unwrap();
        registry.remove_watch("/never").unwrap();

        assert!(registry.is_empty());
        assert!(registry.source().lock().marked_paths().is_empty());
    }

    #[test]
    fn test_failed_remove_keeps_watch_until_retry_succeeds() {
        let registry = registry(ScriptedSource::new().fail_unmark("/data", 1));
        registry.add_watch("/data", EventMask::MODIFY, false).unwrap();

        let err = registry.remove_watch("/data").unwrap_err();
        assert!(matches!(err, MarkError::PermissionDenied(_)));
        assert!(registry.get("/data").unwrap().active);
        assert_eq!(
            registry.source().lock().mark_of(Path::new("/data")),
            Some(EventMask::MODIFY)
        );

        registry.remove_watch("/data").unwrap();
        assert!(registry.get("/data").is_none());
        assert!(registry.source().lock().marked_paths().is_empty());
    }

    #[test]
    fn test_descriptors_are_distinct() {
        let registry = registry(ScriptedSource::new());
        let a = registry.add_watch("/a", EventMask::MODIFY, false).unwrap();
        let b = registry.add_watch("/b", EventMask::MODIFY, false).unwrap();

        assert!(a.descriptor < b.descriptor);
    }

    #[test]
    fn test_teardown_closes_source() {
        let registry = registry(ScriptedSource::new());
        registry.add_watch("/a", EventMask::MODIFY, false).unwrap();

        registry.teardown();

        assert!(registry.is_empty());
        assert!(registry.source().lock().is_closed());
    }

    #[test]
    fn test_random_sequences_match_model() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let paths = ["/a", "/b", "/a/x", "/denied", "/c/"];
        let masks = [
            EventMask::CREATE,
            EventMask::DELETE,
            EventMask::MODIFY,
            EventMask::CLOSE_WRITE,
            EventMask::ACCESS,
        ];

        for seed in 0..16u64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let registry = registry(ScriptedSource::new().deny("/denied"));
            let mut model: BTreeMap<PathBuf, (EventMask, bool)> = BTreeMap::new();

            for step in 0..200 {
                let path = paths[rng.gen_range(0..paths.len())];
                let key = normalize(Path::new(path));

                if rng.gen_ratio(2, 3) {
                    let mut mask = EventMask::empty();
                    for candidate in masks {
                        if rng.gen_bool(0.4) {
                            mask |= candidate;
                        }
                    }
                    if mask.is_empty() {
                        mask = EventMask::MODIFY;
                    }
                    let recursive = rng.gen_bool(0.2);

                    let result = registry.add_watch(path, mask, recursive);
                    if path == "/denied" {
                        assert!(result.is_err(), "seed {} step {}", seed, step);
                    } else {
                        let mut requested = mask;
                        if recursive {
                            requested |= EventMask::recursive_flags();
                        }
                        let slot = model.entry(key).or_insert((EventMask::empty(), false));
                        slot.0 |= requested;
                        slot.1 |= recursive;
                        assert_eq!(result.unwrap().mask, slot.0, "seed {} step {}", seed, step);
                    }
                } else {
                    registry.remove_watch(path).unwrap();
                    model.remove(&key);
                }

                let active: Vec<(PathBuf, EventMask, bool)> = registry
                    .list_active()
                    .into_iter()
                    .map(|entry| (entry.path, entry.mask, entry.recursive))
                    .collect();
                let expected: Vec<(PathBuf, EventMask, bool)> = model
                    .iter()
                    .map(|(path, (mask, recursive))| (path.clone(), *mask, *recursive))
                    .collect();
                assert_eq!(active, expected, "seed {} step {}", seed, step);

                let source = registry.source();
                let source = source.lock();
                assert_eq!(
                    source.marked_paths(),
                    model.keys().cloned().collect::<Vec<_>>(),
                    "seed {} step {}",
                    seed,
                    step
                );
                for (path, (mask, _)) in &model {
                    assert_eq!(source.mark_of(path), Some(*mask), "seed {} step {}", seed, step);
                }
            }
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/data/./x/../y/")), PathBuf::from("/data/y"));
        assert_eq!(normalize(Path::new("/data")), PathBuf::from("/data"));
    }
}
