//! fanotify-backed event source (Linux)

use crate::resolve::{FileHandle, PathResolver};
use crate::source::{Capabilities, EventSource, ReadOutcome, Readiness, SourceOptions};
use crate::sys::*;
use ahash::AHashMap;
use fanwatch_core::{EventMask, MarkError, ProcessInfo, SourceError};
use nix::errno::Errno;
use nix::unistd::{self, Uid, User};
use parking_lot::{Mutex, RwLock};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Descriptors for marked roots, used as mount references when resolving
/// file handles
type MountRoots = Arc<RwLock<Vec<(PathBuf, OwnedFd)>>>;

/// What was marked for one requested path
#[derive(Debug, Default)]
struct MarkState {
    canonical: PathBuf,
    mask: EventMask,
    /// Every directory actually marked, the root first
    expanded: Vec<PathBuf>,
}

/// A fanotify notification group
pub struct FanotifySource {
    fd: Option<OwnedFd>,
    capabilities: Capabilities,
    marks: AHashMap<PathBuf, MarkState>,
    roots: MountRoots,
}

impl FanotifySource {
    /// Create the notification group.
    ///
    /// Name reporting is requested first; kernels that reject it get a
    /// group without it, and events needing names become unsupported.
    pub fn open(options: &SourceOptions) -> Result<Self, SourceError> {
        let event_flags = (libc::O_RDONLY | libc::O_LARGEFILE | libc::O_CLOEXEC) as u32;

        if options.request_names {
            match init(INIT_FLAGS | FAN_REPORT_DFID_NAME, event_flags) {
                Ok(fd) => return Ok(Self::with_fd(fd, group_capabilities(true))),
                Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
                    warn!("Kernel does not support name reporting, directory entry events disabled");
                }
                Err(err) => return Err(unavailable(err)),
            }
        }

        let fd = init(INIT_FLAGS, event_flags).map_err(unavailable)?;
        Ok(Self::with_fd(fd, group_capabilities(false)))
    }

    fn with_fd(fd: OwnedFd, capabilities: Capabilities) -> Self {
        info!(
            fd = fd.as_raw_fd(),
            report_names = capabilities.report_names,
            "Opened fanotify group"
        );
        Self {
            fd: Some(fd),
            capabilities,
            marks: AHashMap::new(),
            roots: Arc::new(RwLock::new(Vec::new())),
        }
    }

    fn group_fd(&self) -> Result<RawFd, MarkError> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd).ok_or(MarkError::Closed)
    }

    fn register_root(&self, canonical: &Path) {
        let mut roots = self.roots.write();
        if roots.iter().any(|(path, _)| path == canonical) {
            return;
        }
        match File::open(canonical) {
            Ok(file) => roots.push((canonical.to_path_buf(), OwnedFd::from(file))),
            Err(err) => debug!(
                path = %canonical.display(),
                error = %err,
                "Cannot hold mount reference, handle resolution may fail"
            ),
        }
    }

    fn release_root(&self, canonical: &Path) {
        self.roots.write().retain(|(path, _)| path != canonical);
    }
}

impl EventSource for FanotifySource {
    type Resolver = ProcResolver;

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn mark(&mut self, path: &Path, mask: EventMask, recursive: bool) -> Result<(), MarkError> {
        let group = self.group_fd()?;

        if !mask.is_requestable() {
            return Err(MarkError::Unsupported(mask));
        }
        if mask.requires_name_reporting() && !self.capabilities.report_names {
            return Err(MarkError::Unsupported(mask));
        }

        let canonical = path
            .canonicalize()
            .map_err(|err| MarkError::from_os(path.to_path_buf(), mask, err))?;

        let mut targets = vec![canonical.clone()];
        if recursive && canonical.is_dir() {
            targets.extend(
                WalkDir::new(&canonical)
                    .follow_links(false)
                    .min_depth(1)
                    .into_iter()
                    .filter_map(Result::ok)
                    .filter(|entry| entry.file_type().is_dir())
                    .map(|entry| entry.into_path()),
            );
        }

        let previous = self.marks.get(path);
        let mut added = Vec::new();

        for target in &targets {
            match mark_raw(group, FAN_MARK_ADD, mask, target) {
                Ok(()) => added.push(target.clone()),
                // Sub-directory removed while walking
                Err(err) if target != &canonical && err.is_not_found() => {
                    debug!(path = %target.display(), "Skipping vanished sub-directory");
                }
                Err(err) => {
                    for done in &added {
                        let fresh = match previous {
                            Some(state) if state.expanded.contains(done) => {
                                mask.difference(state.mask)
                            }
                            _ => mask,
                        };
                        if fresh.events().is_empty() {
                            continue;
                        }
                        if let Err(rollback) = mark_raw(group, FAN_MARK_REMOVE, fresh, done) {
                            warn!(
                                path = %done.display(),
                                mask = %fresh,
                                error = %rollback,
                                "Rollback of partial mark failed, kernel mark is wider than recorded"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }

        debug!(
            path = %canonical.display(),
            mask = %mask,
            marked = added.len(),
            "Marked path"
        );

        let state = self.marks.entry(path.to_path_buf()).or_default();
        state.canonical = canonical.clone();
        state.mask |= mask;
        for target in added {
            if !state.expanded.contains(&target) {
                state.expanded.push(target);
            }
        }

        self.register_root(&canonical);
        Ok(())
    }

    fn unmark(&mut self, path: &Path) -> Result<(), MarkError> {
        let group = self.group_fd()?;
        let Some(state) = self.marks.get_mut(path) else {
            return Ok(());
        };

        let mask = state.mask;
        remove_marks(state, |target| mark_raw(group, FAN_MARK_REMOVE, mask, target))?;

        if let Some(state) = self.marks.remove(path) {
            self.release_root(&state.canonical);
        }
        debug!(path = %path.display(), "Unmarked path");
        Ok(())
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let Some(fd) = self.fd.as_ref() else {
            return ReadOutcome::Closed;
        };

        loop {
            match unistd::read(fd.as_raw_fd(), buf) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => return ReadOutcome::Data(n),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return ReadOutcome::WouldBlock,
                Err(Errno::EBADF) => return ReadOutcome::Closed,
                Err(errno) => return ReadOutcome::Failed(io::Error::from(errno)),
            }
        }
    }

    fn readiness(&self) -> Readiness {
        match &self.fd {
            Some(fd) => Readiness::Fd(fd.as_raw_fd()),
            None => Readiness::Always,
        }
    }

    fn resolver(&self) -> ProcResolver {
        ProcResolver {
            roots: Arc::clone(&self.roots),
            fsid_roots: Arc::new(Mutex::new(AHashMap::new())),
            usernames: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            info!(fd = fd.as_raw_fd(), "Closing fanotify group");
        }
        // The kernel drops every mark with the group
        self.marks.clear();
        self.roots.write().clear();
    }

    fn is_closed(&self) -> bool {
        self.fd.is_none()
    }
}

/// Resolves fanotify references through `/proc/self/fd` and
/// `open_by_handle_at`, and pids through `/proc/<pid>`
#[derive(Clone)]
pub struct ProcResolver {
    roots: MountRoots,
    /// Root that last resolved a handle from each filesystem
    fsid_roots: Arc<Mutex<AHashMap<[i32; 2], PathBuf>>>,
    usernames: Arc<Mutex<AHashMap<u32, Option<String>>>>,
}

impl ProcResolver {
    fn username(&self, uid: u32) -> Option<String> {
        if let Some(known) = self.usernames.lock().get(&uid) {
            return known.clone();
        }
        let name = match User::from_uid(Uid::from_raw(uid)) {
            Ok(user) => user.map(|user| user.name),
            Err(err) => {
                debug!(uid, error = %err, "User lookup failed");
                None
            }
        };
        self.usernames.lock().insert(uid, name.clone());
        name
    }
}

impl PathResolver for ProcResolver {
    fn resolve_fd(&self, fd: RawFd) -> Option<PathBuf> {
        if fd < 0 {
            return None;
        }
        // SAFETY: the kernel installed this descriptor for the event being
        // decoded and nothing else refers to it
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        fd_path(owned.as_raw_fd())
    }

    fn release_fd(&self, fd: RawFd) {
        if fd >= 0 {
            // SAFETY: as in resolve_fd, the descriptor belongs to the event
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }

    fn resolve_handle(&self, handle: &FileHandle<'_>) -> Option<PathBuf> {
        let preferred = self.fsid_roots.lock().get(&handle.fsid).cloned();
        let roots = self.roots.read();

        let ordered = roots
            .iter()
            .filter(|(path, _)| Some(path) == preferred.as_ref())
            .chain(roots.iter().filter(|(path, _)| Some(path) != preferred.as_ref()));

        for (root, mount_fd) in ordered {
            if let Some(path) = open_handle(mount_fd.as_raw_fd(), handle) {
                self.fsid_roots.lock().insert(handle.fsid, root.clone());
                return Some(path);
            }
        }
        None
    }

    fn process_info(&self, pid: u32) -> Option<ProcessInfo> {
        let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
        let mut info = ProcessInfo::parse_status(pid, &status);

        match std::fs::read(format!("/proc/{}/cmdline", pid)) {
            Ok(raw) => info = info.with_cmdline(&raw),
            Err(err) => debug!(pid, error = %err, "Cannot read command line"),
        }
        if let Some(uid) = info.uid {
            info = info.with_username(self.username(uid));
        }
        Some(info)
    }
}

fn init(flags: u32, event_flags: u32) -> io::Result<OwnedFd> {
    // SAFETY: plain syscall, no pointers
    let fd = unsafe { libc::fanotify_init(flags, event_flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by fanotify_init and is owned by no one else
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Remove every mark in `state.expanded`. Targets whose removal failed stay
/// in the state so a retry can finish the job.
fn remove_marks(
    state: &mut MarkState,
    mut remove: impl FnMut(&Path) -> Result<(), MarkError>,
) -> Result<(), MarkError> {
    let mut first_error = None;

    state.expanded.retain(|target| match remove(target) {
        Ok(()) => false,
        // Kernel already dropped the mark with the object
        Err(err) if err.is_not_found() => false,
        Err(err) => {
            warn!(path = %target.display(), error = %err, "Failed to remove mark");
            first_error.get_or_insert(err);
            true
        }
    });

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// A read from the group always returns whole records
fn group_capabilities(report_names: bool) -> Capabilities {
    Capabilities {
        report_names,
        whole_records: true,
    }
}

fn unavailable(err: io::Error) -> SourceError {
    let reason = match err.raw_os_error() {
        Some(libc::EPERM) => "fanotify requires CAP_SYS_ADMIN",
        Some(libc::ENOSYS) => "fanotify is not supported by this kernel",
        Some(libc::EMFILE) => "too many fanotify groups",
        Some(libc::EINVAL) => "fanotify rejected the group flags",
        _ => "fanotify_init failed",
    };
    SourceError::from_io(reason, err)
}

fn mark_raw(group: RawFd, op: u32, mask: EventMask, path: &Path) -> Result<(), MarkError> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| MarkError::Io {
        path: path.to_path_buf(),
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;

    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    let rc = unsafe { libc::fanotify_mark(group, op, mask.bits(), libc::AT_FDCWD, c_path.as_ptr()) };
    if rc < 0 {
        return Err(MarkError::from_os(
            path.to_path_buf(),
            mask,
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn open_handle(mount_fd: RawFd, handle: &FileHandle<'_>) -> Option<PathBuf> {
    // struct file_handle { u32 handle_bytes; i32 handle_type; u8 f_handle[]; }
    let mut raw = Vec::with_capacity(8 + handle.bytes.len());
    raw.extend_from_slice(&(handle.bytes.len() as u32).to_ne_bytes());
    raw.extend_from_slice(&handle.handle_type.to_ne_bytes());
    raw.extend_from_slice(handle.bytes);

    // SAFETY: raw holds a complete file_handle and outlives the call
    let fd = unsafe {
        libc::syscall(
            libc::SYS_open_by_handle_at,
            mount_fd,
            raw.as_ptr(),
            libc::O_PATH | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return None;
    }
    // SAFETY: fd was just returned by open_by_handle_at
    let owned = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };
    fd_path(owned.as_raw_fd())
}

fn fd_path(fd: RawFd) -> Option<PathBuf> {
    let link = std::fs::read_link(format!("/proc/self/fd/{}", fd)).ok()?;
    Some(strip_deleted(link))
}

fn strip_deleted(path: PathBuf) -> PathBuf {
    const SUFFIX: &[u8] = b" (deleted)";
    let bytes = path.as_os_str().as_bytes();
    match bytes.strip_suffix(SUFFIX) {
        Some(stripped) => PathBuf::from(std::ffi::OsStr::from_bytes(stripped)),
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use tempfile::TempDir;

    fn resolver() -> ProcResolver {
        ProcResolver {
            roots: Arc::new(RwLock::new(Vec::new())),
            fsid_roots: Arc::new(Mutex::new(AHashMap::new())),
            usernames: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    #[test]
    fn test_resolve_fd_reports_path() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("watched.txt");
        std::fs::write(&file_path, b"x").unwrap();

        let fd = File::open(&file_path).unwrap().into_raw_fd();
        let resolved = resolver().resolve_fd(fd).unwrap();

        assert_eq!(resolved, file_path.canonicalize().unwrap());
    }

    #[test]
    fn test_resolve_fd_ignores_no_fd() {
        assert_eq!(resolver().resolve_fd(FAN_NOFD), None);
    }

    #[test]
    fn test_process_info_for_self() {
        let resolver = resolver();
        let info = resolver.process_info(std::process::id()).unwrap();

        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.uid, Some(unistd::getuid().as_raw()));
        assert!(info.comm.is_some());
        assert!(info.cmdline.is_some());
        assert!(resolver.usernames.lock().contains_key(&unistd::getuid().as_raw()));
    }

    #[test]
    fn test_process_info_for_missing_pid() {
        // Above the kernel's pid_max ceiling
        assert_eq!(resolver().process_info(u32::MAX), None);
    }

    #[test]
    fn test_strip_deleted_suffix() {
        assert_eq!(
            strip_deleted(PathBuf::from("/tmp/x (deleted)")),
            PathBuf::from("/tmp/x")
        );
        assert_eq!(strip_deleted(PathBuf::from("/tmp/x")), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_unknown_handle_is_unresolved() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver();
        resolver.roots.write().push((
            dir.path().to_path_buf(),
            OwnedFd::from(File::open(dir.path()).unwrap()),
        ));

        let handle = FileHandle {
            fsid: [0, 0],
            handle_type: 1,
            bytes: &[0xff; 8],
        };
        assert_eq!(resolver.resolve_handle(&handle), None);
    }

    fn marked(targets: &[&str]) -> MarkState {
        MarkState {
            canonical: PathBuf::from(targets[0]),
            mask: EventMask::MODIFY,
            expanded: targets.iter().map(PathBuf::from).collect(),
        }
    }

    #[test]
    fn test_failed_mark_removal_is_kept_for_retry() {
        let mut state = marked(&["/srv", "/srv/a", "/srv/b"]);

        let err = remove_marks(&mut state, |target| {
            if target == Path::new("/srv/a") {
                Err(MarkError::PermissionDenied(target.to_path_buf()))
            } else {
                Ok(())
            }
        })
        .unwrap_err();

        assert!(matches!(err, MarkError::PermissionDenied(_)));
        assert_eq!(state.expanded, vec![PathBuf::from("/srv/a")]);

        let mut retried = Vec::new();
        remove_marks(&mut state, |target| {
            retried.push(target.to_path_buf());
            Ok(())
        })
        .unwrap();

        assert_eq!(retried, vec![PathBuf::from("/srv/a")]);
        assert!(state.expanded.is_empty());
    }

    #[test]
    fn test_vanished_mark_counts_as_removed() {
        let mut state = marked(&["/srv", "/srv/gone"]);

        remove_marks(&mut state, |target| {
            if target == Path::new("/srv/gone") {
                Err(MarkError::PathNotFound(target.to_path_buf()))
            } else {
                Ok(())
            }
        })
        .unwrap();

        assert!(state.expanded.is_empty());
    }

    #[test]
    fn test_open_failure_is_unavailable_or_ok() {
        // Unprivileged runs get Unavailable; privileged runs get a group
        match FanotifySource::open(&SourceOptions::default()) {
            Ok(mut source) => {
                assert!(!source.is_closed());
                source.close();
                assert!(source.is_closed());
                assert!(matches!(source.read_raw(&mut [0u8; 64]), ReadOutcome::Closed));
            }
            Err(SourceError::Unavailable { reason, .. }) => assert!(!reason.is_empty()),
        }
    }
}
