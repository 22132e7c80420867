use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const FALLBACK_MARKER_SUFFIX: &str = ".marker";

/// `ENOLCK` and `EOPNOTSUPP`: the filesystem has no working advisory locks (NFS without
/// lockd, some FUSE mounts).
#[cfg(target_os = "linux")]
const NO_LOCK_SUPPORT: &[i32] = &[37, 95];
#[cfg(target_os = "macos")]
const NO_LOCK_SUPPORT: &[i32] = &[77, 102];
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const NO_LOCK_SUPPORT: &[i32] = &[];

type NativeAttempt = fn(&File) -> io::Result<()>;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another export holds {path} (waited {waited:?})")]
    Busy { path: PathBuf, waited: Duration },
}

/// How exclusion is enforced. Chosen at construction; `Native` may degrade to `Marker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    /// OS advisory lock on the lock file (`flock` / `LockFileEx`).
    Native,
    /// The lock file itself, created exclusively and holding the owner's PID.
    Marker,
}

impl Default for LockBackend {
    fn default() -> Self {
        if cfg!(any(unix, windows)) {
            LockBackend::Native
        } else {
            LockBackend::Marker
        }
    }
}

#[derive(Debug)]
enum Held {
    Native(File),
    Marker(PathBuf),
}

enum Attempt {
    Taken(Held),
    Contended,
    /// The native lock cannot work on this filesystem.
    Unsupported(io::Error),
}

/// Exclusive, process-wide lock over an archive. Released on drop.
///
/// A `Native` lock whose filesystem rejects advisory locking switches itself to a marker
/// file next to the lock file (`<lock>.marker`) and stays on it.
#[derive(Debug)]
pub struct ScopedLock {
    path: PathBuf,
    backend: LockBackend,
    degraded: bool,
    native_attempt: NativeAttempt,
    held: Option<Held>,
}

impl ScopedLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_backend(path, LockBackend::default())
    }

    pub fn with_backend(path: impl Into<PathBuf>, backend: LockBackend) -> Self {
        Self {
            path: path.into(),
            backend,
            degraded: false,
            native_attempt: <File as FileExt>::try_lock_exclusive,
            held: None,
        }
    }

    #[cfg(test)]
    fn with_native_attempt(mut self, attempt: NativeAttempt) -> Self {
        self.native_attempt = attempt;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend(&self) -> LockBackend {
        self.backend
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Poll every 100 ms until the lock is taken or `timeout` elapses. A zero timeout makes
    /// exactly one attempt.
    pub fn acquire(&mut self, timeout: Duration) -> bool {
        if self.is_held() {
            return true;
        }
        let started = Instant::now();
        loop {
            match self.try_acquire() {
                Ok(Attempt::Taken(held)) => {
                    debug!(path = %self.path.display(), backend = ?self.backend, "lock acquired");
                    self.held = Some(held);
                    return true;
                }
                Ok(Attempt::Contended) => {}
                Ok(Attempt::Unsupported(err)) => {
                    warn!(
                        path = %self.path.display(),
                        "native file locking unavailable ({err}); falling back to a marker file"
                    );
                    self.backend = LockBackend::Marker;
                    self.degraded = true;
                    continue;
                }
                Err(err) => {
                    warn!(path = %self.path.display(), "lock attempt failed: {err}");
                    return false;
                }
            }
            if started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Like [`acquire`](Self::acquire), but reports contention as [`LockError::Busy`].
    pub fn acquire_or_busy(mut self, timeout: Duration) -> Result<Self, LockError> {
        if self.acquire(timeout) {
            Ok(self)
        } else {
            Err(LockError::Busy {
                path: self.path.clone(),
                waited: timeout,
            })
        }
    }

    /// Where the `Marker` backend creates its file.
    fn marker_path(&self) -> PathBuf {
        if self.degraded {
            let mut path = self.path.clone().into_os_string();
            path.push(FALLBACK_MARKER_SUFFIX);
            PathBuf::from(path)
        } else {
            self.path.clone()
        }
    }

    fn try_acquire(&self) -> io::Result<Attempt> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        match self.backend {
            LockBackend::Native => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(false)
                    .open(&self.path)?;
                match (self.native_attempt)(&file) {
                    Ok(()) => {
                        restrict_file(&self.path);
                        file.set_len(0)?;
                        write!(file, "{}", std::process::id())?;
                        Ok(Attempt::Taken(Held::Native(file)))
                    }
                    Err(err) if is_contended(&err) => Ok(Attempt::Contended),
                    Err(err) if is_unsupported(&err) => Ok(Attempt::Unsupported(err)),
                    Err(err) => Err(err),
                }
            }
            LockBackend::Marker => {
                let marker = self.marker_path();
                match OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&marker)
                {
                    Ok(mut file) => {
                        restrict_file(&marker);
                        write!(file, "{}", std::process::id())?;
                        file.sync_all()?;
                        Ok(Attempt::Taken(Held::Marker(marker)))
                    }
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(Attempt::Contended),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Idempotent.
    pub fn release(&mut self) {
        match self.held.take() {
            Some(Held::Native(file)) => {
                if let Err(err) = FileExt::unlock(&file) {
                    warn!(path = %self.path.display(), "unlock failed: {err}");
                }
            }
            Some(Held::Marker(marker)) => {
                if let Err(err) = fs::remove_file(&marker) {
                    warn!(path = %marker.display(), "could not remove lock marker: {err}");
                }
            }
            None => return,
        }
        debug!(path = %self.path.display(), "lock released");
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn is_unsupported(err: &io::Error) -> bool {
    err.kind() == ErrorKind::Unsupported
        || err
            .raw_os_error()
            .is_some_and(|code| NO_LOCK_SUPPORT.contains(&code))
}

fn restrict_file(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            warn!(path = %path.display(), "could not restrict lock file: {err}");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
