//! Single-run mutual exclusion for update runs.
//!
//! The marker is a small JSON record created with O_EXCL semantics. A marker
//! older than `stale_after` is assumed to belong to a crashed run and is
//! reclaimed. Release goes through `LockGuard`, which removes the marker on
//! drop so every exit path (early return, error, unwinding panic) lets go.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default age after which a marker is considered abandoned (6 hours).
pub const DEFAULT_STALE_AFTER_SECS: u64 = 6 * 3600;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock held by pid {pid} since {acquired_at}")]
    AlreadyHeld {
        pid: u32,
        acquired_at: DateTime<Utc>,
    },

    #[error("Lock IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Contents of the lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMarker {
    pub pid: u32,
    pub run_id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

impl LockMarker {
    fn for_current_process() -> Self {
        Self {
            pid: std::process::id(),
            run_id: Uuid::new_v4(),
            acquired_at: Utc::now(),
        }
    }
}

/// Proof of ownership returned by `acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    pub marker: LockMarker,
}

/// Observed lock state, for inspection without acquiring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum LockStatus {
    Free,
    Held {
        pid: u32,
        acquired_at: DateTime<Utc>,
        age_secs: u64,
    },
    Stale {
        pid: u32,
        acquired_at: DateTime<Utc>,
        age_secs: u64,
    },
}

/// A process-exclusion backend. Implementations may use a file, an OS
/// advisory lock or a database row; the orchestrator only sees this trait.
pub trait RunLock {
    fn acquire(&self) -> Result<LockHandle, LockError>;

    fn release(&self, handle: &LockHandle) -> Result<(), LockError>;

    fn is_stale(&self, age: Duration) -> bool;

    fn status(&self) -> Result<LockStatus, LockError>;
}

/// Scoped ownership of a `RunLock`. Releases on drop.
pub struct LockGuard<'a> {
    lock: &'a dyn RunLock,
    handle: LockHandle,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(lock: &'a dyn RunLock) -> Result<Self, LockError> {
        let handle = lock.acquire()?;
        log::debug!(
            "Acquired lock '{}' (run {})",
            handle.name,
            handle.marker.run_id
        );
        Ok(Self { lock, handle })
    }

    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.lock.release(&self.handle) {
            Ok(()) => log::debug!("Released lock '{}'", self.handle.name),
            Err(e) => log::warn!("Failed to release lock '{}': {}", self.handle.name, e),
        }
    }
}

/// Lock marker stored at `<dir>/<name>.lock`.
#[derive(Debug, Clone)]
pub struct FileRunLock {
    name: String,
    path: PathBuf,
    stale_after: Duration,
}

impl FileRunLock {
    pub fn new(dir: &Path, name: &str, stale_after: Duration) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(format!("{}.lock", name)),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Create the marker only if no file exists yet.
    fn write_new(&self, marker: &LockMarker) -> Result<bool, LockError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(self.io_err(e)),
        };

        let body = serde_json::to_vec(marker)
            .map_err(|e| self.io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        file.write_all(&body).map_err(|e| self.io_err(e))?;
        file.sync_all().map_err(|e| self.io_err(e))?;
        Ok(true)
    }

    /// Existing marker and its age. A marker that cannot be parsed (e.g. a
    /// writer that has not finished) is aged by file mtime and reported as pid 0.
    fn read_existing(&self) -> Result<Option<(LockMarker, Duration)>, LockError> {
        self.read_marker_at(&self.path)
    }

    fn read_marker_at(&self, path: &Path) -> Result<Option<(LockMarker, Duration)>, LockError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };

        if let Ok(marker) = serde_json::from_str::<LockMarker>(&content) {
            let age = (Utc::now() - marker.acquired_at)
                .to_std()
                .unwrap_or_default();
            return Ok(Some((marker, age)));
        }

        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        let marker = LockMarker {
            pid: 0,
            run_id: Uuid::nil(),
            acquired_at: DateTime::<Utc>::from(modified),
        };
        Ok(Some((marker, age)))
    }

    /// Remove the marker only if it is still the stale one we inspected.
    ///
    /// The marker is first renamed to a private tombstone, which is atomic, so
    /// exactly one starter takes any given file. If what we took is not
    /// `seen` (another starter already reclaimed and wrote a fresh marker),
    /// it is linked back without clobbering and nothing is reclaimed.
    fn reclaim_if_unchanged(&self, seen: &LockMarker) -> Result<bool, LockError> {
        let tombstone = self
            .path
            .with_extension(format!("lock.{}.stale", Uuid::new_v4()));

        match std::fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.io_err(e)),
        }

        let taken = self.read_marker_at(&tombstone)?.map(|(marker, _)| marker);
        let reclaimed = taken.as_ref() == Some(seen);

        if !reclaimed {
            match std::fs::hard_link(&tombstone, &self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    log::warn!(
                        "Lock '{}' was rewritten while restoring a live marker",
                        self.name
                    );
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&tombstone);
                    return Err(self.io_err(e));
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&tombstone) {
            log::warn!("Failed to remove {}: {}", tombstone.display(), e);
        }
        Ok(reclaimed)
    }

    fn remove_marker(&self) -> Result<(), LockError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

impl RunLock for FileRunLock {
    fn acquire(&self) -> Result<LockHandle, LockError> {
        let marker = LockMarker::for_current_process();

        // One reclaim attempt: if a concurrent starter reclaims first or wins
        // the second create, it holds the lock and we report it as held.
        for attempt in 0..2 {
            if self.write_new(&marker)? {
                return Ok(LockHandle {
                    name: self.name.clone(),
                    marker,
                });
            }

            let Some((existing, age)) = self.read_existing()? else {
                // Holder released between our create and read
                continue;
            };

            if attempt == 0 && self.is_stale(age) {
                log::warn!(
                    "Reclaiming stale lock '{}' held by pid {} since {} ({}s old)",
                    self.name,
                    existing.pid,
                    existing.acquired_at,
                    age.as_secs()
                );
                if !self.reclaim_if_unchanged(&existing)? {
                    log::info!("Lock '{}' was reclaimed by another run first", self.name);
                }
                continue;
            }

            return Err(LockError::AlreadyHeld {
                pid: existing.pid,
                acquired_at: existing.acquired_at,
            });
        }

        match self.read_existing()? {
            Some((existing, _)) => Err(LockError::AlreadyHeld {
                pid: existing.pid,
                acquired_at: existing.acquired_at,
            }),
            None => Err(self.io_err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "lock marker contended",
            ))),
        }
    }

    fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        match self.read_existing()? {
            None => Ok(()),
            Some((existing, _)) if existing.run_id == handle.marker.run_id => self.remove_marker(),
            Some((existing, _)) => {
                log::warn!(
                    "Lock '{}' now belongs to pid {} (run {}); leaving it in place",
                    self.name,
                    existing.pid,
                    existing.run_id
                );
                Ok(())
            }
        }
    }

    fn is_stale(&self, age: Duration) -> bool {
        age > self.stale_after
    }

    fn status(&self) -> Result<LockStatus, LockError> {
        Ok(match self.read_existing()? {
            None => LockStatus::Free,
            Some((marker, age)) if self.is_stale(age) => LockStatus::Stale {
                pid: marker.pid,
                acquired_at: marker.acquired_at,
                age_secs: age.as_secs(),
            },
            Some((marker, age)) => LockStatus::Held {
                pid: marker.pid,
                acquired_at: marker.acquired_at,
                age_secs: age.as_secs(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn write_marker(path: &Path, acquired_at: DateTime<Utc>, pid: u32) {
        let marker = LockMarker {
            pid,
            run_id: Uuid::new_v4(),
            acquired_at,
        };
        std::fs::write(path, serde_json::to_vec(&marker).unwrap()).unwrap();
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);

        let handle = lock.acquire().expect("acquire");
        assert!(lock.path().exists());
        assert_eq!(handle.marker.pid, std::process::id());

        lock.release(&handle).expect("release");
        assert!(!lock.path().exists());
        assert_eq!(lock.status().unwrap(), LockStatus::Free);
    }

    #[test]
    fn test_second_acquire_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);

        let _held = lock.acquire().expect("first acquire");
        let second = lock.acquire();
        assert!(matches!(second, Err(LockError::AlreadyHeld { .. })));
    }

    #[test]
    fn test_fresh_foreign_marker_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);
        write_marker(lock.path(), Utc::now() - chrono::Duration::minutes(5), 4242);

        match lock.acquire() {
            Err(LockError::AlreadyHeld { pid, .. }) => assert_eq!(pid, 4242),
            other => panic!("expected AlreadyHeld, got {:?}", other),
        }
        assert!(matches!(lock.status().unwrap(), LockStatus::Held { pid: 4242, .. }));
    }

    #[test]
    fn test_stale_marker_is_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);
        write_marker(lock.path(), Utc::now() - chrono::Duration::hours(3), 4242);
        assert!(matches!(lock.status().unwrap(), LockStatus::Stale { .. }));

        let handle = lock.acquire().expect("stale lock reclaimed");
        assert_eq!(handle.marker.pid, std::process::id());

        let on_disk: LockMarker =
            serde_json::from_str(&std::fs::read_to_string(lock.path()).unwrap()).unwrap();
        assert_eq!(on_disk.run_id, handle.marker.run_id);
    }

    #[test]
    fn test_unreadable_marker_aged_by_mtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);
        std::fs::write(lock.path(), b"").unwrap();

        assert!(matches!(lock.acquire(), Err(LockError::AlreadyHeld { pid: 0, .. })));

        let old = SystemTime::now() - Duration::from_secs(2 * 3600);
        filetime::set_file_mtime(lock.path(), filetime::FileTime::from_system_time(old))
            .expect("set mtime");

        lock.acquire().expect("stale empty marker reclaimed");
    }

    fn leftover_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_reclaim_removes_unchanged_stale_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);
        write_marker(lock.path(), Utc::now() - chrono::Duration::hours(3), 4242);
        let (seen, _) = lock.read_existing().unwrap().expect("marker");

        assert!(lock.reclaim_if_unchanged(&seen).expect("reclaim"));
        assert!(!lock.path().exists());
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[test]
    fn test_reclaim_keeps_marker_rewritten_after_inspection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);
        write_marker(lock.path(), Utc::now() - chrono::Duration::hours(3), 4242);
        let (seen, _) = lock.read_existing().unwrap().expect("marker");

        // A concurrent starter reclaimed first and now holds a fresh marker
        write_marker(lock.path(), Utc::now(), 777);

        assert!(!lock.reclaim_if_unchanged(&seen).expect("reclaim"));
        let (current, _) = lock.read_existing().unwrap().expect("fresh marker kept");
        assert_eq!(current.pid, 777);
        assert_eq!(leftover_files(dir.path()), vec!["update.lock".to_string()]);
        assert!(matches!(lock.acquire(), Err(LockError::AlreadyHeld { pid: 777, .. })));
    }

    #[test]
    fn test_reclaim_after_marker_vanished() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);
        write_marker(lock.path(), Utc::now() - chrono::Duration::hours(3), 4242);
        let (seen, _) = lock.read_existing().unwrap().expect("marker");
        std::fs::remove_file(lock.path()).unwrap();

        assert!(!lock.reclaim_if_unchanged(&seen).expect("reclaim"));
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_release_leaves_foreign_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);
        let handle = lock.acquire().expect("acquire");

        // Another run reclaimed and rewrote the marker
        write_marker(lock.path(), Utc::now(), 777);
        lock.release(&handle).expect("release");
        assert!(lock.path().exists());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);
        {
            let guard = LockGuard::acquire(&lock).expect("guard");
            assert!(lock.path().exists());
            assert_eq!(guard.handle().name, "update");
            assert_eq!(guard.handle().marker.pid, std::process::id());
            assert!(LockGuard::acquire(&lock).is_err());
        }
        assert!(!lock.path().exists());
        assert!(LockGuard::acquire(&lock).is_ok());
    }

    #[test]
    fn test_guard_releases_on_error_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FileRunLock::new(dir.path(), "update", HOUR);

        fn failing_run(lock: &dyn RunLock) -> Result<(), String> {
            let _guard = LockGuard::acquire(lock).map_err(|e| e.to_string())?;
            Err("reprocessing exploded".to_string())
        }

        assert!(failing_run(&lock).is_err());
        assert!(!lock.path().exists());
    }
}
