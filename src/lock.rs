//! Named locks with bounded-retry acquisition.
//!
//! Generation of one variant must happen at most once at a time, across
//! threads and, with the file backend, across processes sharing a disk. The
//! pieces:
//!
//! - [`LockStrategy`]: the backend capability, a non-blocking
//!   `try_acquire` plus `release` on a lock name.
//!   [`MemoryLocks`] serves a single process, [`FileLocks`] uses
//!   `O_EXCL` lock files so several server processes can share a cache.
//! - [`Gate`]: the polling wrapper, written once above the backends. It
//!   tries up to `max_attempts` times, sleeping `poll_interval` after each
//!   failed try, then gives up with [`LockError::Timeout`]. A successful acquire
//!   returns a [`LockGuard`] that releases on drop, so every exit path
//!   (return, `?`, panic) lets go of the lock.
//! - [`InFlight`]: the per-thread set of keys currently being produced, used
//!   to refuse recursive generation of the same key instead of deadlocking
//!   on our own lock.
//!
//! Lock names are [`lock_name`] hashes of a purpose-scoped key such as
//! `"images/photo.jpg-read"` so arbitrary paths map to safe file names.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const LOCK_PREFIX: &str = "variant-forge-";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {name} still held after {attempts} attempts")]
    Timeout { name: String, attempts: u32 },
    #[error("Recursive generation of {0}")]
    Reentrant(String),
    #[error("Lock backend IO error: {0}")]
    Io(#[from] io::Error),
}

/// Stable, filesystem-safe lock name for a key.
pub fn lock_name(key: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    format!("{LOCK_PREFIX}{}", &digest[..32])
}

/// Identifies one successful acquisition. Releasing with a token that no
/// longer owns the lock leaves the lock alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    /// Unique across processes on a host: pid, clock and a process counter.
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = NEXT.fetch_add(1, Ordering::Relaxed);
        Self(format!("{}-{nanos}-{seq}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Non-blocking lock backend.
pub trait LockStrategy: Send + Sync {
    /// Take the lock if it is free. `Ok(None)` means someone else holds it.
    fn try_acquire(&self, name: &str) -> Result<Option<LockToken>, LockError>;

    /// Give back a lock taken by `try_acquire`, if `token` still owns it.
    fn release(&self, name: &str, token: &LockToken) -> Result<(), LockError>;
}

// =========================================================================
// Backends
// =========================================================================

/// In-process lock registry.
#[derive(Debug, Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<String, LockToken>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, LockToken>> {
        // The map stays consistent even if a holder panicked mid-insert.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LockStrategy for MemoryLocks {
    fn try_acquire(&self, name: &str) -> Result<Option<LockToken>, LockError> {
        let mut held = self.held();
        if held.contains_key(name) {
            return Ok(None);
        }
        let token = LockToken::fresh();
        held.insert(name.to_string(), token.clone());
        Ok(Some(token))
    }

    fn release(&self, name: &str, token: &LockToken) -> Result<(), LockError> {
        let mut held = self.held();
        if held.get(name) == Some(token) {
            held.remove(name);
        }
        Ok(())
    }
}

/// Lock files in a shared directory, one `<name>.lock` per held lock. The
/// file holds the owner's [`LockToken`].
///
/// A lock file older than `stale_after` is treated as left behind by a
/// crashed holder and taken over. A holder that outlives its own staleness
/// finds a different token on release and leaves the new owner's file in
/// place.
#[derive(Debug)]
pub struct FileLocks {
    dir: PathBuf,
    stale_after: Option<Duration>,
}

impl FileLocks {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Option<Duration>) -> Result<Self, LockError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, stale_after })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    fn create(&self, path: &Path, token: &LockToken) -> Result<bool, LockError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = file.write_all(token.as_str().as_bytes()) {
            remove_if_present(path)?;
            return Err(e.into());
        }
        Ok(true)
    }

    fn is_stale(&self, path: &Path) -> bool {
        let Some(max_age) = self.stale_after else {
            return false;
        };
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > max_age)
    }

    /// Move a stale lock file aside under a unique name, then claim the path.
    ///
    /// Only one waiter's rename can move a given file. A waiter whose rename
    /// caught a lock that another waiter had just created (no longer stale)
    /// links it back and reports the lock as held.
    fn take_over(&self, name: &str, path: &Path, token: &LockToken) -> Result<bool, LockError> {
        let aside = self.dir.join(format!("{name}.{}.stale", token.as_str()));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return self.create(path, token),
            Err(e) => return Err(e.into()),
        }

        if !self.is_stale(&aside) {
            match fs::hard_link(&aside, path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            remove_if_present(&aside)?;
            return Ok(false);
        }

        tracing::warn!(lock = %path.display(), "Taking over stale lock file");
        remove_if_present(&aside)?;
        self.create(path, token)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl LockStrategy for FileLocks {
    fn try_acquire(&self, name: &str) -> Result<Option<LockToken>, LockError> {
        let token = LockToken::fresh();
        let path = self.path_for(name);
        if self.create(&path, &token)? {
            return Ok(Some(token));
        }
        if self.is_stale(&path) && self.take_over(name, &path, &token)? {
            return Ok(Some(token));
        }
        Ok(None)
    }

    fn release(&self, name: &str, token: &LockToken) -> Result<(), LockError> {
        let path = self.path_for(name);
        match fs::read_to_string(&path) {
            Ok(owner) if owner == token.as_str() => Ok(remove_if_present(&path)?),
            Ok(_) => {
                tracing::warn!(lock = %path.display(), "Lock was taken over while held");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =========================================================================
// Gate
// =========================================================================

/// Bounded-retry acquisition over any [`LockStrategy`].
#[derive(Clone)]
pub struct Gate {
    strategy: Arc<dyn LockStrategy>,
    max_attempts: u32,
    poll_interval: Duration,
}

impl Gate {
    pub fn new(strategy: Arc<dyn LockStrategy>, max_attempts: u32, poll_interval: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            poll_interval,
        }
    }

    /// Acquire the lock for `key`, sleeping `poll_interval` after every
    /// failed attempt until `max_attempts` is exhausted.
    pub fn acquire(&self, key: &str) -> Result<LockGuard<'_>, LockError> {
        let name = lock_name(key);
        for attempt in 1..=self.max_attempts {
            if let Some(token) = self.strategy.try_acquire(&name)? {
                tracing::trace!(key, attempt, "Lock acquired");
                return Ok(LockGuard {
                    strategy: self.strategy.as_ref(),
                    name,
                    token,
                });
            }
            thread::sleep(self.poll_interval);
        }
        tracing::debug!(key, attempts = self.max_attempts, "Gave up waiting for lock");
        Err(LockError::Timeout {
            name,
            attempts: self.max_attempts,
        })
    }

    /// Run `body` while holding the lock for `key`.
    pub fn with_lock<T>(&self, key: &str, body: impl FnOnce() -> T) -> Result<T, LockError> {
        let _guard = self.acquire(key)?;
        Ok(body())
    }
}

/// Held lock; released on drop.
pub struct LockGuard<'a> {
    strategy: &'a dyn LockStrategy,
    name: String,
    token: LockToken,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.strategy.release(&self.name, &self.token) {
            tracing::warn!(lock = %self.name, error = %e, "Failed to release lock");
        }
    }
}

// =========================================================================
// Re-entrancy
// =========================================================================

/// Keys currently being produced, tagged with the producing thread.
#[derive(Debug, Default)]
pub struct InFlight {
    keys: Mutex<HashSet<(String, ThreadId)>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` as in flight on this thread.
    ///
    /// Fails with [`LockError::Reentrant`] if this thread is already
    /// producing `key`. Other threads producing the same key are not an
    /// error here; the produce lock serializes them.
    pub fn enter(&self, key: &str) -> Result<InFlightGuard<'_>, LockError> {
        let entry = (key.to_string(), thread::current().id());
        if !self.keys().insert(entry.clone()) {
            return Err(LockError::Reentrant(key.to_string()));
        }
        Ok(InFlightGuard { set: self, entry })
    }

    fn keys(&self) -> MutexGuard<'_, HashSet<(String, ThreadId)>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct InFlightGuard<'a> {
    set: &'a InFlight,
    entry: (String, ThreadId),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.keys().remove(&self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    /// Backend that never grants the lock and counts attempts.
    #[derive(Default)]
    struct AlwaysBusy {
        attempts: AtomicU32,
    }

    impl LockStrategy for AlwaysBusy {
        fn try_acquire(&self, _name: &str) -> Result<Option<LockToken>, LockError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        fn release(&self, _name: &str, _token: &LockToken) -> Result<(), LockError> {
            Ok(())
        }
    }

    fn memory_gate(attempts: u32, interval_ms: u64) -> (Arc<MemoryLocks>, Gate) {
        let locks = Arc::new(MemoryLocks::new());
        let gate = Gate::new(locks.clone(), attempts, Duration::from_millis(interval_ms));
        (locks, gate)
    }

    fn lock_dir_entries(locks: &FileLocks) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(locks.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    // =========================================================================
    // lock_name
    // =========================================================================

    #[test]
    fn lock_name_is_stable_and_safe() {
        let a = lock_name("images/photo.jpg-read");
        assert_eq!(a, lock_name("images/photo.jpg-read"));
        assert_ne!(a, lock_name("images/photo.jpg-process"));
        assert!(a.starts_with(LOCK_PREFIX));
        assert_eq!(a.len(), LOCK_PREFIX.len() + 32);
        assert!(a.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-'));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(LockToken::fresh(), LockToken::fresh());
    }

    // =========================================================================
    // Backends
    // =========================================================================

    #[test]
    fn memory_lock_is_exclusive_until_released() {
        let locks = MemoryLocks::new();
        let a = locks.try_acquire("a").unwrap().unwrap();
        assert!(locks.try_acquire("a").unwrap().is_none());
        assert!(locks.try_acquire("b").unwrap().is_some());
        locks.release("a", &a).unwrap();
        assert!(locks.try_acquire("a").unwrap().is_some());
    }

    #[test]
    fn memory_release_with_foreign_token_keeps_lock() {
        let locks = MemoryLocks::new();
        let _owner = locks.try_acquire("a").unwrap().unwrap();
        locks.release("a", &LockToken::fresh()).unwrap();
        assert!(locks.try_acquire("a").unwrap().is_none());
    }

    #[test]
    fn file_lock_is_exclusive_until_released() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locks = FileLocks::new(tmp.path().join("locks"), None).unwrap();

        let token = locks.try_acquire("a").unwrap().unwrap();
        let path = locks.dir().join("a.lock");
        assert_eq!(fs::read_to_string(&path).unwrap(), token.as_str());
        assert!(locks.try_acquire("a").unwrap().is_none());

        locks.release("a", &token).unwrap();
        assert!(!path.exists());
        assert!(locks.try_acquire("a").unwrap().is_some());
    }

    #[test]
    fn file_lock_release_of_missing_file_is_ok() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locks = FileLocks::new(tmp.path(), None).unwrap();
        locks.release("never-taken", &LockToken::fresh()).unwrap();
    }

    #[test]
    fn stale_file_lock_is_taken_over() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locks = FileLocks::new(tmp.path(), Some(Duration::ZERO)).unwrap();
        let first = locks.try_acquire("a").unwrap().unwrap();
        thread::sleep(Duration::from_millis(20));

        let second = locks.try_acquire("a").unwrap().unwrap();

        assert_ne!(first, second);
        assert_eq!(lock_dir_entries(&locks), vec!["a.lock"]);
    }

    #[test]
    fn overtaken_holder_does_not_release_new_owner() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locks = FileLocks::new(tmp.path(), Some(Duration::from_millis(100))).unwrap();
        let slow = locks.try_acquire("a").unwrap().unwrap();
        thread::sleep(Duration::from_millis(200));
        let taker = locks.try_acquire("a").unwrap().unwrap();

        // The slow holder finishes late and drops its lock.
        locks.release("a", &slow).unwrap();

        assert!(locks.try_acquire("a").unwrap().is_none());
        locks.release("a", &taker).unwrap();
        assert!(locks.try_acquire("a").unwrap().is_some());
    }

    #[test]
    fn fresh_file_lock_is_not_taken_over() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locks = FileLocks::new(tmp.path(), Some(Duration::from_secs(60))).unwrap();
        let owner = locks.try_acquire("a").unwrap().unwrap();

        assert!(locks.try_acquire("a").unwrap().is_none());
        assert_eq!(
            fs::read_to_string(locks.dir().join("a.lock")).unwrap(),
            owner.as_str()
        );
    }

    #[test]
    fn gate_guard_over_file_locks_survives_takeover() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locks = Arc::new(FileLocks::new(tmp.path(), Some(Duration::from_millis(50))).unwrap());
        let gate = Gate::new(locks.clone(), 1, Duration::from_millis(1));

        let slow = gate.acquire("key").unwrap();
        thread::sleep(Duration::from_millis(120));
        let taker = gate.acquire("key").unwrap();
        drop(slow);

        assert!(matches!(gate.acquire("key"), Err(LockError::Timeout { .. })));
        drop(taker);
        assert!(gate.acquire("key").is_ok());
    }

    // =========================================================================
    // Gate
    // =========================================================================

    #[test]
    fn gate_gives_up_after_max_attempts() {
        let busy = Arc::new(AlwaysBusy::default());
        let gate = Gate::new(busy.clone(), 5, Duration::from_millis(10));

        let start = Instant::now();
        let result = gate.acquire("key");

        assert!(matches!(result, Err(LockError::Timeout { attempts: 5, .. })));
        assert_eq!(busy.attempts.load(Ordering::SeqCst), 5);
        // One poll interval after every failed attempt.
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn gate_treats_zero_attempts_as_one() {
        let busy = Arc::new(AlwaysBusy::default());
        let gate = Gate::new(busy.clone(), 0, Duration::from_millis(1));
        assert!(gate.acquire("key").is_err());
        assert_eq!(busy.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_releases_on_drop() {
        let (locks, gate) = memory_gate(1, 1);
        {
            let _guard = gate.acquire("key").unwrap();
            assert!(locks.try_acquire(&lock_name("key")).unwrap().is_none());
        }
        assert!(gate.acquire("key").is_ok());
    }

    #[test]
    fn with_lock_releases_after_panic() {
        let (_locks, gate) = memory_gate(1, 1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            gate.with_lock("key", || panic!("body failed"))
        }));
        assert!(result.is_err());
        assert_eq!(gate.with_lock("key", || 42).unwrap(), 42);
    }

    #[test]
    fn waiter_gets_lock_once_holder_finishes() {
        let (_locks, gate) = memory_gate(10, 20);
        let holder_gate = gate.clone();
        let guard_taken = Arc::new(std::sync::Barrier::new(2));
        let barrier = guard_taken.clone();

        let holder = thread::spawn(move || {
            holder_gate
                .with_lock("key", || {
                    barrier.wait();
                    thread::sleep(Duration::from_millis(60));
                })
                .unwrap();
        });

        guard_taken.wait();
        let start = Instant::now();
        gate.with_lock("key", || ()).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        holder.join().unwrap();
    }

    #[test]
    fn distinct_keys_do_not_block_each_other() {
        let (_locks, gate) = memory_gate(1, 1);
        let _read = gate.acquire("photo.jpg-read").unwrap();
        assert!(gate.acquire("photo.w10.jpg-process").is_ok());
    }

    // =========================================================================
    // InFlight
    // =========================================================================

    #[test]
    fn in_flight_rejects_same_thread_reentry() {
        let set = InFlight::new();
        let _outer = set.enter("key").unwrap();
        assert!(matches!(set.enter("key"), Err(LockError::Reentrant(_))));
        assert!(set.enter("other").is_ok());
    }

    #[test]
    fn in_flight_allows_other_threads() {
        let set = Arc::new(InFlight::new());
        let _outer = set.enter("key").unwrap();
        let other = set.clone();
        let ok = thread::spawn(move || {
            let entered = other.enter("key").is_ok();
            entered
        })
        .join()
        .unwrap();
        assert!(ok);
    }

    #[test]
    fn in_flight_guard_clears_key() {
        let set = InFlight::new();
        {
            let _g = set.enter("key").unwrap();
            assert!(set.enter("key").is_err());
        }
        assert!(set.enter("key").is_ok());
    }
}
