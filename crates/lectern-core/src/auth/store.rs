//! Durable key/value slots the session is mirrored into.
//!
//! The session never reads back what it wrote except in
//! [`Session::init_from_store`](super::Session::init_from_store), so a store
//! only needs string get/set/remove plus a batched write for updates that
//! must land together.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use keyring::Entry;
use thiserror::Error;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const LAST_VALIDATED_KEY: &str = "last_validated";
pub const USER_KEY: &str = "user";

/// Every key a session writes. Logout removes all of them.
pub const SESSION_KEYS: [&str; 4] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    LAST_VALIDATED_KEY,
    USER_KEY,
];

/// Session file name in the cache directory
const SESSION_FILE: &str = "session.json";

/// Keychain service name
const SERVICE_NAME: &str = "lectern";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session file is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain access failed: {0}")]
    Keyring(#[from] keyring::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A pending change in a batched write: `Some` sets the key, `None` removes it.
pub type StoreEntry<'a> = (&'a str, Option<&'a str>);

pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    fn remove(&self, key: &str) -> StoreResult<()>;

    /// Apply several changes as one durable write.
    ///
    /// The default applies them one by one; stores that can do better
    /// (a single file rewrite, a single lock) override it.
    fn write_batch(&self, entries: &[StoreEntry<'_>]) -> StoreResult<()> {
        for (key, value) in entries {
            match value {
                Some(value) => self.set(key, value)?,
                None => self.remove(key)?,
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store. Nothing survives a restart; counts durable writes so
/// callers can check how often they hit storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set`, `remove` and `write_batch` calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        lock(&self.entries).remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_batch(&self, entries: &[StoreEntry<'_>]) -> StoreResult<()> {
        let mut map = lock(&self.entries);
        for (key, value) in entries {
            match value {
                Some(value) => {
                    map.insert(key.to_string(), value.to_string());
                }
                None => {
                    map.remove(*key);
                }
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// File store
// ============================================================================

/// JSON file in the cache directory holding every session key.
///
/// The whole file is replaced on each change through a temp file and a
/// rename, so readers see either the old map or the new one. An empty map
/// removes the file.
pub struct FileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStore {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            path: cache_dir.as_ref().join(SESSION_FILE),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> StoreResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Current map as the base for a write. A file that no longer parses
    /// holds nothing worth keeping, so it is treated as empty and replaced.
    fn read_for_update(&self) -> StoreResult<BTreeMap<String, String>> {
        match self.read_all() {
            Err(StoreError::Serialization(e)) => {
                warn!(path = ?self.path, error = %e, "Discarding unreadable session file");
                Ok(BTreeMap::new())
            }
            other => other,
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> StoreResult<()> {
        if entries.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
                debug!(path = ?self.path, "Removed empty session file");
            }
            return Ok(());
        }
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let contents = serde_json::to_string_pretty(entries)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let _guard = lock(&self.guard);
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.write_batch(&[(key, Some(value))])
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.write_batch(&[(key, None)])
    }

    fn write_batch(&self, entries: &[StoreEntry<'_>]) -> StoreResult<()> {
        let _guard = lock(&self.guard);
        let mut map = self.read_for_update()?;
        for (key, value) in entries {
            match value {
                Some(value) => {
                    map.insert(key.to_string(), value.to_string());
                }
                None => {
                    map.remove(*key);
                }
            }
        }
        self.write_all(&map)
    }
}

// ============================================================================
// Keychain store
// ============================================================================

/// OS keychain, one entry per session key under the `lectern` service.
#[derive(Debug, Default)]
pub struct KeyringStore;

impl KeyringStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(key: &str) -> StoreResult<Entry> {
        Ok(Entry::new(SERVICE_NAME, key)?)
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match Self::entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        Self::entry(key)?.set_password(value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        match Self::entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
