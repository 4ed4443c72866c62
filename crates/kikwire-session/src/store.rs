//! Session stores: where a [`Session`] lives between runs.
//!
//! The client talks to storage only through the [`SessionStore`] trait,
//! so tests can hand it a [`MemoryStore`] while real deployments use a
//! [`JsonFileStore`] (or their own database-backed implementation).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Session, SessionError};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Durable mapping from account id to [`Session`].
///
/// # Trait bounds
///
/// - `Send + Sync + 'static`: the store is moved into the client's
///   connection task and lives as long as the client.
///
/// # Example
///
/// ```rust
/// use kikwire_session::{MemoryStore, SessionStore};
///
/// let store = MemoryStore::new();
/// let session = store.load_or_create("alice").unwrap();
/// assert!(session.node.is_none());
///
/// // A second load returns the same device ids.
/// assert_eq!(store.load_or_create("alice").unwrap(), session);
/// ```
pub trait SessionStore: Send + Sync + 'static {
    /// Reads the stored session, or `None` if the account has none yet.
    ///
    /// # Errors
    /// Returns [`SessionError`] if storage can't be read or decoded.
    fn load(&self, account: &str) -> Result<Option<Session>, SessionError>;

    /// Writes the full session, replacing any previous one.
    ///
    /// # Errors
    /// Returns [`SessionError`] if storage can't be written.
    fn save(&self, account: &str, session: &Session) -> Result<(), SessionError>;

    /// Loads the stored session or, for an unknown account, generates a
    /// fresh one and saves it immediately.
    ///
    /// # Errors
    /// Propagates errors from [`load`](Self::load) and
    /// [`save`](Self::save).
    fn load_or_create(&self, account: &str) -> Result<Session, SessionError> {
        if let Some(session) = self.load(account)? {
            tracing::debug!(account, has_node = session.has_node(), "session loaded");
            return Ok(session);
        }
        let session = Session::fresh();
        self.save(account, &session)?;
        tracing::info!(account, "created fresh session");
        Ok(session)
    }
}

fn validate_account(account: &str) -> Result<(), SessionError> {
    if account.is_empty() || account.contains(['/', '\\']) || account == "." || account == ".." {
        return Err(SessionError::InvalidAccount(account.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Process-local store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with one account's session.
    pub fn with_session(account: impl Into<String>, session: Session) -> Self {
        let store = Self::new();
        store.lock().insert(account.into(), session);
        store
    }

    // Inserts are whole values, so a poisoned map is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, account: &str) -> Result<Option<Session>, SessionError> {
        validate_account(account)?;
        Ok(self.lock().get(account).cloned())
    }

    fn save(&self, account: &str, session: &Session) -> Result<(), SessionError> {
        validate_account(account)?;
        self.lock().insert(account.to_string(), session.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFileStore
// ---------------------------------------------------------------------------

/// One pretty-printed JSON file per account: `<dir>/<account>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Stores sessions under `dir`. The directory is created on the
    /// first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, account: &str) -> Result<PathBuf, SessionError> {
        validate_account(account)?;
        Ok(self.dir.join(format!("{account}.json")))
    }
}

fn io_error(path: &Path, source: io::Error) -> SessionError {
    SessionError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self, account: &str) -> Result<Option<Session>, SessionError> {
        let path = self.path_for(account)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn save(&self, account: &str, session: &Session) -> Result<(), SessionError> {
        let path = self.path_for(account)?;
        fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let json = serde_json::to_string_pretty(session)?;

        // Write-then-rename: readers never see a truncated record.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))?;

        tracing::debug!(account, path = %path.display(), "session saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_load_unknown_account_returns_none() {
        let store = MemoryStore::new();
        assert_eq!(store.load("alice").unwrap(), None);
    }

    #[test]
    fn test_memory_store_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        let session = Session::fresh().with_node("n1");
        store.save("alice", &session).unwrap();
        assert_eq!(other.load("alice").unwrap(), Some(session));
    }

    #[test]
    fn test_load_or_create_persists_fresh_session() {
        let store = MemoryStore::new();
        let created = store.load_or_create("alice").unwrap();
        assert_eq!(store.load("alice").unwrap(), Some(created.clone()));
        assert_eq!(store.load_or_create("alice").unwrap(), created);
    }

    #[test]
    fn test_invalid_account_ids_rejected() {
        let store = MemoryStore::new();
        for bad in ["", "a/b", "..", r"a\b"] {
            assert!(
                matches!(store.load(bad), Err(SessionError::InvalidAccount(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_json_file_store_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("sessions"));
        assert_eq!(store.load("alice").unwrap(), None);

        let session = Session::fresh().with_node("node123@talk.kik.com");
        store.save("alice", &session).unwrap();

        let reopened = JsonFileStore::new(dir.path().join("sessions"));
        assert_eq!(reopened.load("alice").unwrap(), Some(session));
        assert!(dir.path().join("sessions/alice.json").exists());
        assert!(!dir.path().join("sessions/alice.json.tmp").exists());
    }

    #[test]
    fn test_json_file_store_corrupt_file_is_serialize_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alice.json"), "{not json").unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(matches!(store.load("alice"), Err(SessionError::Serialize(_))));
    }
}
