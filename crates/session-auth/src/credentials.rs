//! Credential storage for the session's access and refresh values
//!
//! The store holds exactly two opaque strings. It can live purely in memory
//! or be backed by a JSON file; file writes use atomic temp-file + rename so
//! a crash mid-write never leaves a truncated credential file behind.
//!
//! All operations are synchronous. A `std::sync::Mutex` guards the in-memory
//! state and is never held across an await point, so the store is safe to
//! call from request completion paths on any runtime thread.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Which of the two stored credentials an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Access,
    Refresh,
}

impl CredentialKind {
    pub fn label(&self) -> &'static str {
        match self {
            CredentialKind::Access => "access",
            CredentialKind::Refresh => "refresh",
        }
    }
}

/// An access credential plus the refresh credential issued with it.
///
/// `refresh` is `None` when the server declined to rotate; storing such a
/// pair keeps whatever refresh value was already present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access: Secret<String>,
    pub refresh: Option<Secret<String>>,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: Some(Secret::new(refresh.into())),
        }
    }
}

/// On-disk shape. Plain strings, only ever touched inside this module.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

#[derive(Default)]
struct Slots {
    access: Option<Secret<String>>,
    refresh: Option<Secret<String>>,
}

impl Slots {
    fn slot(&self, kind: CredentialKind) -> &Option<Secret<String>> {
        match kind {
            CredentialKind::Access => &self.access,
            CredentialKind::Refresh => &self.refresh,
        }
    }

    fn slot_mut(&mut self, kind: CredentialKind) -> &mut Option<Secret<String>> {
        match kind {
            CredentialKind::Access => &mut self.access,
            CredentialKind::Refresh => &mut self.refresh,
        }
    }

    fn to_stored(&self) -> StoredCredentials {
        StoredCredentials {
            access_token: self.access.as_ref().map(|s| s.expose().clone()),
            refresh_token: self.refresh.as_ref().map(|s| s.expose().clone()),
        }
    }
}

/// Process-local holder for the access and refresh credentials.
pub struct CredentialStore {
    path: Option<PathBuf>,
    state: Mutex<Slots>,
}

impl CredentialStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(Slots::default()),
        }
    }

    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` so the session starts
    /// logged out and later writes don't need the cold-start path.
    pub fn load(path: PathBuf) -> Result<Self> {
        let stored = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let stored: StoredCredentials = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(
                path = %path.display(),
                has_access = stored.access_token.is_some(),
                has_refresh = stored.refresh_token.is_some(),
                "loaded credentials"
            );
            stored
        } else {
            info!(path = %path.display(), "credential file not found, starting logged out");
            let stored = StoredCredentials::default();
            write_atomic(&path, &stored)?;
            stored
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(Slots {
                access: stored.access_token.map(Secret::new),
                refresh: stored.refresh_token.map(Secret::new),
            }),
        })
    }

    /// Current value of one credential, if present.
    pub fn get(&self, kind: CredentialKind) -> Option<Secret<String>> {
        self.lock().slot(kind).clone()
    }

    /// Replace one credential.
    ///
    /// The in-memory value is updated before persisting, so a failed disk
    /// write still leaves the process with the new value.
    pub fn set(&self, kind: CredentialKind, value: impl Into<String>) -> Result<()> {
        let mut state = self.lock();
        *state.slot_mut(kind) = Some(Secret::new(value.into()));
        debug!(kind = kind.label(), "stored credential");
        self.persist(&state)
    }

    /// Store a freshly issued pair under one lock acquisition.
    ///
    /// A pair without a refresh credential leaves the existing refresh value
    /// untouched.
    pub fn store_pair(&self, pair: &CredentialPair) -> Result<()> {
        let mut state = self.lock();
        state.access = Some(pair.access.clone());
        if let Some(refresh) = &pair.refresh {
            state.refresh = Some(refresh.clone());
        }
        debug!(rotated = pair.refresh.is_some(), "stored credential pair");
        self.persist(&state)
    }

    /// Drop both credentials.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock();
        state.access = None;
        state.refresh = None;
        debug!("cleared credentials");
        self.persist(&state)
    }

    /// Whether neither credential is present.
    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.access.is_none() && state.refresh.is_none()
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // Slots are plain Options; a panic elsewhere can't leave them half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &Slots) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, &state.to_stored()),
            None => Ok(()),
        }
    }
}

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains bearer credentials.
fn write_atomic(path: &Path, data: &StoredCredentials) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes())
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&tmp_path, perms)
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposed(store: &CredentialStore, kind: CredentialKind) -> Option<String> {
        store.get(kind).map(|s| s.expose().clone())
    }

    #[test]
    fn in_memory_get_set_clear() {
        let store = CredentialStore::in_memory();
        assert!(store.is_empty());
        assert!(store.get(CredentialKind::Access).is_none());

        store.set(CredentialKind::Access, "A1").unwrap();
        store.set(CredentialKind::Refresh, "R1").unwrap();
        assert_eq!(exposed(&store, CredentialKind::Access).as_deref(), Some("A1"));
        assert_eq!(exposed(&store, CredentialKind::Refresh).as_deref(), Some("R1"));

        store.clear().unwrap();
        assert!(store.is_empty());
        assert!(store.get(CredentialKind::Refresh).is_none());
    }

    #[test]
    fn store_pair_rotates_both_values() {
        let store = CredentialStore::in_memory();
        store.store_pair(&CredentialPair::new("A1", "R1")).unwrap();
        store.store_pair(&CredentialPair::new("A2", "R2")).unwrap();

        assert_eq!(exposed(&store, CredentialKind::Access).as_deref(), Some("A2"));
        assert_eq!(exposed(&store, CredentialKind::Refresh).as_deref(), Some("R2"));
    }

    #[test]
    fn store_pair_without_refresh_keeps_existing_refresh() {
        let store = CredentialStore::in_memory();
        store.store_pair(&CredentialPair::new("A1", "R1")).unwrap();

        let access_only = CredentialPair {
            access: Secret::from("A2"),
            refresh: None,
        };
        store.store_pair(&access_only).unwrap();

        assert_eq!(exposed(&store, CredentialKind::Access).as_deref(), Some("A2"));
        assert_eq!(exposed(&store, CredentialKind::Refresh).as_deref(), Some("R1"));
    }

    #[test]
    fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::load(path.clone()).unwrap();
        store.store_pair(&CredentialPair::new("at_1", "rt_1")).unwrap();

        let reloaded = CredentialStore::load(path).unwrap();
        assert_eq!(exposed(&reloaded, CredentialKind::Access).as_deref(), Some("at_1"));
        assert_eq!(exposed(&reloaded, CredentialKind::Refresh).as_deref(), Some("rt_1"));
    }

    #[test]
    fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        assert!(!path.exists());
        let store = CredentialStore::load(path.clone()).unwrap();
        assert!(store.is_empty());
        assert!(path.exists());

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, serde_json::json!({}));
    }

    #[test]
    fn clear_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::load(path.clone()).unwrap();
        store.store_pair(&CredentialPair::new("at_1", "rt_1")).unwrap();
        store.clear().unwrap();

        let reloaded = CredentialStore::load(path).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = CredentialStore::load(path);
        assert!(matches!(result, Err(Error::CredentialParse(_))));
    }

    #[cfg(unix)]
    #[test]
    fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::load(path.clone()).unwrap();
        store.set(CredentialKind::Refresh, "rt_1").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[test]
    fn concurrent_writers_leave_a_consistent_pair() {
        let store = std::sync::Arc::new(CredentialStore::in_memory());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .store_pair(&CredentialPair::new(format!("A{i}"), format!("R{i}")))
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let access = exposed(&store, CredentialKind::Access).unwrap();
        let refresh = exposed(&store, CredentialKind::Refresh).unwrap();
        assert_eq!(access[1..], refresh[1..], "pair must come from one writer");
    }
}
