//! Local persistence of the session record used for silent restoration.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    common::errors::{PartyError, PartyResult},
    protocol::StoredSession,
};

pub trait SessionStorage: Send + Sync {
    /// `Ok(None)` when nothing is stored. A record that exists but cannot be
    /// parsed is a `Validation` error.
    fn load(&self) -> PartyResult<Option<StoredSession>>;

    fn save(&self, session: &StoredSession) -> PartyResult<()>;

    /// Removing a record that does not exist is not an error.
    fn clear(&self) -> PartyResult<()>;
}

/// One JSON file holding the record.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn storage_error(path: &Path, e: std::io::Error) -> PartyError {
    PartyError::Storage(format!("{}: {}", path.display(), e))
}

impl SessionStorage for FileSessionStore {
    fn load(&self) -> PartyResult<Option<StoredSession>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(&self.path, e)),
        };
        let session: StoredSession = serde_json::from_str(&raw).map_err(|e| {
            PartyError::Validation(format!("malformed session record: {}", e))
        })?;
        session.validate()?;
        Ok(Some(session))
    }

    fn save(&self, session: &StoredSession) -> PartyResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| storage_error(parent, e))?;
            }
        }
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| PartyError::Storage(e.to_string()))?;

        // Write-then-rename so a crash never leaves half a record behind.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| storage_error(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| storage_error(&self.path, e))?;
        debug!("saved session {} to {}", session.id, self.path.display());
        Ok(())
    }

    fn clear(&self) -> PartyResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&self.path, e)),
        }
    }
}

/// Keeps the record in memory only.
#[derive(Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<StoredSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<StoredSession> {
        self.record.lock().clone()
    }
}

impl SessionStorage for MemorySessionStore {
    fn load(&self) -> PartyResult<Option<StoredSession>> {
        let record = self.record.lock().clone();
        if let Some(record) = &record {
            record.validate()?;
        }
        Ok(record)
    }

    fn save(&self, session: &StoredSession) -> PartyResult<()> {
        *self.record.lock() = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> PartyResult<()> {
        *self.record.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> StoredSession {
        StoredSession {
            id: "7f3a".into(),
            name: "Ann".into(),
            avatar: "a.png".into(),
            status: "Trenching".into(),
            created_at: 1,
            last_seen: 2,
        }
    }

    #[test]
    fn file_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("nested").join("session.json"));

        assert_eq!(store.load().unwrap(), None);
        store.save(&record()).unwrap();
        assert_eq!(store.load().unwrap(), Some(record()));

        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn malformed_file_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{\"id\": 3").unwrap();

        let store = FileSessionStore::new(&path);
        assert!(matches!(store.load(), Err(PartyError::Validation(_))));

        std::fs::write(&path, serde_json::to_string(&StoredSession { name: "".into(), ..record() }).unwrap())
            .unwrap();
        assert!(matches!(store.load(), Err(PartyError::Validation(_))));
    }

    #[test]
    fn memory_store() {
        let store = MemorySessionStore::new();
        store.save(&record()).unwrap();
        assert_eq!(store.current(), Some(record()));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
