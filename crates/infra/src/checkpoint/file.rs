//! File-backed checkpoint store.
//!
//! All feeds live in one JSON object (`{"feed": "token", ...}`). Every save
//! rewrites the whole file through a temporary sibling and an atomic rename,
//! so a crash mid-write leaves the previous checkpoint intact.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use tuyau_core::ResumeToken;

use super::{CheckpointError, CheckpointStore};

type CheckpointMap = BTreeMap<String, ResumeToken>;

#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<CheckpointMap, CheckpointError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CheckpointMap::new()),
            Err(e) => return Err(CheckpointError::Storage(e.to_string())),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(CheckpointMap::new());
        }

        serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt(e.to_string()))
    }

    fn write_map(&self, map: &CheckpointMap) -> Result<(), CheckpointError> {
        let bytes =
            serde_json::to_vec_pretty(map).map_err(|e| CheckpointError::Storage(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(|e| CheckpointError::Storage(e.to_string()))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;

        fs::rename(&tmp, &self.path).map_err(|e| CheckpointError::Storage(e.to_string()))
    }

    fn update(&self, f: impl FnOnce(&mut CheckpointMap)) -> Result<(), CheckpointError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?;

        let mut map = self.read_map()?;
        f(&mut map);
        self.write_map(&map)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, feed: &str) -> Result<Option<ResumeToken>, CheckpointError> {
        Ok(self.read_map()?.remove(feed))
    }

    fn save(&self, feed: &str, position: &ResumeToken) -> Result<(), CheckpointError> {
        self.update(|map| {
            map.insert(feed.to_string(), position.clone());
        })?;
        debug!(feed, position = %position, path = %self.path.display(), "checkpoint saved");
        Ok(())
    }

    fn clear(&self, feed: &str) -> Result<(), CheckpointError> {
        self.update(|map| {
            map.remove(feed);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> ResumeToken {
        ResumeToken::new(s).unwrap()
    }

    #[test]
    fn missing_file_means_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints.json"));

        assert_eq!(store.load("orders").unwrap(), None);
    }

    #[test]
    fn checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");

        let store = FileCheckpointStore::new(&path);
        store.save("orders", &token("1")).unwrap();
        store.save("users", &token("u9")).unwrap();
        store.save("orders", &token("2")).unwrap();
        drop(store);

        let reopened = FileCheckpointStore::new(&path);
        assert_eq!(reopened.load("orders").unwrap(), Some(token("2")));
        assert_eq!(reopened.load("users").unwrap(), Some(token("u9")));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn clear_removes_only_that_feed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints.json"));
        store.save("a", &token("1")).unwrap();
        store.save("b", &token("2")).unwrap();

        store.clear("a").unwrap();

        assert_eq!(store.load("a").unwrap(), None);
        assert_eq!(store.load("b").unwrap(), Some(token("2")));
    }

    #[test]
    fn garbage_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        fs::write(&path, b"not json").unwrap();

        let store = FileCheckpointStore::new(&path);
        assert!(matches!(store.load("a"), Err(CheckpointError::Corrupt(_))));
    }
}
