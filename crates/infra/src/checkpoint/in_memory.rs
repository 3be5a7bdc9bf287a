use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tuyau_core::ResumeToken;

use super::{CheckpointError, CheckpointStore};

/// In-memory checkpoint store for tests/dev.
///
/// Keeps every saved position per feed so tests can assert how the checkpoint
/// moved, not only where it ended.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<RwLock<HashMap<String, Vec<ResumeToken>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a position already stored for `feed`.
    pub fn with_checkpoint(self, feed: impl Into<String>, position: ResumeToken) -> Self {
        if let Ok(mut map) = self.inner.write() {
            map.insert(feed.into(), vec![position]);
        }
        self
    }

    /// Every position saved for `feed`, oldest first.
    pub fn history(&self, feed: &str) -> Vec<ResumeToken> {
        self.inner
            .read()
            .map(|map| map.get(feed).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self, feed: &str) -> Result<Option<ResumeToken>, CheckpointError> {
        let map = self
            .inner
            .read()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?;
        Ok(map.get(feed).and_then(|history| history.last().cloned()))
    }

    fn save(&self, feed: &str, position: &ResumeToken) -> Result<(), CheckpointError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?;
        map.entry(feed.to_string())
            .or_default()
            .push(position.clone());
        Ok(())
    }

    fn clear(&self, feed: &str) -> Result<(), CheckpointError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| CheckpointError::Storage("lock poisoned".to_string()))?;
        map.remove(feed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> ResumeToken {
        ResumeToken::new(s).unwrap()
    }

    #[test]
    fn load_returns_latest_save() {
        let store = InMemoryCheckpointStore::new();
        assert_eq!(store.load("orders").unwrap(), None);

        store.save("orders", &token("1")).unwrap();
        store.save("orders", &token("2")).unwrap();

        assert_eq!(store.load("orders").unwrap(), Some(token("2")));
        assert_eq!(store.history("orders"), vec![token("1"), token("2")]);
    }

    #[test]
    fn feeds_are_isolated() {
        let store = InMemoryCheckpointStore::new().with_checkpoint("a", token("7"));

        assert_eq!(store.load("a").unwrap(), Some(token("7")));
        assert_eq!(store.load("b").unwrap(), None);

        store.clear("a").unwrap();
        assert_eq!(store.load("a").unwrap(), None);
    }
}
