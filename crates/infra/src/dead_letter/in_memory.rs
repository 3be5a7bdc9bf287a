use std::sync::{Arc, Mutex};

use super::{DeadLetter, DeadLetterError, DeadLetterSink};

/// In-memory dead-letter sink for tests/dev. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn quarantine(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        self.letters
            .lock()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))?
            .push(letter);
        Ok(())
    }
}
