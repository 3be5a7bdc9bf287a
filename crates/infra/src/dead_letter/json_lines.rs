//! Append-only JSON-lines dead-letter file. One [`DeadLetter`] per line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use super::{DeadLetter, DeadLetterError, DeadLetterSink};

#[derive(Debug)]
pub struct JsonLinesDeadLetterSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonLinesDeadLetterSink {
    /// The file is created on the first quarantined notification.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every letter written so far.
    pub fn read_all(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DeadLetterError::Storage(e.to_string())),
        };

        let mut letters = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| DeadLetterError::Storage(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let letter = serde_json::from_str(&line)
                .map_err(|e| DeadLetterError::Serialization(e.to_string()))?;
            letters.push(letter);
        }
        Ok(letters)
    }
}

impl DeadLetterSink for JsonLinesDeadLetterSink {
    fn quarantine(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(&letter)
            .map_err(|e| DeadLetterError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut guard = self
            .file
            .lock()
            .map_err(|_| DeadLetterError::Storage("lock poisoned".to_string()))?;

        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| DeadLetterError::Storage(e.to_string()))?;
            *guard = Some(file);
        }

        let Some(file) = guard.as_mut() else {
            return Err(DeadLetterError::Storage("dead-letter file unavailable".to_string()));
        };
        file.write_all(&line)
            .and_then(|_| file.sync_data())
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        warn!(
            letter_id = %letter.id,
            feed = %letter.feed,
            reason = %letter.reason,
            path = %self.path.display(),
            "notification sent to dead-letter file"
        );
        Ok(())
    }
}
