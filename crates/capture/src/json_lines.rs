//! Newline-delimited JSON change feed.
//!
//! Reads one extended-JSON change event per line from a file, e.g. the output
//! of a shell that tails a database change stream into a log. The file is
//! re-opened on every `connect`, so resuming re-scans it for the token.
//!
//! A line that is not valid JSON is handed on as a JSON string so that the
//! normalizer reports it as malformed instead of it vanishing here.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tuyau_core::ResumeToken;

use crate::notification::RawNotification;
use crate::source::{resume_index, ChangeFeedSource, ChangeStream, SourceError};

const FOLLOW_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct JsonLinesChangeFeed {
    path: PathBuf,
    follow: bool,
}

impl JsonLinesChangeFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            follow: false,
        }
    }

    /// Keep waiting for appended lines at end of file instead of ending the stream.
    pub fn following(mut self) -> Self {
        self.follow = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<BufReader<File>, SourceError> {
        File::open(&self.path)
            .map(BufReader::new)
            .map_err(|e| SourceError::Connect(format!("{}: {e}", self.path.display())))
    }
}

impl ChangeFeedSource for JsonLinesChangeFeed {
    type Stream = JsonLinesStream;

    fn connect(&self, resume_from: Option<&ResumeToken>) -> Result<Self::Stream, SourceError> {
        // First pass finds how many lines to skip, second pass positions the reader.
        let skip = match resume_from {
            None => 0,
            Some(_) => {
                let mut scan = JsonLinesStream::new(self.open()?, false);
                let positions = scan.read_all()?.into_iter().map(|n| n.position());
                resume_index(positions, resume_from)?
            }
        };

        let mut stream = JsonLinesStream::new(self.open()?, self.follow);
        let cancel = CancellationToken::new();
        for _ in 0..skip {
            stream.read_one(&cancel, false)?;
        }

        debug!(path = %self.path.display(), skipped = skip, "json-lines feed connected");
        Ok(stream)
    }
}

#[derive(Debug)]
pub struct JsonLinesStream {
    reader: BufReader<File>,
    pending: String,
    follow: bool,
    last_acknowledged: Option<ResumeToken>,
}

impl JsonLinesStream {
    fn new(reader: BufReader<File>, follow: bool) -> Self {
        Self {
            reader,
            pending: String::new(),
            follow,
            last_acknowledged: None,
        }
    }

    pub fn last_acknowledged(&self) -> Option<&ResumeToken> {
        self.last_acknowledged.as_ref()
    }

    fn read_all(&mut self) -> Result<Vec<RawNotification>, SourceError> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        while let Some(n) = self.read_one(&cancel, false)? {
            out.push(n);
        }
        Ok(out)
    }

    fn read_one(
        &mut self,
        cancel: &CancellationToken,
        follow: bool,
    ) -> Result<Option<RawNotification>, SourceError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let read = self
                .reader
                .read_line(&mut self.pending)
                .map_err(|e| SourceError::Disconnected(e.to_string()))?;

            let complete = self.pending.ends_with('\n');
            if read == 0 || !complete {
                // A partial trailing line may still be in the middle of being written.
                if follow {
                    thread::sleep(FOLLOW_POLL);
                    continue;
                }
                if self.pending.trim().is_empty() {
                    self.pending.clear();
                    return Ok(None);
                }
            }

            let line = std::mem::take(&mut self.pending);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let value = serde_json::from_str::<JsonValue>(line)
                .unwrap_or_else(|_| JsonValue::String(line.to_string()));
            return Ok(Some(RawNotification::new(value)));
        }
    }
}

impl ChangeStream for JsonLinesStream {
    fn next(&mut self, cancel: &CancellationToken) -> Result<Option<RawNotification>, SourceError> {
        let follow = self.follow;
        self.read_one(cancel, follow)
    }

    fn acknowledge(&mut self, position: &ResumeToken) -> Result<(), SourceError> {
        self.last_acknowledged = Some(position.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_feed(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn ids(stream: &mut JsonLinesStream) -> Vec<Option<String>> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        while let Some(n) = stream.next(&cancel).unwrap() {
            out.push(n.position().map(ResumeToken::into_string));
        }
        out
    }

    #[test]
    fn reads_lines_in_order_skipping_blanks() {
        let file = write_feed(&[r#"{"_id":"1"}"#, "", r#"{"_id":"2"}"#]);
        let feed = JsonLinesChangeFeed::new(file.path());

        let mut stream = feed.connect(None).unwrap();
        assert_eq!(ids(&mut stream), vec![Some("1".into()), Some("2".into())]);
    }

    #[test]
    fn resumes_after_token() {
        let file = write_feed(&[r#"{"_id":"1"}"#, r#"{"_id":"2"}"#, r#"{"_id":"3"}"#]);
        let feed = JsonLinesChangeFeed::new(file.path());
        let token = ResumeToken::new("2").unwrap();

        let mut stream = feed.connect(Some(&token)).unwrap();
        assert_eq!(ids(&mut stream), vec![Some("3".into())]);
    }

    #[test]
    fn invalid_json_is_passed_on_as_a_string() {
        let file = write_feed(&["{broken"]);
        let feed = JsonLinesChangeFeed::new(file.path());

        let mut stream = feed.connect(None).unwrap();
        let n = stream.next(&CancellationToken::new()).unwrap().unwrap();
        assert_eq!(n.as_json(), &JsonValue::String("{broken".into()));
    }

    #[test]
    fn missing_file_fails_to_connect() {
        let feed = JsonLinesChangeFeed::new("/nonexistent/tuyau-feed.jsonl");
        assert!(matches!(feed.connect(None), Err(SourceError::Connect(_))));
    }

    #[test]
    fn last_line_without_newline_is_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"_id":"1"}}"#).unwrap();
        file.flush().unwrap();

        let mut stream = JsonLinesChangeFeed::new(file.path()).connect(None).unwrap();
        assert_eq!(ids(&mut stream), vec![Some("1".into())]);
    }
}
