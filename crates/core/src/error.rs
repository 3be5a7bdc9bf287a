//! Data-quality error model.

use thiserror::Error;

use crate::id::ResumeToken;

/// A raw change notification that could not be turned into a [`ChangeEvent`].
///
/// Keep this focused on deterministic input defects. The same notification
/// always yields the same error, so retrying is pointless; the notification
/// has to be quarantined or the feed halted.
///
/// [`ChangeEvent`]: crate::ChangeEvent
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed notification: `{field}` {problem}")]
pub struct MalformedNotification {
    field: &'static str,
    problem: String,
    /// Position token, when it could be read before the defect was found.
    position: Option<ResumeToken>,
}

impl MalformedNotification {
    pub fn missing(field: &'static str) -> Self {
        Self {
            field,
            problem: "is missing".to_string(),
            position: None,
        }
    }

    pub fn wrong_shape(field: &'static str, expected: impl Into<String>) -> Self {
        Self {
            field,
            problem: format!("has the wrong shape (expected {})", expected.into()),
            position: None,
        }
    }

    /// Attach the position token of the offending notification.
    pub fn at(mut self, position: ResumeToken) -> Self {
        self.position = Some(position);
        self
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn problem(&self) -> &str {
        &self.problem
    }

    pub fn position(&self) -> Option<&ResumeToken> {
        self.position.as_ref()
    }
}
