//! Strongly-typed identifiers used across the relay.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier rejected at construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {reason}")]
pub struct InvalidId {
    kind: &'static str,
    reason: &'static str,
}

/// Opaque position in a change feed.
///
/// Tokens are issued by the feed and only meaningful to it; the relay never
/// compares them, it only stores the last committed one and hands it back on
/// reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

/// Transactional identity of the bus producer.
///
/// One identity per relay instance. The broker fences any older session that
/// still holds the same identity when a new session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerIdentity(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create an identifier, rejecting empty or blank values.
            pub fn new(value: impl Into<String>) -> Result<Self, InvalidId> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(InvalidId {
                        kind: $name,
                        reason: "must not be empty",
                    });
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(ResumeToken, "resume token");
impl_string_newtype!(ProducerIdentity, "producer identity");
