//! Change capture: raw notifications, the feed abstraction and normalization.

pub mod in_memory_feed;
pub mod json_lines;
pub mod normalizer;
pub mod notification;
pub mod source;

pub use in_memory_feed::{InMemoryChangeFeed, InMemoryChangeStream};
pub use json_lines::{JsonLinesChangeFeed, JsonLinesStream};
pub use normalizer::normalize;
pub use notification::RawNotification;
pub use source::{ChangeFeedSource, ChangeStream, SourceError};
