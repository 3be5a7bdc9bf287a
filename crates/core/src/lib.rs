//! `tuyau-core`: the normalized change event model.
//!
//! This crate contains **pure data** (no I/O, no bus or feed concerns).

pub mod error;
pub mod event;
pub mod id;

pub use error::MalformedNotification;
pub use event::{ChangeEvent, DocumentKey, Namespace, OperationType};
pub use id::{InvalidId, ProducerIdentity, ResumeToken};
