//! `attachflow`: asynchronous load and save of mail attachments.
//!
//! This crate provides the attachment record, the load pipeline (file,
//! directory or in-memory part into memory) and the save pipeline (memory
//! to a file and/or an extracted archive), along with the collaborators
//! they talk to.

pub mod archive;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
mod load;
pub mod model;
pub mod naming;
pub mod parser;
pub mod progress;
pub mod provider;
pub mod record;
mod save;
pub mod worker;

pub use engine::{Engine, EngineBuilder};
pub use error::{failure_notice, AttachError, FailureNotice, Operation, Result};
pub use model::{ContentPart, Disposition, Metadata, TransferEncoding};
pub use record::{AttachmentRecord, SharedRecord, Status};
