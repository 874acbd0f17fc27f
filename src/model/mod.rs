//! Data model: content parts and derived metadata.

pub mod content;
pub mod metadata;

pub use content::{ContentPart, Disposition, TransferEncoding};
pub use metadata::Metadata;
