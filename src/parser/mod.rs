//! Mail-format handling: transfer-encoding decoding, RFC 2047 header
//! words, and whole-message helpers.

pub mod header;
pub mod mime;
pub mod transfer;
