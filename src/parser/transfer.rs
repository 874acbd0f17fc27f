//! Content-Transfer-Encoding decoding.
//!
//! These routines are synchronous and are only ever called from the decode
//! worker (see [`crate::worker`]).

use std::io::{self, Write};

use base64::Engine as _;

use crate::error::{AttachError, Result};
use crate::model::TransferEncoding;

use super::header::hex_pair;

/// A sink that only counts what is written to it.
#[derive(Debug, Default)]
pub struct CountingSink {
    written: u64,
}

impl CountingSink {
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decode `data` from `encoding` into `sink`.
pub fn decode_to<W: Write>(encoding: TransferEncoding, data: &[u8], sink: &mut W) -> Result<()> {
    match encoding {
        TransferEncoding::Base64 => {
            let compact: Vec<u8> = data
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&compact)
                .map_err(|e| AttachError::Decode(format!("invalid base64 payload: {e}")))?;
            sink.write_all(&decoded)?;
        }
        TransferEncoding::QuotedPrintable => {
            sink.write_all(&qp_decode(data))?;
        }
        _ => sink.write_all(data)?,
    }
    Ok(())
}

/// Decode `data` into a fresh buffer.
pub fn decode(encoding: TransferEncoding, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    decode_to(encoding, data, &mut out)?;
    Ok(out)
}

/// Decode quoted-printable (RFC 2045 §6.7).
///
/// Soft line breaks are removed for both `\n` and `\r\n` endings. Invalid
/// escapes pass through untouched.
pub fn qp_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] != b'=' {
            out.push(data[i]);
            i += 1;
            continue;
        }

        let rest = &data[i + 1..];
        if rest.starts_with(b"\r\n") {
            i += 3;
        } else if rest.starts_with(b"\n") {
            i += 2;
        } else if let Some(byte) = hex_pair(rest) {
            out.push(byte);
            i += 3;
        } else {
            out.push(b'=');
            i += 1;
        }
    }
    out
}
