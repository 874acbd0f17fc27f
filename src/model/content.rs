//! In-memory attachment payload.
//!
//! A [`ContentPart`] keeps its bytes exactly as they would travel inside a
//! message, i.e. still wrapped in their transfer encoding. Decoding happens
//! on the decode worker (see [`crate::worker`]).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// How a part should be presented by a mail reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Inline,
    #[default]
    Attachment,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Inline => "inline",
            Disposition::Attachment => "attachment",
        }
    }

    /// Parse a `Content-Disposition` value; unknown values are attachments.
    pub fn parse(value: &str) -> Self {
        let main = value.split(';').next().unwrap_or("").trim();
        if main.eq_ignore_ascii_case("inline") {
            Disposition::Inline
        } else {
            Disposition::Attachment
        }
    }
}

/// Content-Transfer-Encoding of the stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferEncoding {
    #[serde(rename = "7bit")]
    SevenBit,
    #[serde(rename = "8bit")]
    EightBit,
    #[default]
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "base64")]
    Base64,
    #[serde(rename = "quoted-printable")]
    QuotedPrintable,
}

impl TransferEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::EightBit => "8bit",
            TransferEncoding::Binary => "binary",
            TransferEncoding::Base64 => "base64",
            TransferEncoding::QuotedPrintable => "quoted-printable",
        }
    }

    /// Parse a header value; unknown encodings are treated as binary.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "7bit" => TransferEncoding::SevenBit,
            "8bit" => TransferEncoding::EightBit,
            "base64" => TransferEncoding::Base64,
            "quoted-printable" => TransferEncoding::QuotedPrintable,
            _ => TransferEncoding::Binary,
        }
    }

    /// `true` if the stored bytes are the payload itself.
    pub fn is_identity(&self) -> bool {
        !matches!(
            self,
            TransferEncoding::Base64 | TransferEncoding::QuotedPrintable
        )
    }

    /// The encoding a composer should use for `decoded` bytes of `mime_type`.
    ///
    /// Short-line ASCII text goes out as 7bit, other text as
    /// quoted-printable, attached messages as 7bit or 8bit, and everything
    /// else as base64.
    pub fn preferred_for(mime_type: &str, decoded: &[u8]) -> Self {
        let ascii = decoded.is_ascii() && !decoded.contains(&0);
        let short_lines = decoded.split(|&b| b == b'\n').all(|line| line.len() <= 998);

        if mime_type.eq_ignore_ascii_case("message/rfc822") {
            return if ascii {
                TransferEncoding::SevenBit
            } else {
                TransferEncoding::EightBit
            };
        }

        if mime_type.to_ascii_lowercase().starts_with("text/") {
            if ascii && short_lines {
                TransferEncoding::SevenBit
            } else {
                TransferEncoding::QuotedPrintable
            }
        } else {
            TransferEncoding::Base64
        }
    }
}

/// The in-memory representation of an attachment's payload.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentPart {
    /// Full content type, parameters included (`text/plain; charset=utf-8`).
    pub content_type: String,
    pub disposition: Disposition,
    /// Filename as found in the headers (may still be RFC 2047 encoded).
    pub filename: Option<String>,
    pub description: Option<String>,
    /// Encoding of `data`.
    pub encoding: TransferEncoding,
    /// Raw bytes, still in `encoding`.
    pub data: Arc<[u8]>,
}

impl ContentPart {
    /// A part whose bytes are stored unencoded.
    pub fn new(content_type: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            content_type: content_type.into(),
            disposition: Disposition::Attachment,
            filename: None,
            description: None,
            encoding: TransferEncoding::Binary,
            data: data.into(),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    pub fn with_encoding(mut self, encoding: TransferEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Lower-cased `type/subtype`, without parameters.
    pub fn mime_type(&self) -> String {
        let simple = self
            .content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if simple.contains('/') {
            simple
        } else {
            "application/octet-stream".to_string()
        }
    }

    /// Value of a content-type parameter, unquoted.
    pub fn param(&self, name: &str) -> Option<String> {
        self.content_type.split(';').skip(1).find_map(|p| {
            let (key, value) = p.split_once('=')?;
            if key.trim().eq_ignore_ascii_case(name) {
                Some(value.trim().trim_matches('"').to_string())
            } else {
                None
            }
        })
    }

    /// Charset of a text part, or `default` when absent.
    ///
    /// The returned label is the canonical name known to `encoding_rs`;
    /// unknown labels fall back to UTF-8.
    pub fn charset_or(&self, default: &str) -> String {
        let label = self.param("charset").unwrap_or_else(|| default.to_string());
        encoding_rs::Encoding::for_label(label.as_bytes())
            .unwrap_or(encoding_rs::UTF_8)
            .name()
            .to_ascii_lowercase()
    }

    pub fn is_rfc822(&self) -> bool {
        self.mime_type() == "message/rfc822"
    }

    /// Number of stored (still encoded) bytes.
    pub fn encoded_len(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for ContentPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentPart")
            .field("content_type", &self.content_type)
            .field("disposition", &self.disposition)
            .field("filename", &self.filename)
            .field("description", &self.description)
            .field("encoding", &self.encoding)
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type_and_params() {
        let part = ContentPart::new("Text/Plain; charset=\"ISO-8859-1\"; format=flowed", &b"hi"[..]);
        assert_eq!(part.mime_type(), "text/plain");
        assert_eq!(part.param("charset").as_deref(), Some("ISO-8859-1"));
        assert_eq!(part.param("format").as_deref(), Some("flowed"));
        assert_eq!(part.param("name"), None);
    }

    #[test]
    fn test_bare_type_is_octet_stream() {
        let part = ContentPart::new("garbage", &b""[..]);
        assert_eq!(part.mime_type(), "application/octet-stream");
    }

    #[test]
    fn test_charset_or_default() {
        let part = ContentPart::new("text/plain", &b"x"[..]);
        assert_eq!(part.charset_or("latin1"), "windows-1252");
        assert_eq!(part.charset_or("no-such-charset"), "utf-8");
        let part = ContentPart::new("text/plain; charset=utf-8", &b"x"[..]);
        assert_eq!(part.charset_or("latin1"), "utf-8");
    }

    #[test]
    fn test_disposition_parse() {
        assert_eq!(Disposition::parse("inline; filename=a.png"), Disposition::Inline);
        assert_eq!(Disposition::parse("ATTACHMENT"), Disposition::Attachment);
        assert_eq!(Disposition::parse("weird"), Disposition::Attachment);
    }

    #[test]
    fn test_preferred_encoding() {
        assert_eq!(
            TransferEncoding::preferred_for("text/plain", b"hello\nworld\n"),
            TransferEncoding::SevenBit
        );
        assert_eq!(
            TransferEncoding::preferred_for("text/plain", "caf\u{e9}".as_bytes()),
            TransferEncoding::QuotedPrintable
        );
        assert_eq!(
            TransferEncoding::preferred_for("image/png", b"\x89PNG"),
            TransferEncoding::Base64
        );
        assert_eq!(
            TransferEncoding::preferred_for("message/rfc822", "Subject: \u{e9}".as_bytes()),
            TransferEncoding::EightBit
        );
    }

    #[test]
    fn test_transfer_encoding_parse() {
        assert_eq!(TransferEncoding::parse(" Base64 "), TransferEncoding::Base64);
        assert_eq!(
            TransferEncoding::parse("quoted-printable"),
            TransferEncoding::QuotedPrintable
        );
        assert_eq!(TransferEncoding::parse("x-uuencode"), TransferEncoding::Binary);
        assert!(TransferEncoding::SevenBit.is_identity());
        assert!(!TransferEncoding::Base64.is_identity());
    }
}
