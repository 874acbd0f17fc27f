//! Whole-message helpers: listing a message's attachments as content
//! parts and wrapping a message as an attachment of its own.

use mail_parser::{MessageParser, MimeHeaders};

use crate::model::{ContentPart, Disposition, TransferEncoding};

/// Description prefix of a forwarded message.
const ATTACHED_MESSAGE: &str = "Attached message";

/// Every attachment of a raw RFC 5322 message, decoded.
///
/// Unparseable input yields no parts.
pub fn attachments_from_message(raw_message: &[u8]) -> Vec<ContentPart> {
    let message_bytes = skip_from_line(raw_message);
    let Some(msg) = MessageParser::default().parse(message_bytes) else {
        return Vec::new();
    };

    let mut result = Vec::new();

    for (idx, part) in msg.attachments().enumerate() {
        let content_type = part
            .content_type()
            .map(|ct: &mail_parser::ContentType| {
                let main = ct.ctype();
                let mut full = match ct.subtype() {
                    Some(sub) => format!("{main}/{sub}"),
                    None => main.to_string(),
                };
                if let Some(charset) = ct.attribute("charset") {
                    full.push_str(&format!("; charset={charset}"));
                }
                full
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let disposition = part
            .content_disposition()
            .map(|d: &mail_parser::ContentType| Disposition::parse(d.ctype()))
            .unwrap_or(Disposition::Attachment);

        let filename = part
            .attachment_name()
            .map(String::from)
            .unwrap_or_else(|| format!("attachment_{idx}"));

        let mut content = ContentPart::new(content_type, part.contents().to_vec())
            .with_filename(filename)
            .with_disposition(disposition)
            // mail-parser hands out decoded contents
            .with_encoding(TransferEncoding::Binary);
        if let Some(description) = part.content_description() {
            content = content.with_description(description);
        }
        result.push(content);
    }

    result
}

/// Wrap a whole message as an inline `message/rfc822` part.
///
/// The description reads `Attached message - <Subject>` when the message
/// has a subject.
pub fn message_part(raw_message: &[u8]) -> ContentPart {
    let message_bytes = skip_from_line(raw_message);
    let description = match subject_of(message_bytes) {
        Some(subject) => format!("{ATTACHED_MESSAGE} - {subject}"),
        None => ATTACHED_MESSAGE.to_string(),
    };

    ContentPart::new("message/rfc822", message_bytes.to_vec())
        .with_disposition(Disposition::Inline)
        .with_description(description)
        .with_encoding(TransferEncoding::preferred_for("message/rfc822", message_bytes))
}

/// Decoded, non-empty `Subject:` of a raw message.
pub fn subject_of(raw_message: &[u8]) -> Option<String> {
    let msg = MessageParser::default().parse(skip_from_line(raw_message))?;
    msg.subject()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// `true` if the top-level header block of `raw_message` has a `name:` field.
pub fn has_header(raw_message: &[u8], name: &str) -> bool {
    let message_bytes = skip_from_line(raw_message);
    for line in message_bytes.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            if line[..colon].trim_ascii().eq_ignore_ascii_case(name.as_bytes()) {
                return true;
            }
        }
    }
    false
}

/// Skip the `From ` separator line at the start of MBOX messages.
fn skip_from_line(data: &[u8]) -> &[u8] {
    // Handle BOM
    let data = if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &data[3..]
    } else {
        data
    };

    if data.starts_with(b"From ") {
        if let Some(pos) = data.iter().position(|&b| b == b'\n') {
            return &data[pos + 1..];
        }
    }
    data
}
