//! Metadata derived from a source file or a content part.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the UI shows about an attachment.
///
/// Filled in by a load: from the filesystem for file sources, from the
/// decoded payload for in-memory parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Name shown to the user and used as the default save name.
    pub display_name: String,

    /// Lower-cased MIME type (e.g. `"image/jpeg"`).
    pub content_type: String,

    /// Decoded size in bytes.
    pub size: u64,

    pub description: Option<String>,

    /// Freedesktop icon name derived from the content type.
    pub icon: String,

    /// Path of a thumbnail image, when one is available.
    pub thumbnail_path: Option<PathBuf>,

    /// Modification time of the source file.
    pub modified: Option<DateTime<Utc>>,

    /// An attached message carrying the mail-note marker.
    #[serde(default)]
    pub mail_note: bool,
}

impl Metadata {
    pub fn new(display_name: impl Into<String>, content_type: impl Into<String>, size: u64) -> Self {
        let content_type = content_type.into();
        Self {
            display_name: display_name.into(),
            icon: icon_name_for(&content_type),
            content_type,
            size,
            description: None,
            thumbnail_path: None,
            modified: None,
            mail_note: false,
        }
    }
}

/// Freedesktop icon name for a MIME type.
///
/// `image/png` → `image-png`; families without a specific icon fall back
/// to their generic names (`image-x-generic`, `text-x-generic`, …).
pub fn icon_name_for(content_type: &str) -> String {
    let mime = content_type.to_ascii_lowercase();
    let (major, _) = mime.split_once('/').unwrap_or((mime.as_str(), ""));

    match major {
        "text" | "image" | "audio" | "video" | "font" => {
            if mime == "text/plain" || mime == "text/html" || mime == "image/png" || mime == "image/jpeg" {
                mime.replace('/', "-")
            } else {
                format!("{major}-x-generic")
            }
        }
        "message" => "mail-message".to_string(),
        "inode" if mime == "inode/directory" => "folder".to_string(),
        _ => match mime.as_str() {
            "application/zip" | "application/x-tar" | "application/gzip" | "application/x-gzip"
            | "application/x-compressed-tar" => "package-x-generic".to_string(),
            "application/pdf" => "application-pdf".to_string(),
            _ => "application-x-generic".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icon_names() {
        assert_eq!(icon_name_for("image/png"), "image-png");
        assert_eq!(icon_name_for("image/webp"), "image-x-generic");
        assert_eq!(icon_name_for("TEXT/PLAIN"), "text-plain");
        assert_eq!(icon_name_for("message/rfc822"), "mail-message");
        assert_eq!(icon_name_for("application/zip"), "package-x-generic");
        assert_eq!(icon_name_for("application/x-whatever"), "application-x-generic");
    }

    #[test]
    fn test_new_sets_icon() {
        let meta = Metadata::new("a.pdf", "application/pdf", 12);
        assert_eq!(meta.icon, "application-pdf");
        assert_eq!(meta.size, 12);
        assert!(meta.thumbnail_path.is_none());
    }
}
