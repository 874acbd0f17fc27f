//! Collision-free destination names.
//!
//! `report.txt` becomes `report (1).txt`, `report (2).txt`, … and a name
//! without an extension simply gets the counter appended.

use std::path::{Path, PathBuf};

/// Fallback display name for parts that carry no filename.
pub const DEFAULT_FILENAME: &str = "attachment.dat";

/// Name to try for the given attempt.
///
/// Attempt 0 is the name itself. Later attempts insert ` (n)` before the
/// last `.`, or append it when there is no `.`.
pub fn resolve(base: &str, attempt: u32) -> String {
    if attempt == 0 {
        return base.to_string();
    }

    match base.rfind('.') {
        Some(dot) => format!("{} ({attempt}){}", &base[..dot], &base[dot..]),
        None => format!("{base} ({attempt})"),
    }
}

/// First candidate under `dir` that does not exist yet.
///
/// Only consults the filesystem; the caller still has to create the file
/// exclusively if it must not race with other writers.
pub fn first_free(dir: &Path, base: &str) -> PathBuf {
    let mut attempt = 0;
    loop {
        let candidate = dir.join(resolve(base, attempt));
        if !candidate.exists() {
            return candidate;
        }
        attempt += 1;
    }
}

/// Strip any directory components from a filename.
///
/// Both `/` and `\` separators are honored since names come from mail
/// headers written on any platform.
pub fn basename(name: &str) -> &str {
    let trimmed = name.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Sanitize a string for use in filenames.
///
/// Replaces characters that are unsafe in paths with `_` and truncates to
/// `max_len` characters.
pub fn sanitize_filename_part(s: &str, max_len: usize) -> String {
    let sanitized: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '.' | '_' | '@' | ' ' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect();

    let sanitized = sanitized.trim();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        sanitized.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_attempt_zero_is_identity() {
        assert_eq!(resolve("report.txt", 0), "report.txt");
        assert_eq!(resolve("", 0), "");
    }

    #[test]
    fn test_resolve_inserts_before_extension() {
        assert_eq!(resolve("report.txt", 1), "report (1).txt");
        assert_eq!(resolve("archive.tar.gz", 3), "archive.tar (3).gz");
    }

    #[test]
    fn test_resolve_without_extension() {
        assert_eq!(resolve("report", 2), "report (2)");
    }

    #[test]
    fn test_first_free_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a (1).txt"), b"x").unwrap();
        assert_eq!(first_free(dir.path(), "a.txt"), dir.path().join("a (2).txt"));
        assert_eq!(first_free(dir.path(), "b.txt"), dir.path().join("b.txt"));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/home/u/photo.jpg"), "photo.jpg");
        assert_eq!(basename("C:\\Users\\u\\doc.pdf"), "doc.pdf");
        assert_eq!(basename("plain.txt"), "plain.txt");
        assert_eq!(basename("dir/"), "dir");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename_part("hello world", 20), "hello world");
        assert_eq!(sanitize_filename_part("a/b\\c:d*e", 20), "a_b_c_d_e");
        assert_eq!(sanitize_filename_part("..", 20), "unknown");
        assert_eq!(sanitize_filename_part("", 20), "unknown");
    }
}
