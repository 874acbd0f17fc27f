//! Resource, stream and thumbnail providers.
//!
//! The pipelines never touch the filesystem directly; they go through a
//! [`ResourceProvider`] so the transfer logic can be exercised against
//! other backends. [`LocalFs`] is the implementation used by default.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::error::{AttachError, Result};

/// Content type reported for directories.
pub const DIRECTORY_CONTENT_TYPE: &str = "inode/directory";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    File,
    Directory,
}

/// What a metadata query returns about a locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub kind: ResourceKind,
    /// Lower-cased MIME type.
    pub content_type: String,
    pub display_name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Thumbnail attribute, when the backend keeps one.
    pub thumbnail_path: Option<PathBuf>,
}

impl ResourceInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == ResourceKind::Directory
    }
}

pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;

/// A destination being written chunk by chunk.
///
/// Dropping a stream without committing it abandons the write and leaves
/// no partial file behind.
#[async_trait]
pub trait WriteStream: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Bytes accepted so far.
    fn written(&self) -> u64;

    /// Final location of the data.
    fn path(&self) -> &Path;

    /// Flush and make the data visible at [`path`](Self::path).
    async fn commit(self: Box<Self>) -> Result<PathBuf>;
}

/// Metadata and stream access for locators.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Query a locator. A missing resource is an `Io` error of kind
    /// `NotFound`.
    async fn query_info(&self, path: &Path) -> Result<ResourceInfo>;

    async fn open_read(&self, path: &Path) -> Result<ReadStream>;

    /// Create `path`, failing with `AlreadyExists` if anything is there.
    async fn create_exclusive(&self, path: &Path) -> Result<Box<dyn WriteStream>>;

    /// Create `path` or atomically replace what is there on commit.
    async fn replace(&self, path: &Path) -> Result<Box<dyn WriteStream>>;
}

/// The local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

#[async_trait]
impl ResourceProvider for LocalFs {
    async fn query_info(&self, path: &Path) -> Result<ResourceInfo> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| AttachError::io(path, e))?;

        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);

        if meta.is_dir() {
            return Ok(ResourceInfo {
                kind: ResourceKind::Directory,
                content_type: DIRECTORY_CONTENT_TYPE.to_string(),
                display_name,
                size: 0,
                modified,
                thumbnail_path: None,
            });
        }

        let sniff_path = path.to_path_buf();
        let content_type = tokio::task::spawn_blocking(move || {
            tree_magic_mini::from_filepath(&sniff_path).map(str::to_string)
        })
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| "application/octet-stream".to_string());
        trace!(path = %path.display(), %content_type, "Queried file info");

        Ok(ResourceInfo {
            kind: ResourceKind::File,
            content_type: content_type.to_ascii_lowercase(),
            display_name,
            size: meta.len(),
            modified,
            thumbnail_path: None,
        })
    }

    async fn open_read(&self, path: &Path) -> Result<ReadStream> {
        let file = File::open(path)
            .await
            .map_err(|e| AttachError::io(path, e))?;
        Ok(Box::new(file))
    }

    async fn create_exclusive(&self, path: &Path) -> Result<Box<dyn WriteStream>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| AttachError::io(path, e))?;
        Ok(Box::new(ExclusiveFile {
            file,
            path: path.to_path_buf(),
            written: 0,
            committed: false,
        }))
    }

    async fn replace(&self, path: &Path) -> Result<Box<dyn WriteStream>> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = tempfile::Builder::new()
            .prefix(".attachflow-")
            .tempfile_in(&parent)
            .map_err(|e| AttachError::io(&parent, e))?;
        let handle = temp.reopen().map_err(|e| AttachError::io(temp.path(), e))?;
        Ok(Box::new(ReplaceFile {
            file: File::from_std(handle),
            temp,
            target: path.to_path_buf(),
            written: 0,
        }))
    }
}

/// A newly created file, removed again unless committed.
struct ExclusiveFile {
    file: File,
    path: PathBuf,
    written: u64,
    committed: bool,
}

#[async_trait]
impl WriteStream for ExclusiveFile {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| AttachError::io(&self.path, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn commit(mut self: Box<Self>) -> Result<PathBuf> {
        self.file
            .flush()
            .await
            .map_err(|e| AttachError::io(&self.path, e))?;
        self.committed = true;
        Ok(self.path.clone())
    }
}

impl Drop for ExclusiveFile {
    fn drop(&mut self) {
        if !self.committed {
            debug!(path = %self.path.display(), "Removing abandoned partial file");
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial file");
            }
        }
    }
}

/// Data staged in a temporary sibling of `target`, renamed over it on
/// commit. The temporary file deletes itself when abandoned.
struct ReplaceFile {
    file: File,
    temp: tempfile::NamedTempFile,
    target: PathBuf,
    written: u64,
}

#[async_trait]
impl WriteStream for ReplaceFile {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| AttachError::io(self.temp.path(), e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn path(&self) -> &Path {
        &self.target
    }

    async fn commit(self: Box<Self>) -> Result<PathBuf> {
        let ReplaceFile {
            mut file,
            temp,
            target,
            ..
        } = *self;
        file.flush()
            .await
            .map_err(|e| AttachError::io(temp.path(), e))?;
        file.sync_all()
            .await
            .map_err(|e| AttachError::io(temp.path(), e))?;
        drop(file);

        temp.persist(&target)
            .map_err(|e| AttachError::io(&target, e.error))?;
        Ok(target)
    }
}

// ── Thumbnails ──────────────────────────────────────────────────

/// Looks up a thumbnail image for a local file.
pub trait ThumbnailProvider: Send + Sync {
    fn thumbnail_for(&self, path: &Path, content_type: &str) -> Option<PathBuf>;
}

/// Never has a thumbnail.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoThumbnails;

impl ThumbnailProvider for NoThumbnails {
    fn thumbnail_for(&self, _path: &Path, _content_type: &str) -> Option<PathBuf> {
        None
    }
}

/// Pre-rendered thumbnails stored as `<dir>/<file name>.png`.
#[derive(Debug, Clone)]
pub struct ThumbnailDir {
    dir: PathBuf,
}

impl ThumbnailDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ThumbnailProvider for ThumbnailDir {
    fn thumbnail_for(&self, path: &Path, _content_type: &str) -> Option<PathBuf> {
        let name = path.file_name()?;
        let mut thumb_name = name.to_os_string();
        thumb_name.push(".png");
        let candidate = self.dir.join(thumb_name);
        candidate.is_file().then_some(candidate)
    }
}

/// Thumbnail for `path`, falling back to the file itself for images.
pub fn thumbnail_or_self(
    provider: &dyn ThumbnailProvider,
    path: &Path,
    content_type: &str,
) -> Option<PathBuf> {
    provider
        .thumbnail_for(path, content_type)
        .or_else(|| content_type.starts_with("image/").then(|| path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_query_info_file_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"hello").unwrap();

        let info = LocalFs.query_info(&file).await.unwrap();
        assert_eq!(info.kind, ResourceKind::File);
        assert_eq!(info.display_name, "notes.txt");
        assert_eq!(info.size, 5);
        assert!(info.content_type.starts_with("text/"));

        let info = LocalFs.query_info(dir.path()).await.unwrap();
        assert!(info.is_dir());
        assert_eq!(info.content_type, DIRECTORY_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_query_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalFs
            .query_info(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_exclusive_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"x").unwrap();
        let err = LocalFs.create_exclusive(&path).await.err().unwrap();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_abandoned_exclusive_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let mut stream = LocalFs.create_exclusive(&path).await.unwrap();
        stream.write_chunk(b"half").await.unwrap();
        drop(stream);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_replace_commits_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, b"old contents").unwrap();

        let mut stream = LocalFs.replace(&path).await.unwrap();
        stream.write_chunk(b"new").await.unwrap();
        assert_eq!(stream.written(), 3);
        assert_eq!(std::fs::read(&path).unwrap(), b"old contents");

        let committed = stream.commit().await.unwrap();
        assert_eq!(committed, path);
        let mut reader = LocalFs.open_read(&path).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"new");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_thumbnail_dir_and_image_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("photo.jpg.png"), b"png").unwrap();
        let thumbs = ThumbnailDir::new(dir.path());

        assert_eq!(
            thumbs.thumbnail_for(Path::new("/x/photo.jpg"), "image/jpeg"),
            Some(dir.path().join("photo.jpg.png"))
        );
        assert_eq!(
            thumbnail_or_self(&NoThumbnails, Path::new("/x/pic.gif"), "image/gif"),
            Some(PathBuf::from("/x/pic.gif"))
        );
        assert_eq!(
            thumbnail_or_self(&NoThumbnails, Path::new("/x/a.txt"), "text/plain"),
            None
        );
    }
}
