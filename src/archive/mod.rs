//! Archive compressor and extractor collaborators.
//!
//! Loading a directory packs it into one archive file; saving with
//! "extract" unpacks the payload into a directory. Both directions run on
//! tokio's blocking pool and report back through callbacks, so their
//! terminal result arrives from another thread than the caller's.

mod compress;
mod extract;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ArchiveSettings;
use crate::error::{AttachError, Result};

pub use compress::compress_blocking;
pub use extract::extract_blocking;

/// Container format of a produced archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Zip,
    Tar,
}

/// Compression applied on top of the container.
///
/// Zip archives compress their entries themselves and ignore the filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFilter {
    #[default]
    None,
    Gzip,
}

/// File name extension for archives written with `settings`.
pub fn extension(settings: ArchiveSettings) -> &'static str {
    match (settings.format, settings.filter) {
        (ArchiveFormat::Zip, _) => "zip",
        (ArchiveFormat::Tar, ArchiveFilter::None) => "tar",
        (ArchiveFormat::Tar, ArchiveFilter::Gzip) => "tar.gz",
    }
}

/// Detected on-disk archive layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detected {
    Zip,
    Tar,
    TarGz,
}

/// Recognize an archive from its first bytes.
pub fn detect(header: &[u8]) -> Option<Detected> {
    match header {
        [0x50, 0x4B, 0x03, 0x04, ..] | [0x50, 0x4B, 0x05, 0x06, ..] => Some(Detected::Zip),
        [0x1F, 0x8B, ..] => Some(Detected::TarGz),
        _ if header.len() >= 263 && &header[257..262] == b"ustar" => Some(Detected::Tar),
        _ => None,
    }
}

/// Read enough of `path` to run [`detect`] on it.
pub(crate) fn detect_file(path: &Path) -> Result<Option<Detected>> {
    let mut file = File::open(path).map_err(|e| AttachError::io(path, e))?;
    let mut header = Vec::with_capacity(512);
    file.by_ref()
        .take(512)
        .read_to_end(&mut header)
        .map_err(|e| AttachError::io(path, e))?;
    Ok(detect(&header))
}

/// Maps a proposed output path to the one actually used.
pub type DecideDestination = Arc<dyn Fn(&Path) -> PathBuf + Send + Sync>;

/// Receives `(done, total)` byte counters during extraction.
pub type ProgressSink = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// What to pack.
#[derive(Debug, Clone)]
pub struct CompressRequest {
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    /// Archive name without extension.
    pub base_name: String,
    pub settings: ArchiveSettings,
}

impl CompressRequest {
    /// Where the archive goes unless the caller redirects it.
    pub fn proposed_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.base_name, extension(self.settings)))
    }
}

#[async_trait]
pub trait ArchiveCompressor: Send + Sync {
    /// Pack `request.inputs` into one archive and return its path.
    ///
    /// `decide` sees the proposed path first and may redirect it.
    async fn compress(
        &self,
        request: CompressRequest,
        decide: DecideDestination,
        cancel: CancellationToken,
    ) -> Result<PathBuf>;
}

#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Unpack `archive` into `output_dir`, returning the top-level paths
    /// created.
    ///
    /// `decide` is asked once per top-level entry and may rename it.
    async fn extract(
        &self,
        archive: PathBuf,
        output_dir: PathBuf,
        decide: DecideDestination,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Vec<PathBuf>>;
}

/// Zip and tar(.gz) support through the `zip`, `tar` and `flate2` crates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveBackend;

#[async_trait]
impl ArchiveCompressor for ArchiveBackend {
    async fn compress(
        &self,
        request: CompressRequest,
        decide: DecideDestination,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        let destination = decide(&request.proposed_path());
        debug!(dest = %destination.display(), inputs = request.inputs.len(), "Compressing");
        let out = destination.clone();
        tokio::task::spawn_blocking(move || {
            compress_blocking(&request.inputs, &out, request.settings, &cancel)
        })
        .await
        .map_err(|e| AttachError::Archive(format!("compressor task failed: {e}")))??;
        Ok(destination)
    }
}

#[async_trait]
impl ArchiveExtractor for ArchiveBackend {
    async fn extract(
        &self,
        archive: PathBuf,
        output_dir: PathBuf,
        decide: DecideDestination,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        debug!(archive = %archive.display(), dest = %output_dir.display(), "Extracting");
        tokio::task::spawn_blocking(move || {
            extract_blocking(&archive, &output_dir, &*decide, &*progress, &cancel)
        })
        .await
        .map_err(|e| AttachError::Archive(format!("extractor task failed: {e}")))?
    }
}
