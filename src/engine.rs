//! The engine: entry point for loading and saving attachments.
//!
//! An [`Engine`] bundles the collaborators the pipelines use (resource
//! provider, thumbnailer, archive backend, decode worker) together with
//! the configuration. It is cheap to clone and meant to be shared by every
//! record of a view.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::archive::{ArchiveBackend, ArchiveCompressor, ArchiveExtractor};
use crate::config::Config;
use crate::error::{AttachError, Operation, Result};
use crate::model::ContentPart;
use crate::provider::{LocalFs, NoThumbnails, ResourceProvider, ThumbnailProvider};
use crate::record::SharedRecord;
use crate::worker::DecodeWorker;
use crate::{load, save};

/// Everything a pipeline run needs besides the record.
pub(crate) struct Collaborators {
    pub(crate) provider: Arc<dyn ResourceProvider>,
    pub(crate) thumbnails: Arc<dyn ThumbnailProvider>,
    pub(crate) compressor: Arc<dyn ArchiveCompressor>,
    pub(crate) extractor: Arc<dyn ArchiveExtractor>,
    pub(crate) worker: DecodeWorker,
    pub(crate) config: Config,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Collaborators>,
}

/// Builder for [`Engine`]; every collaborator has a local default.
#[derive(Default)]
pub struct EngineBuilder {
    provider: Option<Arc<dyn ResourceProvider>>,
    thumbnails: Option<Arc<dyn ThumbnailProvider>>,
    compressor: Option<Arc<dyn ArchiveCompressor>>,
    extractor: Option<Arc<dyn ArchiveExtractor>>,
    config: Option<Config>,
}

impl EngineBuilder {
    pub fn provider(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn thumbnails(mut self, thumbnails: Arc<dyn ThumbnailProvider>) -> Self {
        self.thumbnails = Some(thumbnails);
        self
    }

    pub fn compressor(mut self, compressor: Arc<dyn ArchiveCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn ArchiveExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Start the decode worker and assemble the engine.
    pub fn build(self) -> Result<Engine> {
        let config = self.config.unwrap_or_default();
        debug!(
            chunk_size = config.transfer.chunk_size(),
            format = ?config.archive.format,
            filter = ?config.archive.filter,
            "Building attachment engine"
        );
        Ok(Engine {
            inner: Arc::new(Collaborators {
                provider: self.provider.unwrap_or_else(|| Arc::new(LocalFs)),
                thumbnails: self.thumbnails.unwrap_or_else(|| Arc::new(NoThumbnails)),
                compressor: self.compressor.unwrap_or_else(|| Arc::new(ArchiveBackend)),
                extractor: self.extractor.unwrap_or_else(|| Arc::new(ArchiveBackend)),
                worker: DecodeWorker::shared()?,
                config,
            }),
        })
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// An engine with local collaborators and `config`.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Load `record` from its source or content part.
    pub async fn load(&self, record: &SharedRecord) -> Result<ContentPart> {
        load::run(&self.inner, record).await
    }

    /// Save `record` to a file or into a directory.
    pub async fn save(&self, record: &SharedRecord, destination: impl AsRef<Path>) -> Result<PathBuf> {
        save::run(
            Arc::clone(&self.inner),
            Arc::clone(record),
            destination.as_ref().to_path_buf(),
        )
        .await
    }

    /// Save `record` into a private temporary directory as a read-only file.
    pub async fn save_temporary(&self, record: &SharedRecord) -> Result<PathBuf> {
        save::run_temporary(Arc::clone(&self.inner), Arc::clone(record)).await
    }

    /// Start a load in the background and call `on_done` with its result.
    ///
    /// `Busy` and `InvalidArgument` are reported before this returns.
    pub fn spawn_load<F>(&self, record: SharedRecord, on_done: F)
    where
        F: FnOnce(Result<ContentPart>) + Send + 'static,
    {
        if let Err(e) = precheck(&record, Operation::Load) {
            on_done(Err(e));
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            let result = engine.load(&record).await;
            on_done(result);
        });
    }

    /// Start a save in the background and call `on_done` with its result.
    ///
    /// `Busy` and `InvalidArgument` are reported before this returns.
    pub fn spawn_save<F>(&self, record: SharedRecord, destination: impl AsRef<Path>, on_done: F)
    where
        F: FnOnce(Result<PathBuf>) + Send + 'static,
    {
        if let Err(e) = precheck(&record, Operation::Save) {
            on_done(Err(e));
            return;
        }
        let engine = self.clone();
        let destination = destination.as_ref().to_path_buf();
        tokio::spawn(async move {
            let result = engine.save(&record, destination).await;
            on_done(result);
        });
    }
}

/// The synchronous checks a pipeline performs before any await.
fn precheck(record: &SharedRecord, op: Operation) -> Result<()> {
    let has_input = match op {
        Operation::Load => record.source().is_some() || record.content().is_some(),
        Operation::Save => record.content().is_some(),
    };
    if !has_input {
        return Err(AttachError::InvalidArgument(match op {
            Operation::Load => "attachment has neither a source nor content".into(),
            Operation::Save => "attachment has no content to save".into(),
        }));
    }
    let status = record.status();
    if status.loading {
        return Err(AttachError::Busy(Operation::Load));
    }
    if status.saving {
        return Err(AttachError::Busy(Operation::Save));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AttachmentRecord;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_spawn_load_reports_busy_synchronously() {
        let engine = Engine::builder().build().unwrap();
        let record = Arc::new(AttachmentRecord::for_path("/nonexistent"));
        let _saving = record.try_begin(Operation::Save).unwrap();

        let (tx, mut rx) = oneshot::channel();
        engine.spawn_load(Arc::clone(&record), move |r| {
            let _ = tx.send(r);
        });
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(err, AttachError::Busy(Operation::Save)));
        assert!(record.is_saving());
        assert!(!record.is_loading());
    }

    #[tokio::test]
    async fn test_spawn_save_delivers_result() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder().build().unwrap();
        let record = Arc::new(AttachmentRecord::for_content(
            ContentPart::new("text/plain", &b"hi"[..]).with_filename("hi.txt"),
        ));

        let (tx, rx) = oneshot::channel();
        engine.spawn_save(Arc::clone(&record), dir.path(), move |r| {
            let _ = tx.send(r);
        });
        let saved = rx.await.unwrap().unwrap();
        assert_eq!(saved, dir.path().join("hi.txt"));
    }

    #[test]
    fn test_precheck_invalid_argument() {
        let record = Arc::new(AttachmentRecord::new());
        assert!(matches!(
            precheck(&record, Operation::Save),
            Err(AttachError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_precheck_missing_input_wins_over_busy() {
        let record = Arc::new(AttachmentRecord::new());
        let _loading = record.try_begin(Operation::Load).unwrap();
        assert!(matches!(
            precheck(&record, Operation::Save),
            Err(AttachError::InvalidArgument(_))
        ));
        assert!(matches!(
            precheck(&record, Operation::Load),
            Err(AttachError::InvalidArgument(_))
        ));

        record.set_content(Some(ContentPart::new("text/plain", &b"x"[..])));
        assert!(matches!(
            precheck(&record, Operation::Save),
            Err(AttachError::Busy(Operation::Load))
        ));
    }
}
