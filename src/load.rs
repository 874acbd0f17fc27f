//! The load pipeline: fetch an attachment's bytes into memory.
//!
//! A file source is queried, opened and streamed chunk by chunk into a
//! growable buffer. A directory source is first packed into a temporary
//! archive and the pipeline continues with that archive as its source.
//! A record that already holds a content part only needs its metadata,
//! which is derived on the decode worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::CompressRequest;
use crate::engine::Collaborators;
use crate::error::{AttachError, Operation, Result};
use crate::model::{ContentPart, Metadata};
use crate::naming;
use crate::progress::ProgressReporter;
use crate::provider::{self, ResourceInfo};
use crate::record::SharedRecord;

/// Fail the current step if the operation was cancelled.
pub(crate) fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(AttachError::Cancelled)
    } else {
        Ok(())
    }
}

enum Input {
    Source(PathBuf),
    Content(ContentPart),
}

/// Everything a single load owns until it resolves.
struct LoadContext {
    path: PathBuf,
    info: ResourceInfo,
    buffer: Vec<u8>,
    consumed: u64,
    /// Description carried over from earlier metadata.
    description: Option<String>,
}

/// Run a load on `record`.
///
/// On success the record holds the new content part and metadata; on any
/// failure partially read bytes are dropped. `loading` is cleared on every
/// path, including when the returned future is dropped early.
pub(crate) async fn run(ctx: &Collaborators, record: &SharedRecord) -> Result<ContentPart> {
    let input = match (record.source(), record.content()) {
        (Some(path), _) => Input::Source(path),
        (None, Some(part)) => Input::Content(part),
        (None, None) => {
            return Err(AttachError::InvalidArgument(
                "attachment has neither a source nor content".into(),
            ))
        }
    };
    let running = record.try_begin(Operation::Load)?;
    let cancel = running.token().clone();

    let outcome = match input {
        Input::Source(path) => load_from_source(ctx, record, path, &cancel).await,
        Input::Content(part) => load_from_content(ctx, part, &cancel).await,
    };

    let result = match outcome {
        Ok((part, metadata)) => {
            info!(name = %metadata.display_name, size = metadata.size, "Attachment loaded");
            record.set_disposition(part.disposition);
            record.set_metadata(Some(metadata));
            record.set_content(Some(part.clone()));
            Ok(part)
        }
        Err(e) if e.is_cancelled() => {
            debug!("Attachment load cancelled");
            Err(e)
        }
        Err(e) => {
            warn!(error = %e, "Attachment load failed");
            Err(e)
        }
    };

    running.complete();
    result
}

async fn load_from_source(
    ctx: &Collaborators,
    record: &SharedRecord,
    path: PathBuf,
    cancel: &CancellationToken,
) -> Result<(ContentPart, Metadata)> {
    check_cancel(cancel)?;
    let description = record.metadata().and_then(|m| m.description);
    let mut info = ctx.provider.query_info(&path).await?;
    record.set_metadata(Some(preliminary_metadata(&info)));

    let path = if info.is_dir() {
        let archive = compress_directory(ctx, record, &path, &info, cancel).await?;
        check_cancel(cancel)?;
        info = ctx.provider.query_info(&archive).await?;
        record.set_metadata(Some(preliminary_metadata(&info)));
        archive
    } else {
        path
    };

    let mut load = LoadContext {
        buffer: Vec::with_capacity(usize::try_from(info.size).unwrap_or(0)),
        consumed: 0,
        path,
        info,
        description,
    };
    stream_into_buffer(ctx, record, &mut load, cancel).await?;
    Ok(finalize(ctx, record, load))
}

fn preliminary_metadata(info: &ResourceInfo) -> Metadata {
    let mut metadata = Metadata::new(&info.display_name, &info.content_type, info.size);
    metadata.modified = info.modified;
    metadata.thumbnail_path = info.thumbnail_path.clone();
    metadata
}

/// Pack a directory source into a fresh temporary directory.
///
/// The compressor's chosen destination becomes the record's new source.
/// If packing fails the directory is put back as the source.
async fn compress_directory(
    ctx: &Collaborators,
    record: &SharedRecord,
    dir: &Path,
    info: &ResourceInfo,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    check_cancel(cancel)?;
    let temp = tempfile::Builder::new()
        .prefix("attachflow-")
        .tempdir()
        .map_err(|e| AttachError::io(std::env::temp_dir(), e))?;
    // The archive outlives this call as the record's source.
    let output_dir = temp.keep();

    let request = CompressRequest {
        inputs: vec![dir.to_path_buf()],
        output_dir: output_dir.clone(),
        base_name: info.display_name.clone(),
        settings: ctx.config.archive,
    };

    let target = Arc::clone(record);
    let decide = Arc::new(move |proposed: &Path| {
        target.set_source(Some(proposed.to_path_buf()));
        proposed.to_path_buf()
    });

    let archive = match ctx.compressor.compress(request, decide, cancel.clone()).await {
        Ok(archive) => archive,
        Err(e) => {
            record.set_source(Some(dir.to_path_buf()));
            if let Err(rm) = std::fs::remove_dir_all(&output_dir) {
                warn!(dir = %output_dir.display(), error = %rm, "Failed to remove temporary directory");
            }
            return Err(e);
        }
    };
    debug!(dir = %dir.display(), archive = %archive.display(), "Directory packed for loading");
    Ok(archive)
}

async fn stream_into_buffer(
    ctx: &Collaborators,
    record: &SharedRecord,
    load: &mut LoadContext,
    cancel: &CancellationToken,
) -> Result<()> {
    check_cancel(cancel)?;
    let mut stream = ctx.provider.open_read(&load.path).await?;
    let mut chunk = vec![0u8; ctx.config.transfer.chunk_size()];
    let mut reporter = ProgressReporter::new(ctx.config.transfer.progress_interval());

    loop {
        check_cancel(cancel)?;
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| AttachError::io(&load.path, e))?;
        // A read that completes after cancellation is discarded.
        check_cancel(cancel)?;
        if n == 0 {
            break;
        }

        load.buffer.extend_from_slice(&chunk[..n]);
        load.consumed += n as u64;
        if let Some(percent) = reporter.update(load.consumed, load.info.size) {
            record.set_progress(percent);
        }
    }

    record.set_progress(reporter.finish());
    debug!(path = %load.path.display(), bytes = load.consumed, "Source read");
    Ok(())
}

fn finalize(ctx: &Collaborators, record: &SharedRecord, load: LoadContext) -> (ContentPart, Metadata) {
    let LoadContext {
        path,
        info,
        buffer,
        description,
        ..
    } = load;

    let display_name = naming::basename(&info.display_name).to_string();
    // Special files report zero length up front.
    let size = if info.size == 0 {
        buffer.len() as u64
    } else {
        info.size
    };
    let mut part = ContentPart::new(info.content_type.clone(), buffer)
        .with_filename(display_name.clone())
        .with_disposition(record.disposition());
    if let Some(description) = &description {
        part = part.with_description(description.clone());
    }

    let mut metadata = Metadata::new(display_name, info.content_type.clone(), size);
    metadata.description = description;
    metadata.modified = info.modified;
    metadata.thumbnail_path = info
        .thumbnail_path
        .or_else(|| provider::thumbnail_or_self(ctx.thumbnails.as_ref(), &path, &info.content_type));

    (part, metadata)
}

async fn load_from_content(
    ctx: &Collaborators,
    part: ContentPart,
    cancel: &CancellationToken,
) -> Result<(ContentPart, Metadata)> {
    check_cancel(cancel)?;
    let metadata = ctx.worker.derive_metadata(&part, cancel.clone()).await?;
    check_cancel(cancel)?;
    Ok((part, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveCompressor, DecideDestination};
    use crate::engine::Engine;
    use crate::model::{Disposition, TransferEncoding};
    use crate::record::AttachmentRecord;
    use async_trait::async_trait;

    /// Accepts the proposed destination, then fails like a full disk.
    struct BrokenCompressor;

    #[async_trait]
    impl ArchiveCompressor for BrokenCompressor {
        async fn compress(
            &self,
            request: CompressRequest,
            decide: DecideDestination,
            _cancel: CancellationToken,
        ) -> Result<PathBuf> {
            let target = decide(&request.proposed_path());
            std::fs::write(&target, b"PK partial").map_err(|e| AttachError::io(&target, e))?;
            Err(AttachError::Archive("no space left for archive".into()))
        }
    }

    #[tokio::test]
    async fn test_load_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let body = "line\n".repeat(3000);
        std::fs::write(&path, &body).unwrap();

        let engine = Engine::builder().build().unwrap();
        let record = Arc::new(AttachmentRecord::for_path(&path));
        record.set_disposition(Disposition::Inline);

        let part = engine.load(&record).await.unwrap();
        assert_eq!(&part.data[..], body.as_bytes());
        assert_eq!(part.filename.as_deref(), Some("notes.txt"));
        assert_eq!(part.disposition, Disposition::Inline);
        assert_eq!(part.encoding, TransferEncoding::Binary);

        let meta = record.metadata().unwrap();
        assert_eq!(meta.size, body.len() as u64);
        assert_eq!(record.progress(), 100);
        assert!(!record.is_loading());
    }

    #[tokio::test]
    async fn test_load_missing_source_fails_and_clears_flag() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder().build().unwrap();
        let record = Arc::new(AttachmentRecord::for_path(dir.path().join("gone.bin")));

        let err = engine.load(&record).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!record.is_loading());
        assert!(record.content().is_none());
    }

    #[tokio::test]
    async fn test_load_content_part_derives_metadata() {
        let engine = Engine::builder().build().unwrap();
        let part = ContentPart::new("text/plain", &b"aGVsbG8="[..])
            .with_encoding(TransferEncoding::Base64)
            .with_filename("greeting.txt");
        let record = Arc::new(AttachmentRecord::for_content(part.clone()));

        let loaded = engine.load(&record).await.unwrap();
        assert_eq!(loaded, part);
        let meta = record.metadata().unwrap();
        assert_eq!(meta.display_name, "greeting.txt");
        assert_eq!(meta.size, 5);
    }

    #[tokio::test]
    async fn test_load_recognises_encoded_mail_note() {
        let engine = Engine::builder().build().unwrap();
        let part = ContentPart::new(
            "message/rfc822",
            &b"U3ViamVjdDogTWVtbw0KWC1Fdm9sdXRpb24tTm90ZTogVHJ1ZQ0KDQpib2R5DQo="[..],
        )
        .with_encoding(TransferEncoding::Base64);
        let record = Arc::new(AttachmentRecord::for_content(part));

        engine.load(&record).await.unwrap();
        assert!(record.is_mail_note());
        assert_eq!(record.icon().name, "evolution-memos");
    }

    #[tokio::test]
    async fn test_load_without_source_or_content() {
        let engine = Engine::builder().build().unwrap();
        let record = Arc::new(AttachmentRecord::new());
        let err = engine.load(&record).await.unwrap_err();
        assert!(matches!(err, AttachError::InvalidArgument(_)));
        assert!(!record.is_loading());
    }

    #[tokio::test]
    async fn test_load_empty_file_reports_zero_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        let engine = Engine::builder().build().unwrap();
        let record = Arc::new(AttachmentRecord::for_path(&path));

        let part = engine.load(&record).await.unwrap();
        assert!(part.data.is_empty());
        assert_eq!(record.metadata().unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_failed_directory_pack_restores_source() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("photos");
        std::fs::create_dir(&folder).unwrap();
        std::fs::write(folder.join("a.jpg"), b"jpeg").unwrap();

        let engine = Engine::builder()
            .compressor(Arc::new(BrokenCompressor))
            .build()
            .unwrap();
        let record = Arc::new(AttachmentRecord::for_path(&folder));

        let err = engine.load(&record).await.unwrap_err();
        assert!(matches!(err, AttachError::Archive(_)));
        assert_eq!(record.source(), Some(folder.clone()));
        assert!(record.content().is_none());
        assert!(!record.is_loading());

        // A retry packs the directory again instead of chasing the
        // deleted archive.
        let err = engine.load(&record).await.unwrap_err();
        assert!(matches!(err, AttachError::Archive(_)));
    }
}
