//! The save pipeline: write an attachment's payload out.
//!
//! A save runs up to two branches against one shared [`SaveContext`]:
//!
//! * **self**: the decoded payload copied to a file, either created next
//!   to existing files under a collision-free name or atomically replacing
//!   an explicit target;
//! * **extracted**: the payload treated as an archive and unpacked into
//!   the destination directory.
//!
//! Branches prepare their destinations independently, wait until every
//! branch has settled its preparation, share one decoded copy of the
//! payload, and resolve through a single critical section. The caller's
//! result is produced exactly once, when the last branch resolves.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Collaborators;
use crate::error::{AttachError, Operation, Result};
use crate::load::check_cancel;
use crate::model::ContentPart;
use crate::naming::{self, DEFAULT_FILENAME};
use crate::progress::ProgressReporter;
use crate::provider::WriteStream;
use crate::record::SharedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    SaveSelf,
    SaveExtracted,
}

/// Where the destination query sent us.
#[derive(Debug, Clone)]
enum Target {
    /// An existing directory: pick names inside it.
    Directory(PathBuf),
    /// A file path, existing or not: replace it.
    File(PathBuf),
}

impl Target {
    /// Directory extracted files land in.
    fn directory(&self) -> PathBuf {
        match self {
            Target::Directory(dir) => dir.clone(),
            Target::File(file) => match file.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            },
        }
    }
}

/// A branch whose destination is ready.
enum Prepared {
    Stream(Box<dyn WriteStream>),
    Extract {
        root: PathBuf,
        /// Temporary home of the archive; deleted when dropped.
        scratch: tempfile::TempDir,
        archive: PathBuf,
    },
}

struct Tally {
    total: usize,
    prepared: usize,
    completed: usize,
    first_error: Option<AttachError>,
    saved_self: Option<PathBuf>,
    done: Option<oneshot::Sender<Result<PathBuf>>>,
}

/// State shared by the branches of one save.
struct SaveContext {
    ctx: Arc<Collaborators>,
    record: SharedRecord,
    part: ContentPart,
    display_name: String,
    target: Target,
    cancel: CancellationToken,
    tally: Mutex<Tally>,
    all_prepared: watch::Sender<bool>,
    payload: OnceCell<Arc<[u8]>>,
    /// Shared by both branches so the published percentage never drops.
    reporter: Arc<Mutex<ProgressReporter>>,
}

/// Run a save of `record` to `destination`.
///
/// Returns the created file, or the directory when the save produced more
/// than one file.
pub(crate) async fn run(
    ctx: Arc<Collaborators>,
    record: SharedRecord,
    destination: PathBuf,
) -> Result<PathBuf> {
    let part = record.content().ok_or_else(|| {
        AttachError::InvalidArgument("attachment has no content to save".into())
    })?;
    let running = record.try_begin(Operation::Save)?;
    let cancel = running.token().clone();

    let result = save(ctx, &record, part, destination, cancel).await;
    match &result {
        Ok(path) => {
            record.set_progress(100);
            info!(dest = %path.display(), "Attachment saved");
        }
        Err(e) if e.is_cancelled() => debug!("Attachment save cancelled"),
        Err(e) => warn!(error = %e, "Attachment save failed"),
    }

    running.complete();
    result
}

async fn save(
    ctx: Arc<Collaborators>,
    record: &SharedRecord,
    part: ContentPart,
    destination: PathBuf,
    cancel: CancellationToken,
) -> Result<PathBuf> {
    let mut branches = Vec::with_capacity(2);
    if record.save_self() {
        branches.push(Branch::SaveSelf);
    }
    if record.save_extracted() {
        branches.push(Branch::SaveExtracted);
    }
    if branches.is_empty() {
        branches.push(Branch::SaveSelf);
    }

    check_cancel(&cancel)?;
    let target = match ctx.provider.query_info(&destination).await {
        Ok(info) if info.is_dir() => Target::Directory(destination),
        Ok(_) => Target::File(destination),
        // Nothing there yet: create it.
        Err(e) if e.is_not_found() => Target::File(destination),
        Err(e) => return Err(e),
    };

    let display_name = record
        .display_name()
        .or_else(|| part.filename.as_deref().map(|n| naming::basename(n).to_string()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

    let (done_tx, done_rx) = oneshot::channel();
    let (all_prepared, _) = watch::channel(false);
    let interval = ctx.config.transfer.progress_interval();
    let context = Arc::new(SaveContext {
        ctx,
        record: Arc::clone(record),
        part,
        display_name,
        target,
        cancel,
        tally: Mutex::new(Tally {
            total: branches.len(),
            prepared: 0,
            completed: 0,
            first_error: None,
            saved_self: None,
            done: Some(done_tx),
        }),
        all_prepared,
        payload: OnceCell::new(),
        reporter: Arc::new(Mutex::new(ProgressReporter::new(interval))),
    });

    debug!(branches = ?branches, target = ?context.target, "Starting save");
    for branch in branches {
        tokio::spawn(Arc::clone(&context).run_branch(branch));
    }
    drop(context);

    // The sender is dropped unanswered only if a branch task died.
    done_rx.await.map_err(|_| {
        AttachError::io(
            "<save>",
            std::io::Error::other("save ended without a result"),
        )
    })?
}

impl SaveContext {
    fn lock(&self) -> MutexGuard<'_, Tally> {
        self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_branch(self: Arc<Self>, branch: Branch) {
        let result = self.branch(branch).await;
        self.resolve(branch, result);
    }

    async fn branch(&self, branch: Branch) -> Result<Option<PathBuf>> {
        let prepared = match branch {
            Branch::SaveSelf => self.prepare_self().await,
            Branch::SaveExtracted => self.prepare_extracted(),
        };
        // Failed preparations settle too, so the other branch never waits
        // on a branch that will not come.
        self.settle_preparation();
        let prepared = prepared?;

        self.wait_all_prepared().await;
        check_cancel(&self.cancel)?;
        let payload = self.payload().await?;

        match prepared {
            Prepared::Stream(stream) => self.write_self(stream, &payload).await.map(Some),
            Prepared::Extract {
                root,
                scratch,
                archive,
            } => {
                let outcome = self.extract(&root, &archive, &payload).await;
                if let Err(e) = scratch.close() {
                    warn!(error = %e, "Failed to remove temporary archive");
                }
                outcome.map(|_| None)
            }
        }
    }

    // ── Preparation ──────────────────────────────────────────────

    async fn prepare_self(&self) -> Result<Prepared> {
        match &self.target {
            Target::File(path) => {
                check_cancel(&self.cancel)?;
                let stream = self.ctx.provider.replace(path).await?;
                Ok(Prepared::Stream(stream))
            }
            Target::Directory(dir) => {
                let mut attempt = 0;
                loop {
                    check_cancel(&self.cancel)?;
                    let candidate = dir.join(naming::resolve(&self.display_name, attempt));
                    match self.ctx.provider.create_exclusive(&candidate).await {
                        Ok(stream) => {
                            debug!(path = %candidate.display(), attempt, "Created save destination");
                            return Ok(Prepared::Stream(stream));
                        }
                        Err(e) if e.is_already_exists() => attempt += 1,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    fn prepare_extracted(&self) -> Result<Prepared> {
        check_cancel(&self.cancel)?;
        let base_name = match &self.target {
            Target::Directory(_) => self.display_name.clone(),
            Target::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.display_name.clone()),
        };
        let scratch = tempfile::Builder::new()
            .prefix("attachflow-")
            .tempdir()
            .map_err(|e| AttachError::io(std::env::temp_dir(), e))?;
        let archive = scratch.path().join(base_name);
        Ok(Prepared::Extract {
            root: self.target.directory(),
            scratch,
            archive,
        })
    }

    fn settle_preparation(&self) {
        let mut tally = self.lock();
        tally.prepared += 1;
        if tally.prepared >= tally.total {
            self.all_prepared.send_replace(true);
        }
    }

    async fn wait_all_prepared(&self) {
        let mut rx = self.all_prepared.subscribe();
        // The sender lives in `self`, so the wait cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// The decoded payload, produced once for all branches.
    async fn payload(&self) -> Result<Arc<[u8]>> {
        self.payload
            .get_or_try_init(|| async {
                let decoded = self.ctx.worker.decode(&self.part).await?;
                debug!(bytes = decoded.len(), "Payload decoded for saving");
                Ok::<_, AttachError>(decoded)
            })
            .await
            .cloned()
    }

    fn report(&self, done: u64, total: u64) {
        report_progress(&self.reporter, &self.record, done, total);
    }

    // ── Branch bodies ────────────────────────────────────────────

    async fn write_self(&self, mut stream: Box<dyn WriteStream>, payload: &[u8]) -> Result<PathBuf> {
        let total = payload.len() as u64;
        for chunk in payload.chunks(self.ctx.config.transfer.chunk_size()) {
            check_cancel(&self.cancel)?;
            stream.write_chunk(chunk).await?;
            self.report(stream.written(), total);
        }
        check_cancel(&self.cancel)?;
        stream.commit().await
    }

    async fn extract(&self, root: &Path, archive: &Path, payload: &[u8]) -> Result<Vec<PathBuf>> {
        tokio::fs::write(archive, payload)
            .await
            .map_err(|e| AttachError::io(archive, e))?;
        check_cancel(&self.cancel)?;

        let decide = Arc::new(|proposed: &Path| {
            let name = proposed
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
            let parent = proposed.parent().unwrap_or(Path::new("."));
            naming::first_free(parent, &name)
        });

        let record = Arc::clone(&self.record);
        let reporter = Arc::clone(&self.reporter);
        let progress = Arc::new(move |done: u64, total: u64| {
            report_progress(&reporter, &record, done, total);
        });

        let created = self
            .ctx
            .extractor
            .extract(
                archive.to_path_buf(),
                root.to_path_buf(),
                decide,
                progress,
                self.cancel.clone(),
            )
            .await?;
        debug!(root = %root.display(), entries = created.len(), "Payload extracted");
        Ok(created)
    }

    // ── Completion ───────────────────────────────────────────────

    /// Count one branch as resolved; the last one produces the result.
    fn resolve(&self, branch: Branch, result: Result<Option<PathBuf>>) {
        let finished = {
            let mut tally = self.lock();
            tally.completed += 1;
            match result {
                Ok(Some(path)) => tally.saved_self = Some(path),
                Ok(None) => {}
                Err(e) if tally.first_error.is_none() => {
                    debug!(?branch, error = %e, "Save branch failed");
                    tally.first_error = Some(e);
                }
                Err(e) => warn!(?branch, error = %e, "Dropping error of a second failed save branch"),
            }

            if tally.completed == tally.total {
                let outcome = match tally.first_error.take() {
                    Some(e) => Err(e),
                    None => Ok(self.result_path(tally.total, tally.saved_self.take())),
                };
                tally.done.take().map(|done| (done, outcome))
            } else {
                None
            }
        };

        if let Some((done, outcome)) = finished {
            // The caller may have stopped waiting.
            let _ = done.send(outcome);
        }
    }

    fn result_path(&self, total: usize, saved_self: Option<PathBuf>) -> PathBuf {
        match saved_self {
            Some(path) if total == 1 => path,
            _ => self.target.directory(),
        }
    }
}

fn report_progress(reporter: &Mutex<ProgressReporter>, record: &SharedRecord, done: u64, total: u64) {
    let percent = reporter
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .update(done, total);
    if let Some(percent) = percent {
        record.set_progress(percent);
    }
}

/// Save into a fresh private temporary directory and mark the copy
/// read-only, the way attachments are handed to a viewer.
pub(crate) async fn run_temporary(ctx: Arc<Collaborators>, record: SharedRecord) -> Result<PathBuf> {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let dir = tempfile::Builder::new()
        .prefix(&format!("attachflow-{}-", naming::sanitize_filename_part(&user, 32)))
        .tempdir()
        .map_err(|e| AttachError::io(std::env::temp_dir(), e))?
        .keep();

    let path = match run(ctx, record, dir.clone()).await {
        Ok(path) => path,
        Err(e) => {
            if let Err(rm) = std::fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %rm, "Failed to remove temporary directory");
            }
            return Err(e);
        }
    };
    if path.is_file() {
        if let Err(e) = mark_read_only(&path) {
            warn!(path = %path.display(), error = %e, "Could not make temporary copy read-only");
        }
    }
    Ok(path)
}

fn mark_read_only(path: &Path) -> std::io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    std::fs::set_permissions(path, permissions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::model::TransferEncoding;
    use crate::record::AttachmentRecord;

    fn text_record(name: &str, body: &[u8]) -> SharedRecord {
        let part = ContentPart::new("text/plain", body).with_filename(name);
        Arc::new(AttachmentRecord::for_content(part))
    }

    #[tokio::test]
    async fn test_save_into_directory_twice_renames() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder().build().unwrap();
        let record = text_record("report.txt", b"numbers");

        let first = engine.save(&record, dir.path()).await.unwrap();
        let second = engine.save(&record, dir.path()).await.unwrap();
        assert_eq!(first, dir.path().join("report.txt"));
        assert_eq!(second, dir.path().join("report (1).txt"));
        assert_eq!(std::fs::read(&second).unwrap(), b"numbers");
        assert!(!record.is_saving());
        assert_eq!(record.progress(), 100);
    }

    #[tokio::test]
    async fn test_save_replaces_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        std::fs::write(&target, b"stale").unwrap();

        let engine = Engine::builder().build().unwrap();
        let part = ContentPart::new("application/octet-stream", &b"AAEC"[..])
            .with_encoding(TransferEncoding::Base64)
            .with_filename("blob.bin");
        let record = Arc::new(AttachmentRecord::for_content(part));

        let saved = engine.save(&record, &target).await.unwrap();
        assert_eq!(saved, target);
        assert_eq!(std::fs::read(&target).unwrap(), [0u8, 1, 2]);
    }

    #[tokio::test]
    async fn test_save_without_content_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder().build().unwrap();
        let record = Arc::new(AttachmentRecord::for_path(dir.path().join("x")));
        let err = engine.save(&record, dir.path()).await.unwrap_err();
        assert!(matches!(err, AttachError::InvalidArgument(_)));
        assert!(!record.is_saving());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_extraction_reports_error_after_both_branches() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder().build().unwrap();
        let record = text_record("notes.txt", b"not an archive");
        record.set_save_self(true);
        record.set_save_extracted(true);

        let err = engine.save(&record, dir.path()).await.unwrap_err();
        assert!(matches!(err, AttachError::Archive(_)));
        assert!(!record.is_saving());
        // The raw copy still completed before the result was produced.
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"not an archive");
    }

    #[tokio::test]
    async fn test_save_temporary_is_read_only() {
        let engine = Engine::builder().build().unwrap();
        let record = text_record("view.txt", b"read me");

        let path = engine.save_temporary(&record).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "view.txt");
        assert!(std::fs::metadata(&path).unwrap().permissions().readonly());
        let dir = path.parent().unwrap().to_path_buf();
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("attachflow-"));

        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        std::fs::set_permissions(&path, permissions).unwrap();
        std::fs::remove_dir_all(dir).unwrap();
    }
}
