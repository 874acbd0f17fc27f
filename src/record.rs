//! The attachment record: the entity both pipelines operate on.
//!
//! A record is shared as `Arc<AttachmentRecord>` between the caller and
//! any running pipeline. Plain state lives behind a mutex; the
//! loading/saving/progress status and the metadata are published through
//! watch channels so a front end can follow them without polling.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cancel::CancelHandle;
use crate::error::{AttachError, Operation, Result};
use crate::model::{ContentPart, Disposition, Metadata};
use crate::parser::mime;

/// Icon used before anything is known about the attachment.
pub const DEFAULT_ICON_NAME: &str = "mail-attachment";

/// Icon for notes attached to a mail.
const MAIL_NOTE_ICON_NAME: &str = "evolution-memos";

/// Header marking a `message/rfc822` part as a mail note.
pub(crate) const MAIL_NOTE_HEADER: &str = "X-Evolution-Note";

/// Default delay before the "cancelled" indicator is lowered again.
pub const DEFAULT_CANCEL_RESET: Duration = Duration::from_secs(1);

/// Observable progress of the record's current operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Status {
    pub loading: bool,
    pub saving: bool,
    /// 0–100, never decreasing within one operation.
    pub percent: u8,
}

/// Result of checking the record's encryption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionValidity {
    #[default]
    None,
    Weak,
    Encrypted,
    Strong,
}

/// Result of checking the record's signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureValidity {
    #[default]
    None,
    Good,
    Bad,
    Unknown,
    NeedPublicKey,
}

/// Boolean presentation flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Flags {
    pub can_show: bool,
    pub initially_shown: bool,
    pub save_self: bool,
    pub save_extracted: bool,
}

/// What a front end should draw for the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Icon {
    /// Themed icon name.
    pub name: String,
    /// Pre-rendered thumbnail, preferred over `name` when present.
    pub thumbnail: Option<PathBuf>,
    /// At most one emblem, by priority.
    pub emblem: Option<&'static str>,
}

struct RecordState {
    source: Option<PathBuf>,
    content: Option<ContentPart>,
    disposition: Disposition,
    flags: Flags,
    encrypted: EncryptionValidity,
    signed: SignatureValidity,
}

pub struct AttachmentRecord {
    state: Mutex<RecordState>,
    status: watch::Sender<Status>,
    metadata: watch::Sender<Option<Metadata>>,
    cancel: CancelHandle,
}

impl AttachmentRecord {
    pub fn new() -> Self {
        Self::with_cancel_delay(DEFAULT_CANCEL_RESET)
    }

    /// A record whose "cancelled" indicator stays up for `delay`.
    pub fn with_cancel_delay(delay: Duration) -> Self {
        let (status, _) = watch::channel(Status::default());
        let (metadata, _) = watch::channel(None);
        Self {
            state: Mutex::new(RecordState {
                source: None,
                content: None,
                disposition: Disposition::Attachment,
                flags: Flags::default(),
                encrypted: EncryptionValidity::None,
                signed: SignatureValidity::None,
            }),
            status,
            metadata,
            cancel: CancelHandle::new(delay),
        }
    }

    /// A record that loads from a file or directory.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        let record = Self::new();
        record.set_source(Some(path.into()));
        record
    }

    /// A record wrapping an in-memory part.
    pub fn for_content(part: ContentPart) -> Self {
        let record = Self::new();
        record.set_disposition(part.disposition);
        record.set_content(Some(part));
        record
    }

    /// A record forwarding a whole message inline.
    pub fn for_message(raw_message: &[u8]) -> Self {
        Self::for_content(mime::message_part(raw_message))
    }

    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Source and content ───────────────────────────────────────

    pub fn source(&self) -> Option<PathBuf> {
        self.lock().source.clone()
    }

    pub fn set_source(&self, source: Option<PathBuf>) {
        let mut state = self.lock();
        if state.source != source {
            debug!(source = ?source, "Attachment source changed");
            state.source = source;
        }
    }

    pub fn content(&self) -> Option<ContentPart> {
        self.lock().content.clone()
    }

    pub fn set_content(&self, content: Option<ContentPart>) {
        let mut state = self.lock();
        if state.content != content {
            trace!(content = ?content, "Attachment content changed");
            state.content = content;
        }
    }

    pub fn metadata(&self) -> Option<Metadata> {
        self.metadata.borrow().clone()
    }

    /// Replace the metadata, notifying subscribers only on change.
    pub fn set_metadata(&self, metadata: Option<Metadata>) {
        self.metadata.send_if_modified(|current| {
            if *current == metadata {
                return false;
            }
            *current = metadata;
            true
        });
    }

    /// Name shown for the record, if one is known yet.
    pub fn display_name(&self) -> Option<String> {
        if let Some(meta) = self.metadata.borrow().as_ref() {
            return Some(meta.display_name.clone());
        }
        let state = self.lock();
        state
            .source
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
    }

    pub fn disposition(&self) -> Disposition {
        self.lock().disposition
    }

    pub fn set_disposition(&self, disposition: Disposition) {
        self.lock().disposition = disposition;
    }

    // ── Flags ────────────────────────────────────────────────────

    pub fn flags(&self) -> Flags {
        self.lock().flags
    }

    fn update_flag(&self, name: &str, value: bool, pick: impl FnOnce(&mut Flags) -> &mut bool) {
        let mut state = self.lock();
        let slot = pick(&mut state.flags);
        if *slot != value {
            *slot = value;
            trace!(flag = name, value, "Attachment flag changed");
        }
    }

    pub fn can_show(&self) -> bool {
        self.flags().can_show
    }

    pub fn set_can_show(&self, value: bool) {
        self.update_flag("can_show", value, |f| &mut f.can_show);
    }

    pub fn initially_shown(&self) -> bool {
        self.flags().initially_shown
    }

    pub fn set_initially_shown(&self, value: bool) {
        self.update_flag("initially_shown", value, |f| &mut f.initially_shown);
    }

    pub fn save_self(&self) -> bool {
        self.flags().save_self
    }

    pub fn set_save_self(&self, value: bool) {
        self.update_flag("save_self", value, |f| &mut f.save_self);
    }

    pub fn save_extracted(&self) -> bool {
        self.flags().save_extracted
    }

    pub fn set_save_extracted(&self, value: bool) {
        self.update_flag("save_extracted", value, |f| &mut f.save_extracted);
    }

    pub fn encrypted(&self) -> EncryptionValidity {
        self.lock().encrypted
    }

    pub fn set_encrypted(&self, validity: EncryptionValidity) {
        self.lock().encrypted = validity;
    }

    pub fn signed(&self) -> SignatureValidity {
        self.lock().signed
    }

    pub fn set_signed(&self, validity: SignatureValidity) {
        self.lock().signed = validity;
    }

    // ── Status ───────────────────────────────────────────────────

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn is_loading(&self) -> bool {
        self.status.borrow().loading
    }

    pub fn is_saving(&self) -> bool {
        self.status.borrow().saving
    }

    pub fn progress(&self) -> u8 {
        self.status.borrow().percent
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn subscribe_metadata(&self) -> watch::Receiver<Option<Metadata>> {
        self.metadata.subscribe()
    }

    /// Watch the transient "cancelled" indicator.
    pub fn subscribe_cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Atomically check that the record is idle and mark `op` as running.
    ///
    /// The flag stays set until the returned guard is dropped, so it is
    /// cleared even when the caller abandons the operation's future.
    pub(crate) fn try_begin(&self, op: Operation) -> Result<Running<'_>> {
        let mut running = None;
        self.status.send_if_modified(|status| {
            if status.loading {
                running = Some(Operation::Load);
                return false;
            }
            if status.saving {
                running = Some(Operation::Save);
                return false;
            }
            match op {
                Operation::Load => status.loading = true,
                Operation::Save => status.saving = true,
            }
            status.percent = 0;
            true
        });

        if let Some(running) = running {
            debug!(requested = %op, %running, "Attachment is busy");
            return Err(AttachError::Busy(running));
        }
        Ok(Running {
            record: self,
            op,
            token: self.cancel.reset(),
            completed: false,
        })
    }

    fn finish(&self, op: Operation) {
        self.status.send_if_modified(|status| {
            let flag = match op {
                Operation::Load => &mut status.loading,
                Operation::Save => &mut status.saving,
            };
            std::mem::replace(flag, false)
        });
    }

    pub(crate) fn set_progress(&self, percent: u8) {
        self.status.send_if_modified(|status| {
            if status.percent == percent {
                return false;
            }
            status.percent = percent;
            true
        });
    }

    // ── Cancellation ─────────────────────────────────────────────

    /// Cancel whatever the record is doing.
    ///
    /// The "cancelled" indicator is lowered again after the reset delay.
    pub fn cancel(&self) {
        debug!(name = ?self.display_name(), "Cancelling attachment operation");
        self.cancel.cancel();
    }

    /// `true` while the "cancelled" indicator is raised.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `true` while a reset of the "cancelled" indicator is pending.
    pub fn has_pending_cancel_reset(&self) -> bool {
        self.cancel.pending_resets() > 0
    }

    /// Number of reset timers armed; never more than one.
    pub fn pending_cancel_resets(&self) -> usize {
        self.cancel.pending_resets()
    }

    // ── Classification ───────────────────────────────────────────

    pub fn is_rfc822(&self) -> bool {
        if let Some(meta) = self.metadata.borrow().as_ref() {
            return meta.content_type.eq_ignore_ascii_case("message/rfc822");
        }
        self.lock()
            .content
            .as_ref()
            .is_some_and(ContentPart::is_rfc822)
    }

    /// `true` for an attached message carrying the mail-note marker.
    ///
    /// A transfer-encoded message is recognised once a load has decoded
    /// it; plain 7bit/8bit/binary parts are scanned directly.
    pub fn is_mail_note(&self) -> bool {
        if self.metadata.borrow().as_ref().is_some_and(|m| m.mail_note) {
            return true;
        }
        let state = self.lock();
        match &state.content {
            Some(part) if part.is_rfc822() && part.encoding.is_identity() => {
                mime::has_header(&part.data, MAIL_NOTE_HEADER)
            }
            _ => false,
        }
    }

    /// Icon and emblem for the current state.
    pub fn icon(&self) -> Icon {
        let meta = self.metadata();
        let thumbnail = meta.as_ref().and_then(|m| m.thumbnail_path.clone());

        let (name, thumbnail) = if self.is_mail_note() {
            (MAIL_NOTE_ICON_NAME.to_string(), None)
        } else {
            let name = meta
                .map(|m| m.icon)
                .unwrap_or_else(|| DEFAULT_ICON_NAME.to_string());
            (name, thumbnail)
        };

        let status = self.status();
        let (encrypted, signed) = {
            let state = self.lock();
            (state.encrypted, state.signed)
        };

        let emblem = if self.is_cancelled() {
            Some("process-stop")
        } else if status.loading {
            Some("emblem-downloads")
        } else if status.saving {
            Some("document-save")
        } else if encrypted != EncryptionValidity::None {
            Some(match encrypted {
                EncryptionValidity::Weak => "security-low",
                EncryptionValidity::Strong => "security-high",
                _ => "security-medium",
            })
        } else {
            match signed {
                SignatureValidity::None => None,
                SignatureValidity::Good => Some("stock_signature-ok"),
                SignatureValidity::Bad => Some("stock_signature-bad"),
                SignatureValidity::Unknown | SignatureValidity::NeedPublicKey => {
                    Some("stock_signature")
                }
            }
        };

        Icon {
            name,
            thumbnail,
            emblem,
        }
    }
}

impl Default for AttachmentRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AttachmentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("AttachmentRecord")
            .field("source", &state.source)
            .field("content", &state.content)
            .field("flags", &state.flags)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

/// Shared handle used by the engine.
pub type SharedRecord = Arc<AttachmentRecord>;

/// An operation in flight on a record.
///
/// Dropping it clears the record's `loading` or `saving` flag. A guard
/// dropped before [`complete`](Self::complete) also fires its token, so
/// background work of an abandoned operation stops.
#[derive(Debug)]
pub(crate) struct Running<'a> {
    record: &'a AttachmentRecord,
    op: Operation,
    token: CancellationToken,
    completed: bool,
}

impl Running<'_> {
    /// Token the operation must observe.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Mark the operation as resolved and clear the flag.
    pub(crate) fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        if !self.completed {
            debug!(op = %self.op, "Operation abandoned before it resolved");
            self.token.cancel();
        }
        self.record.finish(self.op);
    }
}
