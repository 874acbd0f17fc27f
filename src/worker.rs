//! The decode worker.
//!
//! Decoding a content part may block and the decoder is not reentrant, so
//! every decode in the process goes through one dedicated OS thread fed by
//! a single-slot queue. Engines share that thread through
//! [`DecodeWorker::shared`]. Callers on the async side await the reply.

use std::sync::{Arc, OnceLock};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{AttachError, Result};
use crate::model::metadata::Metadata;
use crate::model::ContentPart;
use crate::naming::{self, DEFAULT_FILENAME};
use crate::parser::{header, mime, transfer};
use crate::record::MAIL_NOTE_HEADER;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a decode thread. Cheap to clone; a thread started with
/// [`spawn`](Self::spawn) exits once its last handle is dropped.
#[derive(Clone)]
pub struct DecodeWorker {
    jobs: mpsc::Sender<Job>,
}

static SHARED: OnceLock<DecodeWorker> = OnceLock::new();

impl DecodeWorker {
    /// The process-wide worker, started on first use.
    pub fn shared() -> Result<Self> {
        if let Some(worker) = SHARED.get() {
            return Ok(worker.clone());
        }
        let worker = Self::spawn()?;
        // A racing caller may have won; its worker is kept and ours stops
        // when dropped.
        Ok(SHARED.get_or_init(|| worker).clone())
    }

    /// Start a private worker thread.
    pub fn spawn() -> Result<Self> {
        let (jobs, mut queue) = mpsc::channel::<Job>(1);
        thread::Builder::new()
            .name("attachflow-decode".to_string())
            .spawn(move || {
                debug!("Decode worker started");
                while let Some(job) = queue.blocking_recv() {
                    job();
                }
                debug!("Decode worker stopped");
            })
            .map_err(|e| AttachError::io("<decode worker>", e))?;
        Ok(Self { jobs })
    }

    /// Run `f` on the worker thread and wait for its result.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (reply, answer) = oneshot::channel();
        let job: Job = Box::new(move || {
            // The caller may have gone away; nothing to do then.
            let _ = reply.send(f());
        });
        self.jobs
            .send(job)
            .await
            .map_err(|_| AttachError::Decode("decode worker is gone".into()))?;
        answer
            .await
            .map_err(|_| AttachError::Decode("decode worker dropped the job".into()))?
    }

    /// Decode a part's payload out of its transfer encoding.
    pub async fn decode(&self, part: &ContentPart) -> Result<Arc<[u8]>> {
        let encoding = part.encoding;
        let data = Arc::clone(&part.data);
        self.run(move || {
            let decoded = transfer::decode(encoding, &data)?;
            trace!(encoded = data.len(), decoded = decoded.len(), "Decoded payload");
            Ok(Arc::from(decoded))
        })
        .await
    }

    /// Derive display metadata for an in-memory part.
    ///
    /// The payload is decoded into a counting sink to learn its real size.
    pub async fn derive_metadata(
        &self,
        part: &ContentPart,
        cancel: CancellationToken,
    ) -> Result<Metadata> {
        let part = part.clone();
        self.run(move || {
            if cancel.is_cancelled() {
                return Err(AttachError::Cancelled);
            }
            derive_metadata_blocking(&part)
        })
        .await
    }
}

fn derive_metadata_blocking(part: &ContentPart) -> Result<Metadata> {
    let mut content_type = part.mime_type();

    if content_type == "application/octet-stream" {
        let decoded = transfer::decode(part.encoding, &part.data)?;
        let guessed = tree_magic_mini::from_u8(&decoded);
        if guessed != "application/octet-stream" {
            debug!(guessed, "Guessed content type from payload");
            content_type = guessed.to_string();
        }
    }

    // Attached messages are decoded once for their subject and note marker.
    let message = part
        .is_rfc822()
        .then(|| transfer::decode(part.encoding, &part.data))
        .transpose()?;

    let display_name = match (part.filename.as_deref(), message.as_deref()) {
        (Some(raw), _) => {
            let decoded = header::decode_encoded_words(raw);
            naming::basename(&decoded).to_string()
        }
        (None, Some(message)) => {
            mime::subject_of(message).unwrap_or_else(|| DEFAULT_FILENAME.to_string())
        }
        (None, None) => DEFAULT_FILENAME.to_string(),
    };
    let display_name = if display_name.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        display_name
    };

    let mut sink = transfer::CountingSink::default();
    transfer::decode_to(part.encoding, &part.data, &mut sink)?;

    let mut metadata = Metadata::new(display_name, content_type, sink.written());
    metadata.description = part
        .description
        .as_deref()
        .map(header::decode_encoded_words);
    metadata.mail_note = message
        .as_deref()
        .is_some_and(|message| mime::has_header(message, MAIL_NOTE_HEADER));
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransferEncoding;

    #[test]
    fn test_shared_worker_is_reused() {
        let first = DecodeWorker::shared().unwrap();
        let second = DecodeWorker::shared().unwrap();
        assert!(first.jobs.same_channel(&second.jobs));

        let private = DecodeWorker::spawn().unwrap();
        assert!(!private.jobs.same_channel(&first.jobs));
    }

    #[tokio::test]
    async fn test_decode_base64_part() {
        let worker = DecodeWorker::spawn().unwrap();
        let part = ContentPart::new("text/plain", &b"aGVsbG8="[..])
            .with_encoding(TransferEncoding::Base64);
        let decoded = worker.decode(&part).await.unwrap();
        assert_eq!(&decoded[..], b"hello");
    }

    #[tokio::test]
    async fn test_derive_metadata_strips_path_and_decodes_name() {
        let worker = DecodeWorker::spawn().unwrap();
        let part = ContentPart::new("Image/PNG", &b"iVBORw0KGgo="[..])
            .with_encoding(TransferEncoding::Base64)
            .with_filename("C:\\tmp\\=?UTF-8?Q?f=C3=B6to?=.png")
            .with_description("holiday");
        let meta = worker
            .derive_metadata(&part, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(meta.display_name, "f\u{f6}to.png");
        assert_eq!(meta.content_type, "image/png");
        assert_eq!(meta.size, 8);
        assert_eq!(meta.description.as_deref(), Some("holiday"));
    }

    #[tokio::test]
    async fn test_derive_metadata_defaults_name() {
        let worker = DecodeWorker::spawn().unwrap();
        let part = ContentPart::new("text/plain", &b"x"[..]);
        let meta = worker
            .derive_metadata(&part, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(meta.display_name, DEFAULT_FILENAME);
    }

    #[tokio::test]
    async fn test_derive_metadata_uses_subject_for_messages() {
        let worker = DecodeWorker::spawn().unwrap();
        let part = ContentPart::new("message/rfc822", &b"Subject: Lunch?\r\n\r\nbody"[..]);
        let meta = worker
            .derive_metadata(&part, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(meta.display_name, "Lunch?");
        assert_eq!(meta.icon, "mail-message");
    }

    #[tokio::test]
    async fn test_derive_metadata_flags_encoded_mail_note() {
        let worker = DecodeWorker::spawn().unwrap();
        // "Subject: Memo\r\nX-Evolution-Note: True\r\n\r\nbody\r\n"
        let part = ContentPart::new(
            "message/rfc822",
            &b"U3ViamVjdDogTWVtbw0KWC1Fdm9sdXRpb24tTm90ZTogVHJ1ZQ0KDQpib2R5DQo="[..],
        )
        .with_encoding(TransferEncoding::Base64);
        let meta = worker
            .derive_metadata(&part, CancellationToken::new())
            .await
            .unwrap();
        assert!(meta.mail_note);
        assert_eq!(meta.display_name, "Memo");
    }

    #[tokio::test]
    async fn test_derive_metadata_observes_cancel() {
        let worker = DecodeWorker::spawn().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let part = ContentPart::new("text/plain", &b"x"[..]);
        let err = worker.derive_metadata(&part, token).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
