// writer.rs: Ordered, bounded background writer for the audit trail.
//
// Producers (gate evaluations, emergency transitions, overrides) never touch
// the file. They reserve a slot in a bounded `tokio::sync::mpsc` queue,
// seal the record against the in-memory chain head, and hand it to a single
// writer thread that appends and fsyncs in queue order.
//
// Ordering: the slot is reserved *before* sealing, and sealing + sending
// happen under the chain mutex. So the queue order is exactly the chain
// order, and once a record is sealed it is already in the queue. A caller
// that is dropped afterwards cannot leave a hole in the chain.
//
// If the queue stays full for the whole backpressure window the caller gets
// `AuditError::Backpressure` and nothing was sealed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::AuditError;
use crate::log::{self, AuditLog, ChainHead, IntegrityReport};
use crate::record::{AuditRecord, RecordKind};
use crate::signer::Signer;

/// Queue sizing for an [`AuditTrail`].
#[derive(Debug, Clone)]
pub struct TrailOptions {
    pub capacity: usize,
    pub backpressure_timeout: Duration,
}

impl Default for TrailOptions {
    fn default() -> Self {
        Self {
            capacity: 1024,
            backpressure_timeout: Duration::from_millis(500),
        }
    }
}

enum WriterCommand {
    Append {
        record: AuditRecord,
        ack: Option<oneshot::Sender<Result<(), String>>>,
    },
    Flush(oneshot::Sender<()>),
}

struct TrailInner {
    sender: mpsc::Sender<WriterCommand>,
    head: Mutex<ChainHead>,
    signer: Arc<dyn Signer>,
    path: PathBuf,
    backpressure_timeout: Duration,
    /// First write failure reported by the writer thread. Once set, the
    /// on-disk chain no longer matches `head` and appends are refused.
    failure: Arc<Mutex<Option<String>>>,
}

/// Shared handle to the audit trail. Cheap to clone.
#[derive(Clone)]
pub struct AuditTrail {
    inner: Arc<TrailInner>,
}

impl AuditTrail {
    /// Open the log at `path` and start the writer thread.
    pub fn start(
        path: impl AsRef<Path>,
        signer: Arc<dyn Signer>,
        options: TrailOptions,
    ) -> Result<Self, AuditError> {
        let log = AuditLog::open(path.as_ref())?;
        let head = log.head().clone();
        let (sender, receiver) = mpsc::channel(options.capacity.max(1));
        let failure = Arc::new(Mutex::new(None));

        let thread_failure = Arc::clone(&failure);
        std::thread::Builder::new()
            .name("warden-audit-writer".into())
            .spawn(move || run_writer(log, receiver, thread_failure))
            .map_err(|e| AuditError::WriterUnavailable(e.to_string()))?;

        tracing::info!(
            path = %path.as_ref().display(),
            next_sequence = head.next_sequence,
            capacity = options.capacity,
            "audit trail started"
        );

        Ok(Self {
            inner: Arc::new(TrailInner {
                sender,
                head: Mutex::new(head),
                signer,
                path: path.as_ref().to_path_buf(),
                backpressure_timeout: options.backpressure_timeout,
                failure,
            }),
        })
    }

    /// Queue a record. Returns once it is sealed and enqueued; the write
    /// itself happens in the background.
    ///
    /// A write that later fails is only reported by the next `flush`,
    /// `append` or `append_durable`, not to this caller. Use
    /// `append_durable` when the caller must not proceed without the record
    /// on disk.
    pub async fn append(
        &self,
        kind: RecordKind,
        payload: serde_json::Value,
    ) -> Result<AuditRecord, AuditError> {
        self.enqueue(kind, payload, None).await
    }

    /// Queue a record and wait until the writer has synced it to disk.
    pub async fn append_durable(
        &self,
        kind: RecordKind,
        payload: serde_json::Value,
    ) -> Result<AuditRecord, AuditError> {
        let (ack, done) = oneshot::channel();
        let record = self.enqueue(kind, payload, Some(ack)).await?;
        match done.await {
            Ok(Ok(())) => Ok(record),
            Ok(Err(reason)) => Err(AuditError::WriterUnavailable(reason)),
            Err(_) => Err(AuditError::WriterUnavailable(
                "writer stopped before acknowledging".into(),
            )),
        }
    }

    /// Wait until every record queued so far has been written.
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .sender
            .send(WriterCommand::Flush(tx))
            .await
            .map_err(|_| AuditError::WriterUnavailable("writer stopped".into()))?;
        rx.await
            .map_err(|_| AuditError::WriterUnavailable("writer stopped".into()))?;
        self.check_failure()
    }

    /// Flush, then validate the on-disk log with this trail's key.
    pub async fn validate_integrity(&self) -> Result<IntegrityReport, AuditError> {
        self.flush().await?;
        let path = self.inner.path.clone();
        let signer = Arc::clone(&self.inner.signer);
        tokio::task::spawn_blocking(move || log::validate_integrity(&path, &*signer))
            .await
            .map_err(|e| AuditError::WriterUnavailable(e.to_string()))?
    }

    /// Flush, then read every record back.
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>, AuditError> {
        self.flush().await?;
        let path = self.inner.path.clone();
        tokio::task::spawn_blocking(move || AuditLog::read_all(&path))
            .await
            .map_err(|e| AuditError::WriterUnavailable(e.to_string()))?
    }

    /// Flush, then look up a decision record by id.
    pub async fn find_decision(&self, decision_id: Uuid) -> Result<Option<AuditRecord>, AuditError> {
        self.flush().await?;
        let path = self.inner.path.clone();
        tokio::task::spawn_blocking(move || AuditLog::find_decision(&path, decision_id))
            .await
            .map_err(|e| AuditError::WriterUnavailable(e.to_string()))?
    }

    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.inner.signer
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Chain head as seen by producers (may be ahead of the disk).
    pub fn head(&self) -> ChainHead {
        match self.inner.head.lock() {
            Ok(head) => head.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn enqueue(
        &self,
        kind: RecordKind,
        payload: serde_json::Value,
        ack: Option<oneshot::Sender<Result<(), String>>>,
    ) -> Result<AuditRecord, AuditError> {
        self.check_failure()?;

        let permit = match tokio::time::timeout(
            self.inner.backpressure_timeout,
            self.inner.sender.reserve(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AuditError::WriterUnavailable("writer stopped".into())),
            Err(_) => {
                tracing::warn!(path = %self.inner.path.display(), "audit queue saturated");
                return Err(AuditError::Backpressure);
            }
        };

        let mut head = self
            .inner
            .head
            .lock()
            .map_err(|_| AuditError::WriterUnavailable("chain head lock poisoned".into()))?;
        let record = AuditRecord::seal(
            head.next_sequence,
            head.last_hash.clone(),
            kind,
            payload,
            self.inner.signer.as_ref(),
        )?;
        permit.send(WriterCommand::Append {
            record: record.clone(),
            ack,
        });
        *head = ChainHead {
            next_sequence: record.sequence + 1,
            last_hash: Some(record.record_hash.clone()),
        };
        Ok(record)
    }

    fn check_failure(&self) -> Result<(), AuditError> {
        let failure = self
            .inner
            .failure
            .lock()
            .map_err(|_| AuditError::WriterUnavailable("failure lock poisoned".into()))?;
        match failure.as_ref() {
            Some(reason) => Err(AuditError::WriterUnavailable(reason.clone())),
            None => Ok(()),
        }
    }

    /// A trail whose queue nobody drains, for exercising backpressure.
    #[cfg(test)]
    fn detached(
        path: &Path,
        signer: Arc<dyn Signer>,
        options: TrailOptions,
    ) -> (Self, mpsc::Receiver<WriterCommand>) {
        let (sender, receiver) = mpsc::channel(options.capacity.max(1));
        let trail = Self {
            inner: Arc::new(TrailInner {
                sender,
                head: Mutex::new(ChainHead {
                    next_sequence: 0,
                    last_hash: None,
                }),
                signer,
                path: path.to_path_buf(),
                backpressure_timeout: options.backpressure_timeout,
                failure: Arc::new(Mutex::new(None)),
            }),
        };
        (trail, receiver)
    }
}

fn run_writer(
    mut log: AuditLog,
    mut receiver: mpsc::Receiver<WriterCommand>,
    failure: Arc<Mutex<Option<String>>>,
) {
    while let Some(command) = receiver.blocking_recv() {
        match command {
            WriterCommand::Append { record, ack } => {
                let result = log.write_sealed(&record).map_err(|e| e.to_string());
                if let Err(reason) = &result {
                    tracing::error!(
                        sequence = record.sequence,
                        error = %reason,
                        "audit write failed; trail is now read-only"
                    );
                    if let Ok(mut slot) = failure.lock() {
                        slot.get_or_insert_with(|| reason.clone());
                    }
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!(path = %log.path().display(), "audit writer stopped");
}
