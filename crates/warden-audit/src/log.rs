// log.rs: Append-only JSONL audit log and integrity validation.
//
// The audit log is stored as a JSONL (JSON Lines) file: one canonical JSON
// record per line. The format is append-friendly and easy to inspect with
// standard tools (jq, grep, etc.).
//
// Each record carries the `record_hash` of the record before it, forming a
// hash chain, and a signature over its body. Integrity validation replays
// the raw file and reports the *first* place where anything does not line
// up: a line that does not parse, a line that is not in canonical form, a
// sequence gap, a broken link, a wrong hash, or a bad signature.
//
// `AuditLog` itself is synchronous and single-owner. Concurrent producers go
// through `AuditTrail` (writer.rs), which owns one `AuditLog` on a dedicated
// writer thread.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuditError;
use crate::record::{AuditRecord, RecordKind};
use crate::retention::ChainAnchor;
use crate::signer::{SignatureVerifier, Signer};

/// Where the next record attaches to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub next_sequence: u64,
    pub last_hash: Option<String>,
}

/// An append-only audit log backed by a JSONL file.
///
/// `BufWriter` batches the write of a single line; after each record the
/// buffer is flushed and the file data is synced so an acknowledged record
/// survives a crash.
pub struct AuditLog {
    writer: BufWriter<File>,
    path: PathBuf,
    head: ChainHead,
}

impl AuditLog {
    /// Open (or create) an audit log at the given path.
    ///
    /// If the file already has content, the last record is read to recover
    /// the chain head. An empty log that was pruned resumes from its anchor.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| AuditError::OpenFailed {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let head = Self::recover_head(&path)?;

        // Append mode: existing data is never overwritten.
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::OpenFailed {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(
            path = %path.display(),
            next_sequence = head.next_sequence,
            "opened audit log"
        );

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            head,
        })
    }

    /// Seal a new record at the chain head and write it.
    pub fn append<S: Signer + ?Sized>(
        &mut self,
        kind: RecordKind,
        payload: serde_json::Value,
        signer: &S,
    ) -> Result<AuditRecord, AuditError> {
        let record = AuditRecord::seal(
            self.head.next_sequence,
            self.head.last_hash.clone(),
            kind,
            payload,
            signer,
        )?;
        self.write_sealed(&record)?;
        Ok(record)
    }

    /// Write a record that was sealed elsewhere (by the AuditTrail).
    ///
    /// The record must attach exactly at the current head; anything else
    /// would break the chain on disk.
    pub fn write_sealed(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        if record.sequence != self.head.next_sequence
            || record.previous_hash != self.head.last_hash
        {
            return Err(AuditError::ChainRecovery {
                path: self.path.clone(),
                reason: format!(
                    "record {} does not attach at head (expected sequence {})",
                    record.sequence, self.head.next_sequence
                ),
            });
        }

        let line = record.canonical_line()?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        self.head = ChainHead {
            next_sequence: record.sequence + 1,
            last_hash: Some(record.record_hash.clone()),
        };
        Ok(())
    }

    /// Current chain head.
    pub fn head(&self) -> &ChainHead {
        &self.head
    }

    /// Return the path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all records from a log file, oldest first. Blank lines are
    /// skipped. A missing file reads as an empty log.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(AuditError::OpenFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Find the decision record carrying `decision_id` in its payload.
    pub fn find_decision(
        path: impl AsRef<Path>,
        decision_id: Uuid,
    ) -> Result<Option<AuditRecord>, AuditError> {
        let wanted = decision_id.to_string();
        Ok(Self::read_all(path)?.into_iter().rev().find(|r| {
            r.kind == RecordKind::Decision
                && r.payload.get("decision_id").and_then(|v| v.as_str()) == Some(wanted.as_str())
        }))
    }

    fn recover_head(path: &Path) -> Result<ChainHead, AuditError> {
        let anchored = || -> Result<ChainHead, AuditError> {
            Ok(match ChainAnchor::load(path)? {
                Some(anchor) => ChainHead {
                    next_sequence: anchor.sequence,
                    last_hash: anchor.previous_hash,
                },
                None => ChainHead {
                    next_sequence: 0,
                    last_hash: None,
                },
            })
        };

        if !path.exists() {
            return anchored();
        }

        let content = fs::read_to_string(path).map_err(|source| AuditError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let last_line = match content.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => line,
            None => return anchored(),
        };
        let last: AuditRecord =
            serde_json::from_str(last_line).map_err(|e| AuditError::ChainRecovery {
                path: path.to_path_buf(),
                reason: format!("last record unreadable: {}", e),
            })?;
        Ok(ChainHead {
            next_sequence: last.sequence + 1,
            last_hash: Some(last.record_hash),
        })
    }
}

// ── Integrity validation ──

/// Why validation stopped at a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// Not valid UTF-8 or not a parseable record.
    Malformed,
    /// Parses, but re-encoding does not reproduce the stored bytes.
    NonCanonical,
    /// Sequence number is not the expected next one.
    Sequence,
    /// `previous_hash` does not match the preceding record.
    Chain,
    /// Stored `record_hash` does not match the body.
    Hash,
    /// Signature does not verify.
    Signature,
    /// The retention anchor is present but its signature does not verify.
    Anchor,
}

impl std::fmt::Display for BreakKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakKind::Malformed => "malformed",
            BreakKind::NonCanonical => "non_canonical",
            BreakKind::Sequence => "sequence",
            BreakKind::Chain => "chain",
            BreakKind::Hash => "hash",
            BreakKind::Signature => "signature",
            BreakKind::Anchor => "anchor",
        };
        write!(f, "{}", s)
    }
}

/// The first place the chain stops verifying.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrityBreak {
    /// Zero-based line index in the current file.
    pub index: usize,
    /// Sequence number of the offending record, when it could be read.
    pub sequence: Option<u64>,
    pub kind: BreakKind,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

/// Outcome of a full integrity pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrityReport {
    pub valid: bool,
    pub records_checked: usize,
    pub first_break: Option<IntegrityBreak>,
    /// Sequence the chain resumes from after retention pruning.
    pub anchored_at: Option<u64>,
    pub key_id: String,
    pub checked_at: DateTime<Utc>,
}

impl IntegrityReport {
    fn new(key_id: &str, anchored_at: Option<u64>) -> Self {
        Self {
            valid: true,
            records_checked: 0,
            first_break: None,
            anchored_at,
            key_id: key_id.to_string(),
            checked_at: Utc::now(),
        }
    }

    fn broken(mut self, brk: IntegrityBreak) -> Self {
        self.valid = false;
        self.first_break = Some(brk);
        self
    }
}

/// Validate the whole log at `path` against `verifier`.
///
/// Works on raw bytes so that non-UTF-8 garbage and hand edits that keep the
/// JSON valid are both caught. A missing log is trivially valid.
pub fn validate_integrity<V: SignatureVerifier + ?Sized>(
    path: impl AsRef<Path>,
    verifier: &V,
) -> Result<IntegrityReport, AuditError> {
    let path = path.as_ref();

    let anchor = ChainAnchor::load(path)?;
    let mut report = IntegrityReport::new(verifier.key_id(), anchor.as_ref().map(|a| a.sequence));
    let (mut expected_sequence, mut expected_previous) = match &anchor {
        Some(a) => {
            if !a.signature_valid(verifier)? {
                return Ok(report.broken(IntegrityBreak {
                    index: 0,
                    sequence: Some(a.sequence),
                    kind: BreakKind::Anchor,
                    expected: None,
                    actual: None,
                }));
            }
            (a.sequence, a.previous_hash.clone())
        }
        None => (0, None),
    };

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(source) => {
            return Err(AuditError::OpenFailed {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut pieces: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
    if pieces.last().is_some_and(|p| p.is_empty()) {
        pieces.pop();
    }

    for (index, raw) in pieces.into_iter().enumerate() {
        let malformed = |sequence: Option<u64>| IntegrityBreak {
            index,
            sequence,
            kind: BreakKind::Malformed,
            expected: None,
            actual: None,
        };

        let Ok(text) = std::str::from_utf8(raw) else {
            return Ok(report.broken(malformed(None)));
        };
        let record: AuditRecord = match serde_json::from_str(text) {
            Ok(record) => record,
            Err(_) => return Ok(report.broken(malformed(None))),
        };
        let seq = Some(record.sequence);

        let canonical = record.canonical_line()?;
        if canonical != text {
            return Ok(report.broken(IntegrityBreak {
                index,
                sequence: seq,
                kind: BreakKind::NonCanonical,
                expected: None,
                actual: None,
            }));
        }

        if record.sequence != expected_sequence {
            return Ok(report.broken(IntegrityBreak {
                index,
                sequence: seq,
                kind: BreakKind::Sequence,
                expected: Some(expected_sequence.to_string()),
                actual: Some(record.sequence.to_string()),
            }));
        }

        if record.previous_hash != expected_previous {
            return Ok(report.broken(IntegrityBreak {
                index,
                sequence: seq,
                kind: BreakKind::Chain,
                expected: expected_previous,
                actual: record.previous_hash,
            }));
        }

        let computed = record.computed_hash()?;
        if computed != record.record_hash {
            return Ok(report.broken(IntegrityBreak {
                index,
                sequence: seq,
                kind: BreakKind::Hash,
                expected: Some(computed),
                actual: Some(record.record_hash),
            }));
        }

        if !record.signature_valid(verifier)? {
            return Ok(report.broken(IntegrityBreak {
                index,
                sequence: seq,
                kind: BreakKind::Signature,
                expected: Some(verifier.key_id().to_string()),
                actual: Some(record.key_id),
            }));
        }

        report.records_checked += 1;
        expected_sequence = record.sequence + 1;
        expected_previous = Some(record.record_hash);
    }

    Ok(report)
}
