// retention.rs: Retention pruning with a signed chain anchor.
//
// Records are retained until a configured horizon. Cutting the head of a
// hash chain would make the first retained record look orphaned, so
// pruning writes an *anchor* next to the log (`<log>.anchor`): the
// sequence number and `previous_hash` the first retained record is expected
// to carry, signed by the audit key. Integrity validation starts from the
// anchor instead of from sequence 0.
//
// Pruning rewrites the log file and must run while no writer has it open
// (the daemon does it at startup, before the AuditTrail is started).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuditError;
use crate::hasher;
use crate::record::AuditRecord;
use crate::signer::{SignatureVerifier, Signer};

/// Signed marker for where a pruned chain resumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainAnchor {
    /// Sequence number of the first record still in the log.
    pub sequence: u64,
    /// `previous_hash` that record must carry.
    pub previous_hash: Option<String>,
    /// Total records removed over all prunes so far.
    pub pruned_records: u64,
    pub pruned_at: DateTime<Utc>,
    pub key_id: String,
    pub signature: String,
}

#[derive(Serialize)]
struct AnchorBody<'a> {
    sequence: u64,
    previous_hash: &'a Option<String>,
    pruned_records: u64,
    pruned_at: DateTime<Utc>,
    key_id: &'a str,
}

impl ChainAnchor {
    fn body_json(&self) -> Result<String, serde_json::Error> {
        hasher::canonical_json(&AnchorBody {
            sequence: self.sequence,
            previous_hash: &self.previous_hash,
            pruned_records: self.pruned_records,
            pruned_at: self.pruned_at,
            key_id: &self.key_id,
        })
    }

    fn sealed<S: Signer + ?Sized>(
        sequence: u64,
        previous_hash: Option<String>,
        pruned_records: u64,
        signer: &S,
    ) -> Result<Self, AuditError> {
        let mut anchor = Self {
            sequence,
            previous_hash,
            pruned_records,
            pruned_at: Utc::now(),
            key_id: signer.key_id().to_string(),
            signature: String::new(),
        };
        anchor.signature = signer.sign_b64(anchor.body_json()?.as_bytes());
        Ok(anchor)
    }

    pub fn signature_valid<V: SignatureVerifier + ?Sized>(
        &self,
        verifier: &V,
    ) -> Result<bool, serde_json::Error> {
        Ok(verifier.verify_b64(self.body_json()?.as_bytes(), &self.signature))
    }

    /// Load the anchor for `log_path`, if pruning ever happened.
    pub fn load(log_path: &Path) -> Result<Option<Self>, AuditError> {
        let path = anchor_path(log_path);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .map_err(|source| AuditError::OpenFailed { path, source })?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn save(&self, log_path: &Path) -> Result<(), AuditError> {
        let path = anchor_path(log_path);
        let tmp = tmp_path(&path);
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Result of a prune pass.
#[derive(Debug, Clone)]
pub struct PruneOutcome {
    pub removed: usize,
    pub retained: usize,
    /// The anchor written by this pass (None if nothing was removed).
    pub anchor: Option<ChainAnchor>,
}

/// Path of the anchor file belonging to a log.
pub fn anchor_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_os_string();
    name.push(".anchor");
    PathBuf::from(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Remove every record sealed before `horizon` and re-anchor the chain.
///
/// Records are only removed from the head: the log is append-only, so
/// timestamps are non-decreasing and the first record at or after the
/// horizon marks the cut. A log that does not parse is left untouched.
pub fn prune_before<S: Signer + ?Sized>(
    log_path: &Path,
    horizon: DateTime<Utc>,
    signer: &S,
) -> Result<PruneOutcome, AuditError> {
    if !log_path.exists() {
        return Ok(PruneOutcome {
            removed: 0,
            retained: 0,
            anchor: None,
        });
    }

    let content = fs::read_to_string(log_path).map_err(|source| AuditError::OpenFailed {
        path: log_path.to_path_buf(),
        source,
    })?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut records = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        let record: AuditRecord =
            serde_json::from_str(line).map_err(|e| AuditError::ChainRecovery {
                path: log_path.to_path_buf(),
                reason: format!("record {} unreadable, refusing to prune: {}", index, e),
            })?;
        records.push(record);
    }

    let cut = records
        .iter()
        .position(|r| r.timestamp >= horizon)
        .unwrap_or(records.len());
    if cut == 0 {
        return Ok(PruneOutcome {
            removed: 0,
            retained: records.len(),
            anchor: None,
        });
    }

    let already_pruned = ChainAnchor::load(log_path)?
        .map(|a| a.pruned_records)
        .unwrap_or(0);
    let (sequence, previous_hash) = match records.get(cut) {
        Some(first_kept) => (first_kept.sequence, first_kept.previous_hash.clone()),
        None => {
            let last = &records[records.len() - 1];
            (last.sequence + 1, Some(last.record_hash.clone()))
        }
    };
    let anchor = ChainAnchor::sealed(
        sequence,
        previous_hash,
        already_pruned + cut as u64,
        signer,
    )?;

    let mut retained = String::new();
    for line in &lines[cut..] {
        retained.push_str(line);
        retained.push('\n');
    }
    let tmp = tmp_path(log_path);
    fs::write(&tmp, retained)?;
    anchor.save(log_path)?;
    fs::rename(&tmp, log_path)?;

    tracing::info!(
        removed = cut,
        retained = records.len() - cut,
        anchor_sequence = sequence,
        "pruned audit records past retention horizon"
    );

    Ok(PruneOutcome {
        removed: cut,
        retained: records.len() - cut,
        anchor: Some(anchor),
    })
}
