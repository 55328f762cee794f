//! Audit Log
//!
//! Append-only history of every governance decision and execution outcome.
//! Appends are serialized under one lock so write order is time order.
//! Each record carries the hash of its predecessor, so a removed, reordered
//! or edited line breaks the chain and is caught by
//! [`AuditLog::verify_integrity`].

mod store;

pub use store::{AuditStore, FileAuditStore, MemoryAuditStore};

use crate::types::{Clock, SharedClock, SystemClock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hash that precedes the first record
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Audit errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Storage I/O failed
    #[error("audit storage error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialized
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The hash chain is broken at this sequence number
    #[error("audit chain broken at record {seq}")]
    IntegrityViolation {
        /// First record that does not verify
        seq: u64,
    },
}

/// Outcome class of an audited step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// Step completed
    Success,
    /// Step refused by review or the static gate
    Rejected,
    /// Step ran and failed
    Failed,
    /// Caller or approver refused
    Denied,
}

impl AuditStatus {
    /// Lowercase name as stored
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Denied => "denied",
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record content supplied by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    /// Kind of step, e.g. `action_review`
    pub action: String,
    /// Outcome class
    pub status: AuditStatus,
    /// Who performed the step
    pub actor: String,
    /// Free-form structured details
    pub details: BTreeMap<String, serde_json::Value>,
    /// Error detail, if any
    pub error: Option<String>,
}

impl AuditEntry {
    /// Start an entry
    pub fn new(action: impl Into<String>, status: AuditStatus, actor: impl ToString) -> Self {
        Self {
            action: action.into(),
            status,
            actor: actor.to_string(),
            details: BTreeMap::new(),
            error: None,
        }
    }

    /// Add one detail
    #[must_use]
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach an error
    #[must_use]
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// One persisted record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Write index, starting at zero
    pub seq: u64,
    /// Kind of step
    pub action: String,
    /// Outcome class
    pub status: AuditStatus,
    /// Who performed the step
    pub actor: String,
    /// Structured details
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Error detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the record was written
    pub timestamp: DateTime<Utc>,
    /// Hash of the preceding record
    pub prev_hash: String,
    /// Hash of this record
    pub hash: String,
}

impl AuditRecord {
    fn compute_hash(&self) -> Result<String, AuditError> {
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_le_bytes());
        hasher.update(self.action.as_bytes());
        hasher.update([0]);
        hasher.update(self.status.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.actor.as_bytes());
        hasher.update([0]);
        hasher.update(serde_json::to_vec(&self.details)?);
        hasher.update([0]);
        if let Some(error) = &self.error {
            hasher.update(error.as_bytes());
        }
        hasher.update([0]);
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(self.prev_hash.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug)]
struct ChainHead {
    next_seq: u64,
    last_hash: String,
}

/// Append-only audit log over a pluggable store
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    clock: SharedClock,
    head: Mutex<ChainHead>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("store", &self.store)
            .field("head", &*self.head.lock())
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Open a log over `store`, continuing any chain already in it
    ///
    /// # Errors
    /// The store could not be read.
    pub fn open(store: Arc<dyn AuditStore>) -> Result<Self, AuditError> {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Open with an explicit clock
    ///
    /// # Errors
    /// The store could not be read.
    pub fn with_clock(store: Arc<dyn AuditStore>, clock: SharedClock) -> Result<Self, AuditError> {
        let head = match parse_lines(store.read_lines()?).last() {
            Some(last) => ChainHead {
                next_seq: last.seq + 1,
                last_hash: last.hash.clone(),
            },
            None => ChainHead {
                next_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            },
        };
        Ok(Self {
            store,
            clock,
            head: Mutex::new(head),
        })
    }

    /// Log backed by a fresh in-memory store
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryAuditStore::new()),
            clock: Arc::new(SystemClock),
            head: Mutex::new(ChainHead {
                next_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            }),
        }
    }

    /// Append a record
    ///
    /// The chain head only advances once the line is persisted.
    ///
    /// # Errors
    /// Serialization or storage failure.
    pub fn append(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let mut head = self.head.lock();
        let mut record = AuditRecord {
            seq: head.next_seq,
            action: entry.action,
            status: entry.status,
            actor: entry.actor,
            details: entry.details,
            error: entry.error,
            timestamp: self.clock.now(),
            prev_hash: head.last_hash.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash()?;
        self.store.append_line(&serde_json::to_string(&record)?)?;
        head.next_seq += 1;
        head.last_hash.clone_from(&record.hash);
        debug!(seq = record.seq, action = %record.action, status = %record.status, "Audit record written");
        Ok(record)
    }

    /// Full history in write order, skipping malformed lines
    ///
    /// # Errors
    /// The store could not be read.
    pub fn history(&self) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(parse_lines(self.store.read_lines()?))
    }

    /// Last `n` records in write order
    ///
    /// # Errors
    /// The store could not be read.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditRecord>, AuditError> {
        let mut records = self.history()?;
        let start = records.len().saturating_sub(n);
        Ok(records.split_off(start))
    }

    /// Check the hash chain; returns the number of verified records
    ///
    /// # Errors
    /// [`AuditError::IntegrityViolation`] at the first record that does not
    /// verify.
    pub fn verify_integrity(&self) -> Result<usize, AuditError> {
        let _guard = self.head.lock();
        let records = parse_lines(self.store.read_lines()?);
        let mut prev = GENESIS_HASH.to_string();
        for (expected_seq, record) in (0_u64..).zip(&records) {
            if record.seq != expected_seq
                || record.prev_hash != prev
                || record.compute_hash()? != record.hash
            {
                return Err(AuditError::IntegrityViolation { seq: record.seq });
            }
            prev.clone_from(&record.hash);
        }
        Ok(records.len())
    }
}

fn parse_lines(lines: Vec<String>) -> Vec<AuditRecord> {
    lines
        .into_iter()
        .enumerate()
        .filter_map(|(idx, line)| match serde_json::from_str::<AuditRecord>(&line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(line = idx + 1, error = %e, "Skipping malformed audit line");
                None
            }
        })
        .collect()
}
