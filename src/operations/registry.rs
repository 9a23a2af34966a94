//! Operation Registry
//!
//! Per-session table of in-flight operations, keyed by identity with an
//! optional de-duplicating sequence.

use chrono::Utc;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::types::OperationInfo;
use crate::error::OperationError;

/// Callback requesting cancellation of one operation
pub type Canceler = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    info: OperationInfo,
    cancel: Canceler,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Uuid, Entry>,
    sequences: HashMap<u64, Uuid>,
}

/// Registry of in-flight operations
pub struct OperationRegistry {
    inner: Mutex<Inner>,
    next_sequence: AtomicU64,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Register an operation. Fails if the sequence or identity is taken.
    pub fn register(
        &self,
        id: Uuid,
        alias: &str,
        sequence: Option<u64>,
        cancel: Canceler,
    ) -> Result<(), OperationError> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&id) {
            return Err(OperationError::DuplicateOperation(id));
        }
        if let Some(sequence) = sequence {
            if let Some(existing) = inner.sequences.get(&sequence) {
                let alias = inner
                    .entries
                    .get(existing)
                    .map(|entry| entry.info.alias.clone())
                    .unwrap_or_default();
                warn!(
                    "Sequence {} is already used by operation {} ({})",
                    sequence, existing, alias
                );
                return Err(OperationError::DuplicateSequence { sequence, alias });
            }
            inner.sequences.insert(sequence, id);
        }
        inner.entries.insert(
            id,
            Entry {
                info: OperationInfo {
                    uuid: id,
                    alias: alias.to_string(),
                    sequence,
                    registered_at: Utc::now(),
                },
                cancel,
            },
        );
        debug!("Registered operation \"{}\" ({})", alias, id);
        Ok(())
    }

    /// Remove an operation; frees its sequence
    pub fn unregister(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(&id) {
            Some(entry) => {
                if let Some(sequence) = entry.info.sequence {
                    inner.sequences.remove(&sequence);
                }
                debug!("Unregistered operation \"{}\" ({})", entry.info.alias, id);
                true
            }
            None => false,
        }
    }

    /// Whether an operation with this sequence is in flight
    pub fn has(&self, sequence: u64) -> bool {
        self.inner.lock().sequences.contains_key(&sequence)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Request cancellation of one operation by identity
    pub fn cancel(&self, id: Uuid) -> bool {
        let cancel = self
            .inner
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.cancel.clone());
        match cancel {
            Some(cancel) => {
                cancel();
                true
            }
            None => false,
        }
    }

    /// Request cancellation of every registered operation
    pub fn cancel_all(&self) -> usize {
        let cancelers: Vec<Canceler> = self
            .inner
            .lock()
            .entries
            .values()
            .map(|entry| entry.cancel.clone())
            .collect();
        let count = cancelers.len();
        if count > 0 {
            debug!("Canceling {} operation(s)", count);
        }
        for cancel in cancelers {
            cancel();
        }
        count
    }

    /// Drop every entry without canceling
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.sequences.clear();
        count
    }

    /// Snapshot of in-flight operations, oldest first
    pub fn list(&self) -> Vec<OperationInfo> {
        let mut operations: Vec<OperationInfo> = self
            .inner
            .lock()
            .entries
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        operations.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        operations
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Hand out a fresh sequence number
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
