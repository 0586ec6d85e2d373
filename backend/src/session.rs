use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use shared::SessionRecord;

use crate::inference::PredictionResult;

pub const DEFAULT_MAX_SESSIONS: usize = 1024;

#[derive(Default)]
struct Records {
    entries: HashMap<String, (u64, SessionRecord)>,
    next_seq: u64,
}

/// Latest diagnosis per session id, bounded to the most recently updated sessions.
#[derive(Clone)]
pub struct SessionStore {
    records: Arc<RwLock<Records>>,
    capacity: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    /// Stores `result` as the latest for `session_id`, evicting the least recently updated
    /// session when the store is full.
    pub fn record(&self, session_id: &str, result: &PredictionResult) -> SessionRecord {
        let record = SessionRecord {
            session_id: session_id.to_string(),
            diagnosis: result.label.clone(),
            class_index: result.class_index,
            certainty_percent: result.confidence,
            updated_at: Utc::now(),
        };
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if !records.entries.contains_key(session_id) && records.entries.len() >= self.capacity {
            let oldest = records
                .entries
                .iter()
                .min_by_key(|(_, (seq, _))| *seq)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                log::debug!("Evicting session {}", oldest);
                records.entries.remove(&oldest);
            }
        }
        let seq = records.next_seq;
        records.next_seq += 1;
        records
            .entries
            .insert(session_id.to_string(), (seq, record.clone()));
        record
    }

    pub fn latest(&self, session_id: &str) -> Option<SessionRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(session_id)
            .map(|(_, record)| record.clone())
    }
}
