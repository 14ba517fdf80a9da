//! Request log: entries and the bounded store they live in.
//!
//! Entries are immutable once published. Correlation merges never mutate a
//! stored entry in place; they build a replacement and swap it in under the
//! store's write lock, so readers always observe a complete entry.

use crate::message::{ParamKind, RequestSnapshot, ResponseSnapshot};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const MIN_CAPACITY: usize = 100;

/// One logged transaction: the original request plus whichever variants and
/// responses the engine produced for it.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub original_request: RequestSnapshot,
    pub modified_request: Option<RequestSnapshot>,
    pub unauth_request: Option<RequestSnapshot>,
    pub original_response: Option<ResponseSnapshot>,
    pub modified_response: Option<ResponseSnapshot>,
    pub unauth_response: Option<ResponseSnapshot>,
    /// True when the rewritten request went out on the live connection, so
    /// the live response belongs to the modified side.
    pub modified_sent: bool,
    /// Unauthenticated-variant testing was on for this transaction, whether
    /// or not a variant could be derived. Drives display and filtering.
    pub unauth_testing: bool,
}

impl LogEntry {
    pub fn new(id: u64, original_request: RequestSnapshot) -> Self {
        Self {
            id,
            time: Utc::now(),
            original_request,
            modified_request: None,
            unauth_request: None,
            original_response: None,
            modified_response: None,
            unauth_response: None,
            modified_sent: false,
            unauth_testing: false,
        }
    }

    /// The request that actually went to the origin.
    pub fn sent_request(&self) -> &RequestSnapshot {
        if self.modified_sent {
            self.modified_request
                .as_ref()
                .unwrap_or(&self.original_request)
        } else {
            &self.original_request
        }
    }

    pub fn method(&self) -> &str {
        self.sent_request().method()
    }

    pub fn url(&self) -> String {
        self.sent_request().url()
    }

    /// Status of the most authoritative response on record. The live
    /// response wins; synthetic ones fill in when nothing else arrived.
    /// Zero means no response yet.
    pub fn status_code(&self) -> u16 {
        let live = if self.modified_sent {
            self.modified_response.as_ref()
        } else {
            self.original_response.as_ref()
        };
        live.or(self.original_response.as_ref())
            .or(self.modified_response.as_ref())
            .or(self.unauth_response.as_ref())
            .map(|r| r.status_code())
            .unwrap_or(0)
    }

    /// Did the rewrite actually change anything?
    pub fn was_modified(&self) -> bool {
        self.modified_request
            .as_ref()
            .map(|m| m.to_text() != self.original_request.to_text())
            .unwrap_or(false)
    }

    pub fn cookie_summary(&self) -> String {
        let count = self
            .sent_request()
            .parameters()
            .iter()
            .filter(|p| p.kind == ParamKind::Cookie)
            .count();
        if count == 0 {
            "None".to_string()
        } else {
            format!("{} cookie(s)", count)
        }
    }

    /// Counts every parameter the sent request carries, cookies included.
    pub fn parameter_summary(&self) -> String {
        let count = self.sent_request().parameters().len();
        if count == 0 {
            "None".to_string()
        } else {
            format!("{} parameter(s)", count)
        }
    }

    /// Build the replacement entry for a correlation merge. Incoming pieces
    /// win only where the stored entry has nothing; the timestamp of the
    /// stored entry is preserved.
    pub fn merged(
        &self,
        modified_response: Option<ResponseSnapshot>,
        unauth_response: Option<ResponseSnapshot>,
    ) -> Self {
        Self {
            modified_response: modified_response.or_else(|| self.modified_response.clone()),
            unauth_response: unauth_response.or_else(|| self.unauth_response.clone()),
            ..self.clone()
        }
    }
}

/// Bounded, append-ordered store of log entries.
pub struct LogStore {
    entries: RwLock<Vec<Arc<LogEntry>>>,
    capacity: usize,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            capacity: capacity.max(MIN_CAPACITY),
        }
    }

    /// Append an entry, evicting the oldest past capacity.
    pub async fn add(&self, entry: LogEntry) {
        let mut entries = self.entries.write().await;
        entries.push(Arc::new(entry));
        while entries.len() > self.capacity {
            entries.remove(0);
        }
    }

    /// Replace the entry with this id by the result of `update`. Find,
    /// compute and swap all happen under one write lock, so concurrent
    /// merges never lose each other's pieces.
    pub async fn update_by_id<F>(&self, id: u64, update: F) -> bool
    where
        F: FnOnce(&LogEntry) -> LogEntry,
    {
        let mut entries = self.entries.write().await;
        match entries.iter_mut().find(|e| e.id == id) {
            Some(slot) => {
                *slot = Arc::new(update(slot.as_ref()));
                true
            }
            None => {
                debug!(entry_id = id, "log entry evicted before update");
                false
            }
        }
    }

    pub async fn find_by_id(&self, id: u64) -> Option<Arc<LogEntry>> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub async fn entries(&self) -> Vec<Arc<LogEntry>> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Entries passing every enabled filter.
    pub async fn filtered(&self, filters: &[FilterRule]) -> Vec<Arc<LogEntry>> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| filters.iter().all(|f| f.matches(e)))
            .cloned()
            .collect()
    }
}

/// A named log-view filter.
pub struct FilterRule {
    pub name: String,
    pub enabled: bool,
    predicate: Box<dyn Fn(&LogEntry) -> bool + Send + Sync>,
}

impl FilterRule {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&LogEntry) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            predicate: Box::new(predicate),
        }
    }

    /// Disabled filters pass everything.
    pub fn matches(&self, entry: &LogEntry) -> bool {
        !self.enabled || (self.predicate)(entry)
    }
}

impl std::fmt::Debug for FilterRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRule")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .finish()
    }
}
