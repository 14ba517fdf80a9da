//! In-flight transaction state and the correlation map keyed by the host's
//! message id.

use crate::message::{RequestSnapshot, ResponseSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::RwLock;

/// Everything decided at request time that response correlation needs later.
///
/// Response slots are written once each, by the single task that owns that
/// variant's send; readers only ever take brief snapshots. The log entry id
/// is set once, after the entry is published.
#[derive(Debug)]
pub struct PendingTransaction {
    pub original: RequestSnapshot,
    pub modified: Option<RequestSnapshot>,
    pub unauth: Option<RequestSnapshot>,
    /// Unauthenticated variant testing was on for this transaction.
    pub unauth_testing: bool,
    /// Preview mode: the original went out live, the rewrite goes out-of-band.
    pub preview: bool,
    /// The rewritten request replaced the original on the live connection.
    pub modified_sent: bool,
    log_entry_id: OnceLock<u64>,
    modified_preview_response: Mutex<Option<ResponseSnapshot>>,
    unauth_response: Mutex<Option<ResponseSnapshot>>,
    awaiting_modified_preview: AtomicBool,
    awaiting_unauth: AtomicBool,
}

impl PendingTransaction {
    pub fn new(
        original: RequestSnapshot,
        modified: Option<RequestSnapshot>,
        unauth: Option<RequestSnapshot>,
        unauth_testing: bool,
        preview: bool,
        modified_sent: bool,
    ) -> Self {
        let awaiting_modified_preview = preview && modified.is_some();
        let awaiting_unauth = unauth.is_some();
        Self {
            original,
            modified,
            unauth,
            unauth_testing,
            preview,
            modified_sent,
            log_entry_id: OnceLock::new(),
            modified_preview_response: Mutex::new(None),
            unauth_response: Mutex::new(None),
            awaiting_modified_preview: AtomicBool::new(awaiting_modified_preview),
            awaiting_unauth: AtomicBool::new(awaiting_unauth),
        }
    }

    pub fn has_modified_change(&self) -> bool {
        self.modified
            .as_ref()
            .map(|m| m.to_text() != self.original.to_text())
            .unwrap_or(false)
    }

    pub fn has_unauth_variant(&self) -> bool {
        self.unauth.is_some()
    }

    /// Record the log entry this transaction was published under. First
    /// caller wins; later calls are ignored.
    pub fn set_log_entry_id(&self, id: u64) {
        let _ = self.log_entry_id.set(id);
    }

    pub fn log_entry_id(&self) -> Option<u64> {
        self.log_entry_id.get().copied()
    }

    pub fn set_modified_preview_response(&self, response: ResponseSnapshot) {
        *lock(&self.modified_preview_response) = Some(response);
    }

    pub fn modified_preview_response(&self) -> Option<ResponseSnapshot> {
        lock(&self.modified_preview_response).clone()
    }

    pub fn set_unauth_response(&self, response: ResponseSnapshot) {
        *lock(&self.unauth_response) = Some(response);
    }

    pub fn unauth_response(&self) -> Option<ResponseSnapshot> {
        lock(&self.unauth_response).clone()
    }

    /// Mark the out-of-band modified send finished, with or without a
    /// response.
    pub fn finish_modified_preview(&self) {
        self.awaiting_modified_preview.store(false, Ordering::SeqCst);
    }

    pub fn finish_unauth(&self) {
        self.awaiting_unauth.store(false, Ordering::SeqCst);
    }

    pub fn awaiting_synthetic(&self) -> bool {
        self.awaiting_modified_preview.load(Ordering::SeqCst)
            || self.awaiting_unauth.load(Ordering::SeqCst)
    }
}

// A poisoned slot still holds valid data; the writer only ever stores a
// whole snapshot.
fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Correlation map from the host's message id to the pending state recorded
/// at request time.
#[derive(Default)]
pub struct CorrelationTracker {
    pending: RwLock<HashMap<u64, Arc<PendingTransaction>>>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, message_id: u64, pending: Arc<PendingTransaction>) {
        self.pending.write().await.insert(message_id, pending);
    }

    /// Claim the pending state for a message. At most one caller gets it.
    pub async fn remove(&self, message_id: u64) -> Option<Arc<PendingTransaction>> {
        self.pending.write().await.remove(&message_id)
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.pending.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Header, HttpService};

    fn request() -> RequestSnapshot {
        RequestSnapshot::build(
            HttpService::new("example.com", 443, true),
            "GET",
            "/",
            vec![Header::new("Host", "example.com")],
            "",
        )
    }

    #[test]
    fn awaiting_tracks_outstanding_sends() {
        let modified = request().with_added_header("X-Role", "admin");
        let pending = PendingTransaction::new(
            request(),
            Some(modified),
            Some(request()),
            true,
            true,
            false,
        );
        assert!(pending.awaiting_synthetic());
        pending.finish_modified_preview();
        assert!(pending.awaiting_synthetic());
        pending.finish_unauth();
        assert!(!pending.awaiting_synthetic());
    }

    #[test]
    fn direct_mode_does_not_await_modified() {
        let modified = request().with_added_header("X-Role", "admin");
        let pending =
            PendingTransaction::new(request(), Some(modified), None, false, false, true);
        assert!(!pending.awaiting_synthetic());
        assert!(pending.has_modified_change());
    }

    #[test]
    fn log_entry_id_is_write_once() {
        let pending = PendingTransaction::new(request(), None, None, false, false, false);
        assert_eq!(pending.log_entry_id(), None);
        pending.set_log_entry_id(5);
        pending.set_log_entry_id(9);
        assert_eq!(pending.log_entry_id(), Some(5));
    }

    #[tokio::test]
    async fn tracker_claims_are_exclusive() {
        let tracker = CorrelationTracker::new();
        let pending = Arc::new(PendingTransaction::new(
            request(),
            None,
            None,
            false,
            false,
            false,
        ));
        tracker.insert(42, pending).await;
        assert_eq!(tracker.len().await, 1);
        assert!(tracker.remove(42).await.is_some());
        assert!(tracker.remove(42).await.is_none());
    }
}
