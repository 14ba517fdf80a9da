//! Out-of-band dispatch of synthetic request variants.
//!
//! Each accepted send runs as its own tracked task: send the variant, record
//! the response on the pending transaction, and fold it into the log entry if
//! one has been published. Shutdown stops intake, then waits out in-flight
//! sends for a bounded grace period.

use crate::host::HostClient;
use crate::log::LogStore;
use crate::pending::PendingTransaction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Which synthetic variant a send carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Modified,
    Unauth,
}

impl Variant {
    fn label(self) -> &'static str {
        match self {
            Self::Modified => "modified",
            Self::Unauth => "unauthenticated",
        }
    }
}

pub struct SyntheticDispatcher {
    host: Arc<dyn HostClient>,
    store: Arc<LogStore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    accepting: AtomicBool,
}

impl SyntheticDispatcher {
    pub fn new(host: Arc<dyn HostClient>, store: Arc<LogStore>) -> Self {
        Self {
            host,
            store,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            accepting: AtomicBool::new(true),
        }
    }

    /// Queue one variant of a pending transaction for out-of-band sending.
    ///
    /// A rejected or failed send still clears the variant's awaiting flag, so
    /// correlation never waits on a response that cannot arrive.
    pub fn submit(&self, pending: Arc<PendingTransaction>, variant: Variant) {
        let request = match variant {
            Variant::Modified => pending.modified.clone(),
            Variant::Unauth => pending.unauth.clone(),
        };
        let Some(request) = request else {
            finish(&pending, variant);
            return;
        };

        if !self.accepting.load(Ordering::SeqCst) {
            warn!(
                variant = variant.label(),
                url = %request.url(),
                "dispatcher is shut down, dropping synthetic send"
            );
            finish(&pending, variant);
            return;
        }

        let host = Arc::clone(&self.host);
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(variant = variant.label(), "synthetic send cancelled");
                    finish(&pending, variant);
                    return;
                }
                outcome = host.send_request(&request) => outcome,
            };

            match outcome {
                Ok(Some(response)) => {
                    debug!(
                        variant = variant.label(),
                        status = response.status_code(),
                        url = %request.url(),
                        "synthetic response received"
                    );
                    match variant {
                        Variant::Modified => pending.set_modified_preview_response(response),
                        Variant::Unauth => pending.set_unauth_response(response),
                    }
                    finish(&pending, variant);
                    if let Some(id) = pending.log_entry_id() {
                        let merged = store
                            .update_by_id(id, |entry| {
                                entry.merged(
                                    pending.modified_preview_response(),
                                    pending.unauth_response(),
                                )
                            })
                            .await;
                        if !merged {
                            debug!(entry_id = id, "synthetic response outlived its log entry");
                        }
                    }
                }
                Ok(None) => {
                    warn!(
                        variant = variant.label(),
                        url = %request.url(),
                        "synthetic send returned no response"
                    );
                    finish(&pending, variant);
                }
                Err(error) => {
                    warn!(
                        variant = variant.label(),
                        url = %request.url(),
                        %error,
                        "synthetic send failed"
                    );
                    finish(&pending, variant);
                }
            }
        });
    }

    /// Stop accepting new sends, then wait up to `grace` for in-flight ones.
    /// Sends still running after the grace period are cancelled.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "synthetic sends still in flight after grace period, cancelling"
            );
            self.cancel.cancel();
        }
    }
}

fn finish(pending: &PendingTransaction, variant: Variant) {
    match variant {
        Variant::Modified => pending.finish_modified_preview(),
        Variant::Unauth => pending.finish_unauth(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostClient;
    use crate::log::LogEntry;
    use crate::message::{Header, HttpService, RequestSnapshot, ResponseSnapshot};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CannedHost {
        status: u16,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HostClient for CannedHost {
        async fn send_request(
            &self,
            _request: &RequestSnapshot,
        ) -> anyhow::Result<Option<ResponseSnapshot>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(ResponseSnapshot::of(self.status, "ok")))
        }

        fn is_in_scope(&self, _url: &str) -> bool {
            true
        }
    }

    struct FailingHost;

    #[async_trait]
    impl HostClient for FailingHost {
        async fn send_request(
            &self,
            _request: &RequestSnapshot,
        ) -> anyhow::Result<Option<ResponseSnapshot>> {
            anyhow::bail!("connection refused")
        }

        fn is_in_scope(&self, _url: &str) -> bool {
            true
        }
    }

    fn request() -> RequestSnapshot {
        RequestSnapshot::build(
            HttpService::new("example.com", 443, true),
            "GET",
            "/",
            vec![
                Header::new("Host", "example.com"),
                Header::new("Cookie", "session=abc"),
            ],
            "",
        )
    }

    fn pending_with_unauth() -> Arc<PendingTransaction> {
        let original = request();
        let unauth = crate::rules::strip_credentials(&original);
        Arc::new(PendingTransaction::new(
            original, None, unauth, true, false, false,
        ))
    }

    #[tokio::test]
    async fn successful_send_records_response_and_merges() {
        let host = Arc::new(CannedHost {
            status: 401,
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(LogStore::new(100));
        store.add(LogEntry::new(1, request())).await;

        let dispatcher = SyntheticDispatcher::new(host.clone(), store.clone());
        let pending = pending_with_unauth();
        pending.set_log_entry_id(1);

        dispatcher.submit(Arc::clone(&pending), Variant::Unauth);
        dispatcher.shutdown(Duration::from_secs(5)).await;

        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
        assert!(!pending.awaiting_synthetic());
        assert_eq!(
            pending.unauth_response().map(|r| r.status_code()),
            Some(401)
        );
        let entry = store.find_by_id(1).await.unwrap();
        assert_eq!(entry.unauth_response.as_ref().map(|r| r.status_code()), Some(401));
    }

    #[tokio::test]
    async fn failed_send_clears_flag_without_response() {
        let store = Arc::new(LogStore::new(100));
        let dispatcher = SyntheticDispatcher::new(Arc::new(FailingHost), store);
        let pending = pending_with_unauth();

        dispatcher.submit(Arc::clone(&pending), Variant::Unauth);
        dispatcher.shutdown(Duration::from_secs(5)).await;

        assert!(!pending.awaiting_synthetic());
        assert!(pending.unauth_response().is_none());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_sends() {
        let host = Arc::new(CannedHost {
            status: 200,
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(LogStore::new(100));
        let dispatcher = SyntheticDispatcher::new(host.clone(), store);
        dispatcher.shutdown(Duration::from_secs(1)).await;

        let pending = pending_with_unauth();
        dispatcher.submit(Arc::clone(&pending), Variant::Unauth);
        assert_eq!(host.calls.load(Ordering::SeqCst), 0);
        assert!(!pending.awaiting_synthetic());
    }

    #[tokio::test]
    async fn variant_without_request_is_a_no_op() {
        let store = Arc::new(LogStore::new(100));
        let dispatcher = SyntheticDispatcher::new(
            Arc::new(CannedHost {
                status: 200,
                calls: AtomicUsize::new(0),
            }),
            store,
        );
        let pending = Arc::new(PendingTransaction::new(
            request(),
            None,
            None,
            false,
            false,
            false,
        ));
        dispatcher.submit(Arc::clone(&pending), Variant::Modified);
        assert!(!pending.awaiting_synthetic());
    }
}
