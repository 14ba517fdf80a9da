//! Interception entry points: request gating and rewrite, response
//! correlation, runtime state.

use crate::config::{EngineConfig, Settings};
use crate::dispatch::{SyntheticDispatcher, Variant};
use crate::highlight::{highlight_for, HighlightRule};
use crate::host::{HostClient, ToolKind};
use crate::log::{LogEntry, LogStore};
use crate::message::{RequestSnapshot, ResponseSnapshot};
use crate::pending::{CorrelationTracker, PendingTransaction};
use crate::rules::{apply_rules, strip_credentials, RewriteRule};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// What the host should do with an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    /// Forward the request unchanged.
    Continue,
    /// Forward this rewritten request instead.
    ContinueWith(RequestSnapshot),
}

/// Point-in-time counter snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandlerStats {
    pub requests_seen: u64,
    pub requests_transformed: u64,
    pub transform_errors: u64,
}

/// The engine's face toward the host proxy. One instance serves all tools
/// concurrently; every method is safe to call from any task.
pub struct InterceptHandler {
    host: Arc<dyn HostClient>,
    store: Arc<LogStore>,
    tracker: CorrelationTracker,
    dispatcher: SyntheticDispatcher,
    settings: RwLock<Arc<Settings>>,
    rules: RwLock<Arc<Vec<RewriteRule>>>,
    highlight_rules: RwLock<Arc<Vec<HighlightRule>>>,
    next_entry_id: AtomicU64,
    requests_seen: AtomicU64,
    requests_transformed: AtomicU64,
    transform_errors: AtomicU64,
}

impl InterceptHandler {
    pub fn new(host: Arc<dyn HostClient>, config: EngineConfig) -> Self {
        let store = Arc::new(LogStore::new(config.settings.max_log_entries));
        let dispatcher = SyntheticDispatcher::new(Arc::clone(&host), Arc::clone(&store));
        let handler = Self {
            host,
            store,
            tracker: CorrelationTracker::new(),
            dispatcher,
            settings: RwLock::new(Arc::new(config.settings)),
            rules: RwLock::new(Arc::new(Vec::new())),
            highlight_rules: RwLock::new(Arc::new(config.highlight_rules)),
            next_entry_id: AtomicU64::new(1),
            requests_seen: AtomicU64::new(0),
            requests_transformed: AtomicU64::new(0),
            transform_errors: AtomicU64::new(0),
        };
        handler.set_rules(config.rules);
        handler
    }

    /// Decide what happens to a request the host is about to send.
    ///
    /// Never awaits the network: synthetic variants go to the dispatcher and
    /// the decision returns immediately.
    pub async fn on_request(
        &self,
        message_id: u64,
        tool: ToolKind,
        request: RequestSnapshot,
    ) -> RequestAction {
        self.requests_seen.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings();
        if !settings.enabled || !settings.intercept_enabled {
            return RequestAction::Continue;
        }

        let tool_enabled = settings.tool_enabled(tool);
        let proxy_preview =
            tool == ToolKind::Proxy && !settings.apply_to_proxy && settings.preview_in_proxy;
        if !tool_enabled && !proxy_preview {
            return RequestAction::Continue;
        }
        if settings.only_in_scope && !self.host.is_in_scope(&request.url()) {
            debug!(message_id, url = %request.url(), "out of scope, skipping");
            return RequestAction::Continue;
        }

        let apply_for_main = tool_enabled && settings.auto_modify;
        let apply_for_unauth = settings.unauthenticated_testing && settings.apply_rules_to_unauth;
        let modified = if apply_for_main || apply_for_unauth || proxy_preview {
            let rules = self.rules();
            let (rewritten, changed) = apply_rules(&request, &rules);
            if changed {
                self.requests_transformed.fetch_add(1, Ordering::Relaxed);
                Some(rewritten)
            } else {
                None
            }
        } else {
            None
        };

        let unauth = if settings.unauthenticated_testing {
            let base = if settings.apply_rules_to_unauth {
                modified.as_ref().unwrap_or(&request)
            } else {
                &request
            };
            strip_credentials(base)
        } else {
            None
        };

        let modified_sent = !proxy_preview && apply_for_main && modified.is_some();
        let should_track = modified.is_some() || unauth.is_some();
        if !should_track {
            return RequestAction::Continue;
        }

        let action = if modified_sent {
            // modified is Some whenever modified_sent holds
            match modified.clone() {
                Some(rewritten) => RequestAction::ContinueWith(rewritten),
                None => RequestAction::Continue,
            }
        } else {
            RequestAction::Continue
        };

        let pending = Arc::new(PendingTransaction::new(
            request,
            modified,
            unauth,
            settings.unauthenticated_testing,
            proxy_preview,
            modified_sent,
        ));

        // Preview entries are published at egress so the log shows the
        // would-be rewrite before any response exists.
        if proxy_preview {
            let id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
            self.store.add(self.build_entry(id, &pending)).await;
            pending.set_log_entry_id(id);
            debug!(message_id, entry_id = id, "preview entry published");
        }

        self.tracker.insert(message_id, Arc::clone(&pending)).await;

        if pending.has_unauth_variant() {
            self.dispatcher.submit(Arc::clone(&pending), Variant::Unauth);
        }
        if proxy_preview && pending.modified.is_some() {
            self.dispatcher
                .submit(Arc::clone(&pending), Variant::Modified);
        }

        action
    }

    /// Fold an arriving live response into the transaction it belongs to.
    /// Responses for untracked messages are ignored.
    pub async fn on_response(&self, message_id: u64, response: ResponseSnapshot) {
        let settings = self.settings();
        if !settings.enabled || !settings.intercept_enabled {
            return;
        }
        let Some(pending) = self.tracker.remove(message_id).await else {
            return;
        };

        if pending.preview {
            let Some(id) = pending.log_entry_id() else {
                warn!(message_id, "preview transaction lost its log entry id");
                return;
            };
            // The live response belongs to the untouched original; synthetic
            // responses that already landed ride along in the same swap.
            self.store
                .update_by_id(id, |entry| {
                    let mut updated = entry.merged(
                        pending.modified_preview_response(),
                        pending.unauth_response(),
                    );
                    updated.original_response = Some(response.clone());
                    updated
                })
                .await;
            return;
        }

        let id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
        let mut entry = self.build_entry(id, &pending);
        if pending.modified_sent {
            entry.modified_response = Some(response);
        } else {
            entry.original_response = Some(response);
        }
        self.store.add(entry).await;
        pending.set_log_entry_id(id);
        // A synthetic response may have landed between building the entry and
        // publishing the id; re-reading the slots closes that window.
        self.store
            .update_by_id(id, |entry| {
                entry.merged(
                    pending.modified_preview_response(),
                    pending.unauth_response(),
                )
            })
            .await;
    }

    fn build_entry(&self, id: u64, pending: &PendingTransaction) -> LogEntry {
        let mut entry = LogEntry::new(id, pending.original.clone());
        entry.modified_request = pending.modified.clone();
        entry.unauth_request = pending.unauth.clone();
        entry.modified_sent = pending.modified_sent;
        entry.unauth_testing = pending.unauth_testing;
        entry
    }

    /// Swap in a new rule list. Requests already past the gate keep the
    /// snapshot they read.
    pub fn set_rules(&self, rules: Vec<RewriteRule>) {
        for rule in &rules {
            if let Err(error) = rule.validate() {
                self.transform_errors.fetch_add(1, Ordering::Relaxed);
                warn!(rule = %rule.name, %error, "rule failed validation, it will be skipped");
            }
        }
        *write(&self.rules) = Arc::new(rules);
    }

    pub fn rules(&self) -> Arc<Vec<RewriteRule>> {
        Arc::clone(&read(&self.rules))
    }

    pub fn set_settings(&self, settings: Settings) {
        *write(&self.settings) = Arc::new(settings);
    }

    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&read(&self.settings))
    }

    pub fn set_highlight_rules(&self, rules: Vec<HighlightRule>) {
        *write(&self.highlight_rules) = Arc::new(rules);
    }

    /// Color for a log entry per the first matching highlight rule.
    pub fn highlight_color(&self, entry: &LogEntry) -> Option<String> {
        let rules = Arc::clone(&read(&self.highlight_rules));
        highlight_for(&rules, entry).map(str::to_string)
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            requests_seen: self.requests_seen.load(Ordering::Relaxed),
            requests_transformed: self.requests_transformed.load(Ordering::Relaxed),
            transform_errors: self.transform_errors.load(Ordering::Relaxed),
        }
    }

    /// Drain state and wait out in-flight synthetic sends.
    pub async fn shutdown(&self) {
        let grace = Duration::from_millis(self.settings().shutdown_grace_ms);
        self.set_rules(Vec::new());
        self.tracker.clear().await;
        self.dispatcher.shutdown(grace).await;
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
