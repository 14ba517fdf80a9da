//! Host platform abstraction.
//!
//! The intercepting proxy that embeds this engine delivers request and
//! response snapshots and offers a synchronous-looking "send this request,
//! get a response or nothing" call. Everything behind that boundary (wire
//! parsing, TLS, connection handling) is the host's problem.

use crate::message::{RequestSnapshot, ResponseSnapshot};
use async_trait::async_trait;

/// Which host tool originated a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Proxy,
    Repeater,
    Intruder,
    Scanner,
    Other,
}

/// Services the engine consumes from the host.
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Send a request to the origin, off the interception path.
    ///
    /// `Ok(None)` means the call returned without a response; the engine
    /// treats that the same as an error, minus the log detail.
    async fn send_request(
        &self,
        request: &RequestSnapshot,
    ) -> anyhow::Result<Option<ResponseSnapshot>>;

    /// Whether an absolute URL is inside the user's testing scope.
    fn is_in_scope(&self, url: &str) -> bool;
}
