//! Rule-based request mutation and correlation engine for an intercepting
//! HTTP proxy, built for authorization testing:
//!
//! - Rewrite rules over every structural facet of a request (message, body,
//!   headers, url/body parameters, cookies)
//! - Unauthenticated variants derived by stripping cookie credentials
//! - Out-of-band dispatch of synthetic variants, off the interception path
//! - Correlation of live and synthetic responses into one log entry
//! - Highlight rules for coloring the request log
//!
//! ## Configuration Example
//!
//! ```yaml
//! settings:
//!   enabled: true
//!   unauthenticated_testing: true
//! rules:
//!   - name: "become-admin"
//!     operations:
//!       - kind: set_header_value_by_name
//!         match: { pattern: "X-Role" }
//!         value: "admin"
//! ```

pub mod config;
pub mod dispatch;
pub mod handler;
pub mod highlight;
pub mod host;
pub mod log;
pub mod message;
pub mod pending;
pub mod rules;

pub use config::{ConfigError, EngineConfig, Settings};
pub use handler::{InterceptHandler, RequestAction};
pub use highlight::{HighlightCondition, HighlightRule};
pub use host::{HostClient, ToolKind};
pub use log::{LogEntry, LogStore};
pub use message::{HttpService, RequestSnapshot, ResponseSnapshot};
pub use rules::{apply_rules, strip_credentials, RewriteOp, RewriteRule, RuleError};
