//! Configuration types for the mutation engine.

use crate::highlight::HighlightRule;
use crate::host::ToolKind;
use crate::rules::{RewriteRule, RuleError};
use serde::{Deserialize, Serialize};

/// Top-level configuration: runtime settings plus the rule state a session
/// works with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Configuration version
    pub version: String,
    /// Runtime gating settings
    pub settings: Settings,
    /// Rewrite rules (applied in list order)
    pub rules: Vec<RewriteRule>,
    /// Highlight rules for the log view
    pub highlight_rules: Vec<HighlightRule>,
    /// User roles referenced by `RewriteRule::target_role`
    pub roles: Vec<UserRole>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: Settings::default(),
            rules: vec![],
            highlight_rules: vec![],
            roles: vec![],
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

/// Runtime gating flags. Defaults keep browser traffic untouched: rules apply
/// directly only to Repeater/Intruder traffic, while the Proxy gets
/// non-invasive preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Master switch for the whole engine
    pub enabled: bool,
    /// Process intercepted requests at all
    pub intercept_enabled: bool,
    /// Restrict processing to in-scope URLs
    pub only_in_scope: bool,
    /// Apply rewrite rules to the live request (direct mode)
    pub auto_modify: bool,
    /// Derive and send unauthenticated variants
    pub unauthenticated_testing: bool,
    /// Base the unauthenticated variant on the rewritten request
    pub apply_rules_to_unauth: bool,
    /// Per-tool application flags
    pub apply_to_proxy: bool,
    pub apply_to_repeater: bool,
    pub apply_to_intruder: bool,
    pub apply_to_scanner: bool,
    /// Preview mode for proxy traffic: compute the rewritten request and send
    /// it out-of-band without touching the wire
    pub preview_in_proxy: bool,
    /// Log size bound (oldest entries are evicted past this)
    pub max_log_entries: usize,
    /// Grace period for in-flight synthetic sends at shutdown (ms)
    pub shutdown_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            intercept_enabled: true,
            only_in_scope: false,
            auto_modify: true,
            unauthenticated_testing: false,
            apply_rules_to_unauth: false,
            apply_to_proxy: false,
            apply_to_repeater: true,
            apply_to_intruder: true,
            apply_to_scanner: false,
            preview_in_proxy: true,
            max_log_entries: 1000,
            shutdown_grace_ms: 5000,
        }
    }
}

impl Settings {
    /// Should rewrites apply directly to traffic from this tool?
    pub fn tool_enabled(&self, tool: ToolKind) -> bool {
        match tool {
            ToolKind::Proxy => self.apply_to_proxy,
            ToolKind::Repeater => self.apply_to_repeater,
            ToolKind::Intruder => self.apply_to_intruder,
            ToolKind::Scanner => self.apply_to_scanner,
            ToolKind::Other => false,
        }
    }
}

/// A named bundle of credential tokens. Opaque to the engine itself: rules
/// reference a role by name and the operator wires token injection through
/// the rule's operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRole {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tokens: Vec<AuthToken>,
}

/// One credential token within a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub kind: TokenKind,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Cookie,
    Header,
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rule error: {0}")]
    Rule(#[from] RuleError),
}
