//! Rewrite rules and their operation language.
//!
//! A rule is an ordered, enable-able list of rewrite operations. Each
//! operation is one variant of the closed [`RewriteOp`] sum type; the engine
//! dispatches over it exhaustively, so adding a kind is a compile error until
//! every consumer handles it.

mod engine;
mod unauth;

pub use engine::apply_rules;
pub use unauth::strip_credentials;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A match pattern plus its interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchSpec {
    /// Literal text or regular expression, depending on `regex`.
    pub pattern: String,
    /// When true the pattern is compiled with dot-matches-newline; name
    /// matching against headers and cookies is case-insensitive, value
    /// matching stays case-sensitive.
    pub regex: bool,
}

impl MatchSpec {
    pub fn literal(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            regex: false,
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            regex: true,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.pattern.trim().is_empty()
    }
}

/// One pattern-match-and-rewrite primitive over a structural facet of a
/// request. Serialized as a map with a `kind` tag naming the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewriteOp {
    /// Replace matches across the whole serialized message.
    RewriteMessage {
        #[serde(rename = "match")]
        matcher: MatchSpec,
        #[serde(default)]
        replace: String,
    },
    /// Rewrite the value of every header whose name matches. A blank match
    /// pattern turns this into add-header, parsing `replace` as `Name: Value`.
    RewriteHeader {
        #[serde(rename = "match", default)]
        matcher: MatchSpec,
        #[serde(default)]
        replace: String,
    },
    /// Replace matches within the body only.
    RewriteBody {
        #[serde(rename = "match")]
        matcher: MatchSpec,
        #[serde(default)]
        replace: String,
    },
    /// Rename url/body parameters whose name matches.
    RenameParam {
        #[serde(rename = "match")]
        matcher: MatchSpec,
        new_name: String,
    },
    /// Rewrite the value of url/body parameters whose current value matches.
    RewriteParamValue {
        #[serde(rename = "match")]
        matcher: MatchSpec,
        #[serde(default)]
        replace: String,
    },
    /// Rename cookies whose name matches.
    RenameCookie {
        #[serde(rename = "match")]
        matcher: MatchSpec,
        new_name: String,
    },
    /// Rewrite the value of cookies whose current value matches.
    RewriteCookieValue {
        #[serde(rename = "match")]
        matcher: MatchSpec,
        #[serde(default)]
        replace: String,
    },
    RemoveParamByName {
        #[serde(rename = "match")]
        matcher: MatchSpec,
    },
    RemoveParamByValue {
        #[serde(rename = "match")]
        matcher: MatchSpec,
    },
    RemoveCookieByName {
        #[serde(rename = "match")]
        matcher: MatchSpec,
    },
    RemoveCookieByValue {
        #[serde(rename = "match")]
        matcher: MatchSpec,
    },
    RemoveHeaderByName {
        #[serde(rename = "match")]
        matcher: MatchSpec,
    },
    RemoveHeaderByValue {
        #[serde(rename = "match")]
        matcher: MatchSpec,
    },
    /// Match url/body parameters by name and replace only the value.
    SetParamValueByName {
        #[serde(rename = "match")]
        matcher: MatchSpec,
        #[serde(default)]
        value: String,
    },
    /// Match cookies by name and replace only the value.
    SetCookieValueByName {
        #[serde(rename = "match")]
        matcher: MatchSpec,
        #[serde(default)]
        value: String,
    },
    /// Match headers by name and replace only the value; adds the header when
    /// nothing matched and the name is literal.
    SetHeaderValueByName {
        #[serde(rename = "match")]
        matcher: MatchSpec,
        #[serde(default)]
        value: String,
    },
}

/// Static capability flags per operation kind. These drive validation and the
/// external editors, never runtime behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCapabilities {
    pub supports_match: bool,
    pub requires_match: bool,
    pub allows_blank_match: bool,
    pub supports_replace: bool,
    pub requires_replace: bool,
    pub supports_regex: bool,
}

impl RewriteOp {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RewriteMessage { .. } => "Request String",
            Self::RewriteHeader { .. } => "Request Header",
            Self::RewriteBody { .. } => "Request Body",
            Self::RenameParam { .. } => "Request Param Name",
            Self::RewriteParamValue { .. } => "Request Param Value",
            Self::RenameCookie { .. } => "Request Cookie Name",
            Self::RewriteCookieValue { .. } => "Request Cookie Value",
            Self::RemoveParamByName { .. } => "Remove Parameter By Name",
            Self::RemoveParamByValue { .. } => "Remove Parameter By Value",
            Self::RemoveCookieByName { .. } => "Remove Cookie By Name",
            Self::RemoveCookieByValue { .. } => "Remove Cookie By Value",
            Self::RemoveHeaderByName { .. } => "Remove Header By Name",
            Self::RemoveHeaderByValue { .. } => "Remove Header By Value",
            Self::SetParamValueByName { .. } => "Match Param Name, Replace Value",
            Self::SetCookieValueByName { .. } => "Match Cookie Name, Replace Value",
            Self::SetHeaderValueByName { .. } => "Match Header Name, Replace Value",
        }
    }

    pub fn capabilities(&self) -> OpCapabilities {
        let removal = matches!(
            self,
            Self::RemoveParamByName { .. }
                | Self::RemoveParamByValue { .. }
                | Self::RemoveCookieByName { .. }
                | Self::RemoveCookieByValue { .. }
                | Self::RemoveHeaderByName { .. }
                | Self::RemoveHeaderByValue { .. }
        );
        let header = matches!(self, Self::RewriteHeader { .. });
        OpCapabilities {
            supports_match: true,
            requires_match: !header,
            allows_blank_match: header,
            supports_replace: !removal,
            requires_replace: !removal && !header,
            supports_regex: true,
        }
    }

    pub fn matcher(&self) -> &MatchSpec {
        match self {
            Self::RewriteMessage { matcher, .. }
            | Self::RewriteHeader { matcher, .. }
            | Self::RewriteBody { matcher, .. }
            | Self::RenameParam { matcher, .. }
            | Self::RewriteParamValue { matcher, .. }
            | Self::RenameCookie { matcher, .. }
            | Self::RewriteCookieValue { matcher, .. }
            | Self::RemoveParamByName { matcher }
            | Self::RemoveParamByValue { matcher }
            | Self::RemoveCookieByName { matcher }
            | Self::RemoveCookieByValue { matcher }
            | Self::RemoveHeaderByName { matcher }
            | Self::RemoveHeaderByValue { matcher }
            | Self::SetParamValueByName { matcher, .. }
            | Self::SetCookieValueByName { matcher, .. }
            | Self::SetHeaderValueByName { matcher, .. } => matcher,
        }
    }

    /// Check the operation against its capability flags. The engine never
    /// calls this on the hot path; an invalid operation at runtime simply
    /// has no effect.
    pub fn validate(&self) -> Result<(), RuleError> {
        let caps = self.capabilities();
        let matcher = self.matcher();
        if caps.requires_match && !caps.allows_blank_match && matcher.is_blank() {
            return Err(RuleError::MissingPattern {
                op: self.label(),
            });
        }
        if matcher.regex && !matcher.is_blank() {
            compile_pattern(&matcher.pattern, false).map_err(|source| RuleError::InvalidRegex {
                op: self.label(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        let matcher = self.matcher();
        let pattern = if matcher.is_blank() {
            "<empty>"
        } else {
            &matcher.pattern
        };
        format!("{} | match: '{}'", self.label(), pattern)
    }
}

/// An ordered, named sequence of rewrite operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub operations: Vec<RewriteOp>,
    /// Opaque reference to a user role whose tokens this rule injects.
    /// Role resolution happens outside the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_role: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RewriteRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            operations: Vec::new(),
            target_role: None,
        }
    }

    pub fn has_operations(&self) -> bool {
        !self.operations.is_empty()
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        for op in &self.operations {
            op.validate()?;
        }
        Ok(())
    }
}

/// Rule validation and compilation errors.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("operation '{op}' requires a match pattern")]
    MissingPattern { op: &'static str },

    #[error("invalid regex in operation '{op}': {source}")]
    InvalidRegex {
        op: &'static str,
        source: regex::Error,
    },
}

/// Compile a pattern with dot-matches-newline semantics. `name_match` selects
/// the case-insensitive policy used for header and cookie names.
pub(crate) fn compile_pattern(pattern: &str, name_match: bool) -> Result<Regex, regex::Error> {
    regex::RegexBuilder::new(pattern)
        .dot_matches_new_line(true)
        .case_insensitive(name_match)
        .build()
}
