//! Highlight rules: declarative conditions over log entries that drive row
//! coloring in the log view.

use crate::log::LogEntry;
use crate::message::{RequestSnapshot, ResponseSnapshot};
use crate::rules::compile_pattern;
use serde::{Deserialize, Serialize};

/// Which side of an entry a condition inspects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageVersion {
    Original,
    Modified,
    /// Match if either side matches.
    #[default]
    Any,
}

/// The facet of a transaction a condition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPart {
    RequestString,
    ResponseString,
    RequestLength,
    ResponseLength,
    Url,
    StatusCode,
    Domain,
    Protocol,
    Method,
    FileExtension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    Contains,
    NotContains,
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    MatchesRegex,
    NotMatchesRegex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    All,
    Any,
}

/// One predicate over a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightCondition {
    pub part: MatchPart,
    pub relationship: Relationship,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub version: MessageVersion,
}

/// A named coloring rule: conditions combined with `operator`, painting
/// `color` when they hold. A disabled rule, or one with no conditions,
/// never matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightRule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub color: String,
    #[serde(default)]
    pub operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<HighlightCondition>,
}

fn default_true() -> bool {
    true
}

impl HighlightRule {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if !self.enabled || self.conditions.is_empty() {
            return false;
        }
        match self.operator {
            LogicalOperator::All => self.conditions.iter().all(|c| c.matches(entry)),
            LogicalOperator::Any => self.conditions.iter().any(|c| c.matches(entry)),
        }
    }
}

/// The color of the first matching rule, in list order.
pub fn highlight_for<'a>(rules: &'a [HighlightRule], entry: &LogEntry) -> Option<&'a str> {
    rules
        .iter()
        .find(|r| r.matches(entry))
        .map(|r| r.color.as_str())
}

#[derive(Clone, Copy)]
enum Side {
    Original,
    Modified,
}

impl HighlightCondition {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        match self.version {
            MessageVersion::Original => self.eval(entry, Side::Original),
            MessageVersion::Modified => self.eval(entry, Side::Modified),
            MessageVersion::Any => {
                self.eval(entry, Side::Original) || self.eval(entry, Side::Modified)
            }
        }
    }

    fn eval(&self, entry: &LogEntry, side: Side) -> bool {
        // a side whose message is absent matches nothing, negations included
        match part_value(entry, side, self.part) {
            Some(actual) => compare(&actual, self.relationship, &self.value),
            None => false,
        }
    }
}

fn part_value(entry: &LogEntry, side: Side, part: MatchPart) -> Option<String> {
    let request: Option<&RequestSnapshot> = match side {
        Side::Original => Some(&entry.original_request),
        Side::Modified => entry.modified_request.as_ref(),
    };
    let response: Option<&ResponseSnapshot> = match side {
        Side::Original => entry.original_response.as_ref(),
        Side::Modified => entry.modified_response.as_ref(),
    };
    match part {
        MatchPart::RequestString => request.map(|r| r.to_text()),
        MatchPart::ResponseString => response.map(|r| r.body().to_string()),
        MatchPart::RequestLength => request.map(|r| r.to_text().len().to_string()),
        MatchPart::ResponseLength => response.map(|r| r.body().len().to_string()),
        MatchPart::Url => request.map(|r| r.url()),
        MatchPart::StatusCode => response.map(|r| r.status_code().to_string()),
        MatchPart::Domain => request.map(|r| r.service().host.clone()),
        MatchPart::Protocol => {
            request.map(|r| if r.service().secure { "https" } else { "http" }.to_string())
        }
        MatchPart::Method => request.map(|r| r.method().to_string()),
        MatchPart::FileExtension => {
            request.map(|r| r.file_extension().unwrap_or_default().to_string())
        }
    }
}

/// Negative relationships hold vacuously for an empty extracted value (a
/// request without an extension, an empty body). Numeric comparisons require
/// both sides to parse; regex compile failures never match.
fn compare(actual: &str, relationship: Relationship, expected: &str) -> bool {
    match relationship {
        Relationship::Contains => actual.contains(expected),
        Relationship::NotContains => !actual.contains(expected),
        Relationship::Equals => actual == expected,
        Relationship::NotEquals => actual != expected,
        Relationship::GreaterThan => numeric(actual, expected).is_some_and(|(a, b)| a > b),
        Relationship::LessThan => numeric(actual, expected).is_some_and(|(a, b)| a < b),
        Relationship::MatchesRegex => match compile_pattern(expected, false) {
            Ok(re) => re.is_match(actual),
            Err(_) => false,
        },
        Relationship::NotMatchesRegex => match compile_pattern(expected, false) {
            Ok(re) => !re.is_match(actual),
            Err(_) => false,
        },
    }
}

fn numeric(actual: &str, expected: &str) -> Option<(f64, f64)> {
    let a = actual.trim().parse::<f64>().ok()?;
    let b = expected.trim().parse::<f64>().ok()?;
    Some((a, b))
}
