//! Ordered application of rewrite rules to a request.
//!
//! Rules run in list order, operations in rule order; each operation sees the
//! output of the previous one. A step only counts as a change when it alters
//! the request's serialized text. Invalid patterns are logged and skipped;
//! nothing in here is fatal to the caller.

use crate::message::{Param, ParamKind, RequestSnapshot};
use crate::rules::{compile_pattern, MatchSpec, RewriteOp, RewriteRule};
use regex::Regex;
use tracing::{debug, trace, warn};

/// Apply every enabled rule to `request`.
///
/// Returns the resulting request and whether its serialized form differs from
/// the input's. Callers must treat an unchanged result as "no modified
/// variant", not as an equal copy.
pub fn apply_rules(request: &RequestSnapshot, rules: &[RewriteRule]) -> (RequestSnapshot, bool) {
    let mut current = request.clone();

    for rule in rules {
        if !rule.enabled {
            trace!(rule = %rule.name, "skipping disabled rule");
            continue;
        }
        if !rule.has_operations() {
            trace!(rule = %rule.name, "rule has no operations");
            continue;
        }
        match apply_rule(&current, rule) {
            Some(next) => {
                debug!(rule = %rule.name, "rule modified request");
                current = next;
            }
            None => trace!(rule = %rule.name, "rule did not modify request"),
        }
    }

    let changed = current.to_text() != request.to_text();
    (current, changed)
}

/// Apply one rule's operations in order. Returns the rewritten request only
/// if the rule changed the serialization.
fn apply_rule(request: &RequestSnapshot, rule: &RewriteRule) -> Option<RequestSnapshot> {
    let mut current = request.clone();

    for op in &rule.operations {
        let updated = apply_operation(&current, op);
        if updated.to_text() != current.to_text() {
            trace!(op = %op.describe(), "operation applied");
            current = updated;
        } else {
            trace!(op = %op.describe(), "operation had no effect");
        }
    }

    if current.to_text() != request.to_text() {
        Some(current)
    } else {
        None
    }
}

/// Dispatch a single operation. Unknown kinds cannot exist: the match is
/// exhaustive over the closed sum type.
pub(crate) fn apply_operation(request: &RequestSnapshot, op: &RewriteOp) -> RequestSnapshot {
    match op {
        RewriteOp::RewriteMessage { matcher, replace } => {
            rewrite_message(request, matcher, replace)
        }
        RewriteOp::RewriteHeader { matcher, replace } => rewrite_header(request, matcher, replace),
        RewriteOp::RewriteBody { matcher, replace } => rewrite_body(request, matcher, replace),
        RewriteOp::RenameParam { matcher, new_name } => rename_param(request, matcher, new_name),
        RewriteOp::RewriteParamValue { matcher, replace } => {
            rewrite_param_value(request, matcher, replace)
        }
        RewriteOp::RenameCookie { matcher, new_name } => rename_cookie(request, matcher, new_name),
        RewriteOp::RewriteCookieValue { matcher, replace } => {
            rewrite_cookie_value(request, matcher, replace)
        }
        RewriteOp::RemoveParamByName { matcher } => remove_params(request, matcher, ByFacet::Name),
        RewriteOp::RemoveParamByValue { matcher } => {
            remove_params(request, matcher, ByFacet::Value)
        }
        RewriteOp::RemoveCookieByName { matcher } => {
            remove_cookies(request, matcher, ByFacet::Name)
        }
        RewriteOp::RemoveCookieByValue { matcher } => {
            remove_cookies(request, matcher, ByFacet::Value)
        }
        RewriteOp::RemoveHeaderByName { matcher } => {
            remove_headers(request, matcher, ByFacet::Name)
        }
        RewriteOp::RemoveHeaderByValue { matcher } => {
            remove_headers(request, matcher, ByFacet::Value)
        }
        RewriteOp::SetParamValueByName { matcher, value } => {
            set_param_value_by_name(request, matcher, value)
        }
        RewriteOp::SetCookieValueByName { matcher, value } => {
            set_cookie_value_by_name(request, matcher, value)
        }
        RewriteOp::SetHeaderValueByName { matcher, value } => {
            set_header_value_by_name(request, matcher, value)
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum ByFacet {
    Name,
    Value,
}

fn rewrite_message(request: &RequestSnapshot, matcher: &MatchSpec, replace: &str) -> RequestSnapshot {
    if matcher.pattern.is_empty() {
        return request.clone();
    }
    let text = request.to_text();
    let updated = replace_in_text(&text, matcher, replace);
    if updated != text {
        RequestSnapshot::from_raw(request.service().clone(), &updated)
    } else {
        request.clone()
    }
}

fn rewrite_body(request: &RequestSnapshot, matcher: &MatchSpec, replace: &str) -> RequestSnapshot {
    if matcher.pattern.is_empty() {
        return request.clone();
    }
    let updated = replace_in_text(request.body(), matcher, replace);
    if updated != request.body() {
        request.with_body(updated)
    } else {
        request.clone()
    }
}

fn replace_in_text(text: &str, matcher: &MatchSpec, replace: &str) -> String {
    if matcher.regex {
        match compile_or_log(matcher, false) {
            Some(re) => re.replace_all(text, replace).into_owned(),
            None => text.to_string(),
        }
    } else {
        text.replace(&matcher.pattern, replace)
    }
}

fn rewrite_header(request: &RequestSnapshot, matcher: &MatchSpec, replace: &str) -> RequestSnapshot {
    let match_name = matcher.pattern.trim();
    if match_name.is_empty() {
        return add_header_from_replace(request, replace);
    }

    let re = regex_for(matcher, true);
    let mut current = request.clone();
    let mut changed = false;
    for header in request.headers() {
        if name_matches(&header.name, matcher, re.as_ref()) {
            let value = sanitize_header_value(&header.name, replace);
            current = current.with_updated_header(&header.name, &value);
            changed = true;
        }
    }
    // A literal name that matched nothing becomes an added header instead of
    // a silent no-op.
    if !changed && !matcher.regex {
        let value = sanitize_header_value(match_name, replace);
        current = current.with_added_header(match_name, &value);
    }
    current
}

fn rename_param(request: &RequestSnapshot, matcher: &MatchSpec, new_name: &str) -> RequestSnapshot {
    let new_name = sanitize_token_name(new_name);
    if matcher.pattern.is_empty() || new_name.is_empty() {
        return request.clone();
    }
    let re = regex_for(matcher, false);
    let mut current = request.clone();
    for param in request.parameters() {
        if !is_editable(&param) {
            continue;
        }
        if token_matches(&param.name, matcher, re.as_ref()) {
            let renamed = Param::new(param.kind, new_name.clone(), param.value.clone());
            current = current.with_removed_param(&param).with_added_param(&renamed);
        }
    }
    current
}

fn rewrite_param_value(
    request: &RequestSnapshot,
    matcher: &MatchSpec,
    replace: &str,
) -> RequestSnapshot {
    if matcher.pattern.is_empty() {
        return request.clone();
    }
    let re = regex_for(matcher, false);
    let mut current = request.clone();
    for param in request.parameters() {
        if !is_editable(&param) {
            continue;
        }
        if token_matches(&param.value, matcher, re.as_ref()) {
            let value = sanitize_param_value(&param.name, replace);
            current = current.with_updated_param(&Param::new(param.kind, param.name.clone(), value));
        }
    }
    current
}

fn rename_cookie(request: &RequestSnapshot, matcher: &MatchSpec, new_name: &str) -> RequestSnapshot {
    let new_name = sanitize_token_name(new_name);
    if matcher.pattern.is_empty() || new_name.is_empty() {
        return request.clone();
    }
    let re = regex_for(matcher, true);
    let mut current = request.clone();
    for param in request.parameters() {
        if param.kind != ParamKind::Cookie {
            continue;
        }
        if name_matches_cookie(&param.name, matcher, re.as_ref()) {
            let renamed = Param::cookie(new_name.clone(), param.value.clone());
            current = current.with_removed_param(&param).with_added_param(&renamed);
        }
    }
    current
}

fn rewrite_cookie_value(
    request: &RequestSnapshot,
    matcher: &MatchSpec,
    replace: &str,
) -> RequestSnapshot {
    if matcher.pattern.is_empty() {
        return request.clone();
    }
    let re = regex_for(matcher, false);
    let mut current = request.clone();
    for param in request.parameters() {
        if param.kind != ParamKind::Cookie {
            continue;
        }
        if token_matches(&param.value, matcher, re.as_ref()) {
            let value = sanitize_cookie_value(&param.name, replace);
            current = current.with_updated_param(&Param::cookie(param.name.clone(), value));
        }
    }
    current
}

fn remove_params(request: &RequestSnapshot, matcher: &MatchSpec, facet: ByFacet) -> RequestSnapshot {
    if matcher.pattern.is_empty() {
        return request.clone();
    }
    let re = regex_for(matcher, false);
    let mut current = request.clone();
    for param in request.parameters() {
        if !is_editable(&param) {
            continue;
        }
        let candidate = match facet {
            ByFacet::Name => &param.name,
            ByFacet::Value => &param.value,
        };
        if token_matches(candidate, matcher, re.as_ref()) {
            current = current.with_removed_param(&param);
        }
    }
    current
}

fn remove_cookies(
    request: &RequestSnapshot,
    matcher: &MatchSpec,
    facet: ByFacet,
) -> RequestSnapshot {
    if matcher.pattern.is_empty() {
        return request.clone();
    }
    let name_facet = facet == ByFacet::Name;
    let re = regex_for(matcher, name_facet);
    let mut current = request.clone();
    for param in request.parameters() {
        if param.kind != ParamKind::Cookie {
            continue;
        }
        let matched = match facet {
            ByFacet::Name => name_matches_cookie(&param.name, matcher, re.as_ref()),
            ByFacet::Value => token_matches(&param.value, matcher, re.as_ref()),
        };
        if matched {
            current = current.with_removed_param(&param);
        }
    }
    current
}

fn remove_headers(
    request: &RequestSnapshot,
    matcher: &MatchSpec,
    facet: ByFacet,
) -> RequestSnapshot {
    if matcher.pattern.is_empty() {
        return request.clone();
    }
    let name_facet = facet == ByFacet::Name;
    let re = regex_for(matcher, name_facet);
    let mut current = request.clone();
    for header in request.headers() {
        let matched = match facet {
            ByFacet::Name => name_matches(&header.name, matcher, re.as_ref()),
            ByFacet::Value => token_matches(&header.value, matcher, re.as_ref()),
        };
        if matched {
            current = current.with_removed_header(header);
        }
    }
    current
}

fn set_param_value_by_name(
    request: &RequestSnapshot,
    matcher: &MatchSpec,
    value: &str,
) -> RequestSnapshot {
    if matcher.pattern.is_empty() {
        return request.clone();
    }
    let re = regex_for(matcher, false);
    let mut current = request.clone();
    for param in request.parameters() {
        if !is_editable(&param) {
            continue;
        }
        if token_matches(&param.name, matcher, re.as_ref()) {
            let sanitized = sanitize_param_value(&param.name, value);
            current =
                current.with_updated_param(&Param::new(param.kind, param.name.clone(), sanitized));
        }
    }
    current
}

fn set_cookie_value_by_name(
    request: &RequestSnapshot,
    matcher: &MatchSpec,
    value: &str,
) -> RequestSnapshot {
    if matcher.pattern.is_empty() {
        return request.clone();
    }
    let re = regex_for(matcher, true);
    let mut current = request.clone();
    for param in request.parameters() {
        if param.kind != ParamKind::Cookie {
            continue;
        }
        if name_matches_cookie(&param.name, matcher, re.as_ref()) {
            let sanitized = sanitize_cookie_value(&param.name, value);
            current = current.with_updated_param(&Param::cookie(param.name.clone(), sanitized));
        }
    }
    current
}

fn set_header_value_by_name(
    request: &RequestSnapshot,
    matcher: &MatchSpec,
    value: &str,
) -> RequestSnapshot {
    if matcher.pattern.is_empty() {
        return request.clone();
    }
    let re = regex_for(matcher, true);
    let mut current = request.clone();
    let mut changed = false;
    for header in request.headers() {
        if name_matches(&header.name, matcher, re.as_ref()) {
            let sanitized = sanitize_header_value(&header.name, value);
            current = current.with_updated_header(&header.name, &sanitized);
            changed = true;
        }
    }
    if !changed && !matcher.regex {
        let name = matcher.pattern.trim();
        let sanitized = sanitize_header_value(name, value);
        current = current.with_added_header(name, &sanitized);
    }
    current
}

/// Parse `replace` as `Name: Value` and add that header. A missing colon
/// treats the whole value as the name with an empty value.
fn add_header_from_replace(request: &RequestSnapshot, replace: &str) -> RequestSnapshot {
    if replace.trim().is_empty() {
        warn!("cannot add header: replacement value is empty");
        return request.clone();
    }
    let (name, value) = match replace.split_once(':') {
        Some((name, value)) => (name.trim(), value.trim()),
        None => (replace.trim(), ""),
    };
    if name.is_empty() {
        warn!(replace, "cannot add header: unable to parse name");
        return request.clone();
    }
    request.with_added_header(name, value)
}

fn is_editable(param: &Param) -> bool {
    matches!(param.kind, ParamKind::Url | ParamKind::Body)
}

/// Header-name matching: case-insensitive literal equality or unanchored
/// regex find.
fn name_matches(candidate: &str, matcher: &MatchSpec, re: Option<&Regex>) -> bool {
    if matcher.regex {
        re.map(|re| re.is_match(candidate)).unwrap_or(false)
    } else {
        candidate.eq_ignore_ascii_case(matcher.pattern.trim())
    }
}

/// Cookie-name matching: literal equality is exact, regex is
/// case-insensitive find.
fn name_matches_cookie(candidate: &str, matcher: &MatchSpec, re: Option<&Regex>) -> bool {
    if matcher.regex {
        re.map(|re| re.is_match(candidate)).unwrap_or(false)
    } else {
        candidate == matcher.pattern
    }
}

/// Value (and param-name) matching: exact literal equality or case-sensitive
/// regex find.
fn token_matches(candidate: &str, matcher: &MatchSpec, re: Option<&Regex>) -> bool {
    if matcher.regex {
        re.map(|re| re.is_match(candidate)).unwrap_or(false)
    } else {
        candidate == matcher.pattern
    }
}

fn regex_for(matcher: &MatchSpec, name_match: bool) -> Option<Regex> {
    if !matcher.regex {
        return None;
    }
    compile_or_log(matcher, name_match)
}

fn compile_or_log(matcher: &MatchSpec, name_match: bool) -> Option<Regex> {
    if matcher.pattern.is_empty() {
        return None;
    }
    match compile_pattern(&matcher.pattern, name_match) {
        Ok(re) => Some(re),
        Err(err) => {
            warn!(pattern = %matcher.pattern, error = %err, "invalid regex, skipping operation");
            None
        }
    }
}

/// Strip a redundant `Name:` prefix that repeats the header's own name.
fn sanitize_header_value(header_name: &str, replacement: &str) -> String {
    let trimmed = replacement.trim();
    if let Some((name, value)) = trimmed.split_once(':') {
        let value = value.trim();
        if !value.is_empty() && name.trim().eq_ignore_ascii_case(header_name) {
            return value.to_string();
        }
    }
    trimmed.to_string()
}

/// Reduce a replacement to a bare token name: trim, then cut at the first
/// `:` or `=`.
fn sanitize_token_name(input: &str) -> String {
    let mut token = input.trim();
    if let Some((head, _)) = token.split_once(':') {
        token = head.trim();
    }
    if let Some((head, _)) = token.split_once('=') {
        token = head.trim();
    }
    token.to_string()
}

/// Strip a redundant `name=` / `name =` prefix from a replacement value.
fn sanitize_param_value(param_name: &str, replacement: &str) -> String {
    let trimmed = replacement.trim();
    if !param_name.is_empty() {
        for prefix in [format!("{}=", param_name), format!("{} =", param_name)] {
            if let Some(rest) = trimmed.strip_prefix(&prefix) {
                return rest.trim().to_string();
            }
        }
    }
    trimmed.to_string()
}

/// Cookie variant of [`sanitize_param_value`]; also drops a leading
/// `cookie:` token.
fn sanitize_cookie_value(cookie_name: &str, replacement: &str) -> String {
    let mut trimmed = replacement.trim();
    if let Some(prefix) = trimmed.get(..7) {
        if prefix.eq_ignore_ascii_case("cookie:") {
            trimmed = trimmed[7..].trim();
        }
    }
    sanitize_param_value(cookie_name, trimmed)
}
