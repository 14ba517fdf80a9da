//! Request and response snapshots.
//!
//! The host proxy hands the engine immutable message snapshots. This module
//! models them as plain text-backed values with structural accessors for
//! headers and typed parameters (url, body, cookie) and immutable `with_*`
//! mutators that return a rebuilt snapshot. The canonical form of a snapshot
//! is its serialized text; all "did anything change" checks in the engine
//! compare serializations, never structures.

use serde::{Deserialize, Serialize};

/// Origin service a request is destined for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpService {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl HttpService {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    /// Scheme + authority, without a trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            format!("{}://{}", scheme, self.host)
        } else {
            format!("{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// A single header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Where a parameter lives in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Url,
    Body,
    Cookie,
}

/// A parsed request parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub kind: ParamKind,
    pub name: String,
    pub value: String,
}

impl Param {
    pub fn new(kind: ParamKind, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn url(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(ParamKind::Url, name, value)
    }

    pub fn body(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(ParamKind::Body, name, value)
    }

    pub fn cookie(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(ParamKind::Cookie, name, value)
    }
}

/// Immutable snapshot of an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    service: HttpService,
    method: String,
    /// Path plus optional query string, as it appears on the request line.
    target: String,
    version: String,
    headers: Vec<Header>,
    body: String,
}

impl RequestSnapshot {
    /// Parse a raw request text into a snapshot.
    ///
    /// Accepts both `\r\n` and `\n` line endings. A missing or malformed
    /// request line yields a snapshot with empty method and target rather
    /// than an error; the engine treats such requests as opaque text.
    pub fn from_raw(service: HttpService, raw: &str) -> Self {
        let (head, body) = split_head_body(raw);
        let mut lines = head.lines();

        let (method, target, version) = match lines.next() {
            Some(line) => {
                let mut parts = line.splitn(3, ' ');
                (
                    parts.next().unwrap_or("").to_string(),
                    parts.next().unwrap_or("").to_string(),
                    parts.next().unwrap_or("HTTP/1.1").to_string(),
                )
            }
            None => (String::new(), String::new(), "HTTP/1.1".to_string()),
        };

        let headers = lines
            .filter(|l| !l.is_empty())
            .map(|line| match line.split_once(':') {
                Some((name, value)) => Header::new(name.trim(), value.trim()),
                None => Header::new(line.trim(), ""),
            })
            .collect();

        Self {
            service,
            method,
            target,
            version,
            headers,
            body: body.to_string(),
        }
    }

    /// Build a minimal request from parts. Used mostly by tests and the CLI.
    pub fn build(
        service: HttpService,
        method: impl Into<String>,
        target: impl Into<String>,
        headers: Vec<Header>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            service,
            method: method.into(),
            target: target.into(),
            version: "HTTP/1.1".to_string(),
            headers,
            body: body.into(),
        }
    }

    /// Canonical serialized form. Textual equality of two snapshots' text is
    /// the engine-wide definition of "unchanged".
    pub fn to_text(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for h in &self.headers {
            out.push_str(&format!("{}: {}\r\n", h.name, h.value));
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    pub fn service(&self) -> &HttpService {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Path component of the target, without the query string.
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    /// Query string without the leading `?`, if any.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// Absolute URL for this request.
    pub fn url(&self) -> String {
        format!("{}{}", self.service.base_url(), self.target)
    }

    /// File extension of the path's last segment, without the leading dot.
    pub fn file_extension(&self) -> Option<&str> {
        let last = self.path().rsplit('/').next()?;
        match last.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
            _ => None,
        }
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Enumerate url, body and cookie parameters in document order.
    pub fn parameters(&self) -> Vec<Param> {
        let mut params = Vec::new();

        if let Some(query) = self.query() {
            for (name, value) in parse_form_pairs(query) {
                params.push(Param::url(name, value));
            }
        }

        if self.is_form_body() {
            for (name, value) in parse_form_pairs(&self.body) {
                params.push(Param::body(name, value));
            }
        }

        for h in &self.headers {
            if h.name.eq_ignore_ascii_case("cookie") {
                for (name, value) in parse_cookie_pairs(&h.value) {
                    params.push(Param::cookie(name, value));
                }
            }
        }

        params
    }

    fn is_form_body(&self) -> bool {
        !self.body.is_empty()
            && self
                .header_value("content-type")
                .map(|ct| ct.to_ascii_lowercase().contains("application/x-www-form-urlencoded"))
                .unwrap_or(false)
    }

    /// First value of a header, matched case-insensitively by name.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn with_added_header(&self, name: &str, value: &str) -> Self {
        let mut next = self.clone();
        next.headers.push(Header::new(name, value));
        next
    }

    /// Set the value of every header whose name matches case-insensitively.
    /// Adds the header if none matched.
    pub fn with_updated_header(&self, name: &str, value: &str) -> Self {
        let mut next = self.clone();
        let mut touched = false;
        for h in &mut next.headers {
            if h.name.eq_ignore_ascii_case(name) {
                h.value = value.to_string();
                touched = true;
            }
        }
        if !touched {
            next.headers.push(Header::new(name, value));
        }
        next
    }

    /// Remove the first header equal to `header` (name case-insensitive,
    /// value exact).
    pub fn with_removed_header(&self, header: &Header) -> Self {
        let mut next = self.clone();
        if let Some(pos) = next
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(&header.name) && h.value == header.value)
        {
            next.headers.remove(pos);
        }
        next
    }

    /// Replace the body, keeping an existing Content-Length header accurate.
    pub fn with_body(&self, body: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.body = body.into();
        let len = next.body.len().to_string();
        for h in &mut next.headers {
            if h.name.eq_ignore_ascii_case("content-length") {
                h.value = len.clone();
            }
        }
        next
    }

    pub fn with_added_param(&self, param: &Param) -> Self {
        match param.kind {
            ParamKind::Url => {
                let mut pairs = self.url_pairs();
                pairs.push((param.name.clone(), param.value.clone()));
                self.with_url_pairs(pairs)
            }
            ParamKind::Body => {
                let mut pairs = parse_form_pairs(&self.body);
                pairs.push((param.name.clone(), param.value.clone()));
                self.with_body(serialize_form_pairs(&pairs))
            }
            ParamKind::Cookie => {
                let mut cookies = self.cookie_pairs();
                cookies.push((param.name.clone(), param.value.clone()));
                self.with_cookie_pairs(cookies)
            }
        }
    }

    /// Remove the first parameter of the same kind matching name and value.
    pub fn with_removed_param(&self, param: &Param) -> Self {
        let drop_first = |pairs: &mut Vec<(String, String)>| {
            if let Some(pos) = pairs
                .iter()
                .position(|(n, v)| *n == param.name && *v == param.value)
            {
                pairs.remove(pos);
            }
        };
        match param.kind {
            ParamKind::Url => {
                let mut pairs = self.url_pairs();
                drop_first(&mut pairs);
                self.with_url_pairs(pairs)
            }
            ParamKind::Body => {
                let mut pairs = parse_form_pairs(&self.body);
                drop_first(&mut pairs);
                self.with_body(serialize_form_pairs(&pairs))
            }
            ParamKind::Cookie => {
                let mut cookies = self.cookie_pairs();
                drop_first(&mut cookies);
                self.with_cookie_pairs(cookies)
            }
        }
    }

    /// Set the value of the first parameter of the same kind with a matching
    /// name. No-op if the parameter is absent.
    pub fn with_updated_param(&self, param: &Param) -> Self {
        let update_first = |pairs: &mut Vec<(String, String)>| {
            if let Some(pair) = pairs.iter_mut().find(|(n, _)| *n == param.name) {
                pair.1 = param.value.clone();
            }
        };
        match param.kind {
            ParamKind::Url => {
                let mut pairs = self.url_pairs();
                update_first(&mut pairs);
                self.with_url_pairs(pairs)
            }
            ParamKind::Body => {
                let mut pairs = parse_form_pairs(&self.body);
                update_first(&mut pairs);
                self.with_body(serialize_form_pairs(&pairs))
            }
            ParamKind::Cookie => {
                let mut cookies = self.cookie_pairs();
                update_first(&mut cookies);
                self.with_cookie_pairs(cookies)
            }
        }
    }

    fn url_pairs(&self) -> Vec<(String, String)> {
        self.query().map(parse_form_pairs).unwrap_or_default()
    }

    fn with_url_pairs(&self, pairs: Vec<(String, String)>) -> Self {
        let mut next = self.clone();
        let path = self.path().to_string();
        next.target = if pairs.is_empty() {
            path
        } else {
            format!("{}?{}", path, serialize_form_pairs(&pairs))
        };
        next
    }

    /// Cookies across all Cookie headers, in order.
    fn cookie_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case("cookie"))
            .flat_map(|h| parse_cookie_pairs(&h.value))
            .collect()
    }

    /// Rebuild the Cookie header from a cookie list. Collapses multiple
    /// Cookie headers into one at the position of the first; drops the
    /// header entirely when empty.
    fn with_cookie_pairs(&self, cookies: Vec<(String, String)>) -> Self {
        let mut next = self.clone();
        let first = next
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case("cookie"));
        next.headers.retain(|h| !h.name.eq_ignore_ascii_case("cookie"));
        if !cookies.is_empty() {
            let value = cookies
                .iter()
                .map(|(n, v)| format!("{}={}", n, v))
                .collect::<Vec<_>>()
                .join("; ");
            let at = first.unwrap_or(next.headers.len()).min(next.headers.len());
            next.headers.insert(at, Header::new("Cookie", value));
        }
        next
    }
}

/// Immutable snapshot of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    version: String,
    status_code: u16,
    reason: String,
    headers: Vec<Header>,
    body: String,
}

impl ResponseSnapshot {
    pub fn from_raw(raw: &str) -> Self {
        let (head, body) = split_head_body(raw);
        let mut lines = head.lines();

        let (version, status_code, reason) = match lines.next() {
            Some(line) => {
                let mut parts = line.splitn(3, ' ');
                let version = parts.next().unwrap_or("HTTP/1.1").to_string();
                let code = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
                let reason = parts.next().unwrap_or("").to_string();
                (version, code, reason)
            }
            None => ("HTTP/1.1".to_string(), 0, String::new()),
        };

        let headers = lines
            .filter(|l| !l.is_empty())
            .map(|line| match line.split_once(':') {
                Some((name, value)) => Header::new(name.trim(), value.trim()),
                None => Header::new(line.trim(), ""),
            })
            .collect();

        Self {
            version,
            status_code,
            reason,
            headers,
            body: body.to_string(),
        }
    }

    /// Shorthand for a response with just a status code and body.
    pub fn of(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status_code,
            reason: String::new(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn to_text(&self) -> String {
        let mut out = format!(
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason
        );
        for h in &self.headers {
            out.push_str(&format!("{}: {}\r\n", h.name, h.value));
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

fn split_head_body(raw: &str) -> (&str, &str) {
    if let Some(pos) = raw.find("\r\n\r\n") {
        (&raw[..pos], &raw[pos + 4..])
    } else if let Some(pos) = raw.find("\n\n") {
        (&raw[..pos], &raw[pos + 2..])
    } else {
        (raw, "")
    }
}

/// Parse `a=1&b=2` pairs, percent-decoding names and values. A bare token
/// without `=` becomes a parameter with an empty value.
fn parse_form_pairs(text: &str) -> Vec<(String, String)> {
    text.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(part), String::new()),
        })
        .collect()
}

fn serialize_form_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(n, v)| format!("{}={}", encode(n), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn parse_cookie_pairs(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

fn decode(text: &str) -> String {
    urlencoding::decode(text)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| text.to_string())
}

fn encode(text: &str) -> String {
    urlencoding::encode(text).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> HttpService {
        HttpService::new("example.com", 443, true)
    }

    fn raw_request() -> &'static str {
        "POST /api/items?page=1&sort=asc HTTP/1.1\r\n\
         Host: example.com\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Cookie: session=abc; theme=dark\r\n\
         Content-Length: 14\r\n\
         \r\n\
         name=x&role=rw"
    }

    #[test]
    fn parse_and_reserialize_round_trip() {
        let req = RequestSnapshot::from_raw(service(), raw_request());
        assert_eq!(req.method(), "POST");
        assert_eq!(req.path(), "/api/items");
        assert_eq!(req.query(), Some("page=1&sort=asc"));
        assert_eq!(req.to_text(), raw_request());
    }

    #[test]
    fn enumerates_typed_parameters() {
        let req = RequestSnapshot::from_raw(service(), raw_request());
        let params = req.parameters();
        assert_eq!(params.len(), 6);
        assert!(params.contains(&Param::url("page", "1")));
        assert!(params.contains(&Param::body("role", "rw")));
        assert!(params.contains(&Param::cookie("session", "abc")));
        assert!(params.contains(&Param::cookie("theme", "dark")));
    }

    #[test]
    fn url_and_extension() {
        let req = RequestSnapshot::build(
            HttpService::new("example.com", 8443, true),
            "GET",
            "/static/app.min.js?v=3",
            vec![],
            "",
        );
        assert_eq!(req.url(), "https://example.com:8443/static/app.min.js?v=3");
        assert_eq!(req.file_extension(), Some("js"));

        let no_ext = RequestSnapshot::build(service(), "GET", "/api/items", vec![], "");
        assert_eq!(no_ext.file_extension(), None);
        assert_eq!(no_ext.url(), "https://example.com/api/items");
    }

    #[test]
    fn header_mutators() {
        let req = RequestSnapshot::from_raw(service(), raw_request());

        let added = req.with_added_header("X-Role", "admin");
        assert_eq!(added.header_value("x-role"), Some("admin"));

        let updated = added.with_updated_header("X-ROLE", "user");
        assert_eq!(updated.header_value("X-Role"), Some("user"));

        let removed = updated.with_removed_header(&Header::new("x-role", "user"));
        assert_eq!(removed.header_value("X-Role"), None);
    }

    #[test]
    fn body_replacement_updates_content_length() {
        let req = RequestSnapshot::from_raw(service(), raw_request());
        let next = req.with_body("name=y");
        assert_eq!(next.body(), "name=y");
        assert_eq!(next.header_value("content-length"), Some("6"));
    }

    #[test]
    fn url_param_mutations() {
        let req = RequestSnapshot::from_raw(service(), raw_request());

        let removed = req.with_removed_param(&Param::url("page", "1"));
        assert_eq!(removed.query(), Some("sort=asc"));

        let updated = req.with_updated_param(&Param::url("sort", "desc"));
        assert_eq!(updated.query(), Some("page=1&sort=desc"));

        let emptied = removed.with_removed_param(&Param::url("sort", "asc"));
        assert_eq!(emptied.query(), None);
        assert_eq!(emptied.path(), "/api/items");
    }

    #[test]
    fn cookie_param_mutations() {
        let req = RequestSnapshot::from_raw(service(), raw_request());

        let renamed = req
            .with_removed_param(&Param::cookie("session", "abc"))
            .with_added_param(&Param::cookie("sid", "abc"));
        assert_eq!(renamed.header_value("cookie"), Some("theme=dark; sid=abc"));

        let stripped = renamed
            .with_removed_param(&Param::cookie("theme", "dark"))
            .with_removed_param(&Param::cookie("sid", "abc"));
        assert_eq!(stripped.header_value("cookie"), None);
    }

    #[test]
    fn response_parse() {
        let resp = ResponseSnapshot::from_raw(
            "HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\n\r\ndenied",
        );
        assert_eq!(resp.status_code(), 403);
        assert_eq!(resp.body(), "denied");
    }
}
