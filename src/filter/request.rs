//! Per-stream request state.
//!
//! The proxy sends each phase of one HTTP exchange as a separate message.
//! `RequestContext` folds them into a single view that filters read from:
//! raw headers per phase, headers as mutated by earlier filters, and a
//! handful of values derived from well-known headers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use http::uri::PathAndQuery;

use super::cookie::{parse_cookies, parse_set_cookies, Cookie};
use super::headers::Headers;
use crate::proto::processing_request::Request;

/// Protocol phase. Variants are declared in wire order so that `Ord`
/// matches the order in which the proxy sends them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    #[default]
    Unknown,
    RequestHeaders,
    RequestBody,
    RequestTrailers,
    ResponseHeaders,
    ResponseBody,
    ResponseTrailers,
}

impl Phase {
    pub fn of(request: &Request) -> Self {
        match request {
            Request::RequestHeaders(_) => Phase::RequestHeaders,
            Request::RequestBody(_) => Phase::RequestBody,
            Request::RequestTrailers(_) => Phase::RequestTrailers,
            Request::ResponseHeaders(_) => Phase::ResponseHeaders,
            Request::ResponseBody(_) => Phase::ResponseBody,
            Request::ResponseTrailers(_) => Phase::ResponseTrailers,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Unknown => "unknown",
            Phase::RequestHeaders => "request_headers",
            Phase::RequestBody => "request_body",
            Phase::RequestTrailers => "request_trailers",
            Phase::ResponseHeaders => "response_headers",
            Phase::ResponseBody => "response_body",
            Phase::ResponseTrailers => "response_trailers",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request target split out of the `:path` pseudo-header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestUrl {
    path: String,
    query: Option<String>,
    raw: String,
}

static EMPTY_URL: RequestUrl = RequestUrl {
    path: String::new(),
    query: None,
    raw: String::new(),
};

impl RequestUrl {
    /// Never fails: text that is not a valid request target still yields
    /// everything before the first `?` as the path.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<PathAndQuery>() {
            Ok(pq) => Self {
                path: pq.path().to_string(),
                query: pq.query().map(str::to_string),
                raw: raw.to_string(),
            },
            Err(_) => Self {
                path: raw.split('?').next().unwrap_or_default().to_string(),
                query: None,
                raw: raw.to_string(),
            },
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// The `:path` value exactly as received.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// First decoded value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

/// Schema-less values shared between filters of one stream.
///
/// Keys and value types are a convention between the filters that use
/// them; a `get` with the wrong type simply returns `None`.
#[derive(Default)]
pub struct Metadata {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Metadata {
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// State of one proxied request/response exchange.
///
/// Owned by the task serving the stream. Filters get `&mut` access for
/// the duration of a hook; nothing in here is shared between streams.
#[derive(Debug, Default)]
pub struct RequestContext {
    phase: Phase,
    raw_headers: HashMap<Phase, Headers>,
    mutated_headers: HashMap<Phase, Headers>,
    scheme: String,
    authority: String,
    method: String,
    request_id: String,
    url: Option<RequestUrl>,
    status: u16,
    cookies: Option<Vec<Cookie>>,
    set_cookies: Option<Vec<Cookie>>,
    metadata: Metadata,
    start: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one inbound message into the context.
    ///
    /// `mutated_headers` seeds the mutated snapshot of a header phase; the
    /// decoded headers of the message are appended to it. Derived values
    /// are filled in the first time a non-empty source is seen and are
    /// never overwritten afterwards.
    pub fn process(&mut self, request: &Request, mutated_headers: Headers) {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
        let phase = Phase::of(request);
        self.phase = self.phase.max(phase);

        let map = match request {
            Request::RequestHeaders(h) | Request::ResponseHeaders(h) => h.headers.as_ref(),
            _ => return,
        };
        let raw = map.map(Headers::from_proto).unwrap_or_default();
        let mut mutated = mutated_headers;
        mutated.extend(raw.iter());
        self.raw_headers.insert(phase, raw);
        self.mutated_headers.insert(phase, mutated);

        if phase == Phase::RequestHeaders {
            self.derive_request_fields();
        } else {
            self.derive_response_fields();
        }
    }

    fn derive_request_fields(&mut self) {
        let fill = |slot: &mut String, value: &str| {
            if slot.is_empty() {
                *slot = value.to_string();
            }
        };
        let scheme = self.request_header(":scheme").to_string();
        fill(&mut self.scheme, &scheme);
        let authority = self.request_header(":authority").to_string();
        fill(&mut self.authority, &authority);
        let method = self.request_header(":method").to_string();
        fill(&mut self.method, &method);
        let request_id = self.request_header("x-request-id").to_string();
        fill(&mut self.request_id, &request_id);

        if self.url.is_none() {
            let path = self.request_header(":path");
            if !path.is_empty() {
                self.url = Some(RequestUrl::parse(path));
            }
        }
        if self.cookies.is_none() && !self.request_header("cookie").is_empty() {
            self.cookies = Some(parse_cookies(self.request_header_values("cookie")));
        }
    }

    fn derive_response_fields(&mut self) {
        if self.status == 0 {
            self.status = self.response_header(":status").trim().parse().unwrap_or(0);
        }
        if self.set_cookies.is_none() && !self.response_header("set-cookie").is_empty() {
            self.set_cookies = Some(parse_set_cookies(self.response_header_values("set-cookie")));
        }
    }

    /// Replaces the mutated snapshot of `phase` with what filters produced so far.
    pub(crate) fn sync_mutated_headers(&mut self, phase: Phase, headers: &Headers) {
        self.mutated_headers.insert(phase, headers.clone());
    }

    /// First raw value of `key` in `phase`, or `""`.
    pub fn header(&self, phase: Phase, key: &str) -> &str {
        self.raw_headers
            .get(&phase)
            .and_then(|h| h.get(key))
            .unwrap_or_default()
    }

    pub fn header_values(&self, phase: Phase, key: &str) -> Vec<&str> {
        self.raw_headers
            .get(&phase)
            .map(|h| h.values(key))
            .unwrap_or_default()
    }

    pub fn request_header(&self, key: &str) -> &str {
        self.header(Phase::RequestHeaders, key)
    }

    pub fn request_header_values(&self, key: &str) -> Vec<&str> {
        self.header_values(Phase::RequestHeaders, key)
    }

    pub fn response_header(&self, key: &str) -> &str {
        self.header(Phase::ResponseHeaders, key)
    }

    pub fn response_header_values(&self, key: &str) -> Vec<&str> {
        self.header_values(Phase::ResponseHeaders, key)
    }

    /// Copy of the headers received in `phase`; empty if it has not occurred.
    pub fn raw_headers(&self, phase: Phase) -> Headers {
        self.raw_headers.get(&phase).cloned().unwrap_or_default()
    }

    /// Copy of the headers of `phase` with edits of earlier filters applied.
    pub fn mutated_headers(&self, phase: Phase) -> Headers {
        self.mutated_headers.get(&phase).cloned().unwrap_or_default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn url(&self) -> &RequestUrl {
        self.url.as_ref().unwrap_or(&EMPTY_URL)
    }

    /// Response status, `0` until response headers carrying `:status` arrive.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// `"2xx"`, `"4xx"` and so on; empty while no status is known.
    pub fn status_class(&self) -> String {
        if self.status == 0 {
            String::new()
        } else {
            format!("{}xx", self.status / 100)
        }
    }

    pub fn cookies(&self) -> &[Cookie] {
        self.cookies.as_deref().unwrap_or_default()
    }

    pub fn get_cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies().iter().find(|c| c.name == name)
    }

    pub fn set_cookies(&self) -> &[Cookie] {
        self.set_cookies.as_deref().unwrap_or_default()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Time since the first message of the stream.
    pub fn duration(&self) -> Duration {
        self.start.map(|s| s.elapsed()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parses_path_and_query() {
        let url = RequestUrl::parse("/search?q=rust%20lang&page=2");
        assert_eq!(url.path(), "/search");
        assert_eq!(url.query(), Some("q=rust%20lang&page=2"));
        assert_eq!(url.query_param("q").as_deref(), Some("rust lang"));
        assert_eq!(url.query_param("missing"), None);
    }

    #[test]
    fn malformed_url_degrades_to_path() {
        let url = RequestUrl::parse("/a b?c=d");
        assert_eq!(url.path(), "/a b");
        assert_eq!(url.raw(), "/a b?c=d");
    }

    #[test]
    fn metadata_is_typed_by_convention() {
        let mut md = Metadata::default();
        md.set("user", String::from("alice"));
        md.set("attempts", 3u32);
        assert_eq!(md.get::<String>("user").map(String::as_str), Some("alice"));
        assert_eq!(md.get::<u64>("attempts"), None);
        if let Some(n) = md.get_mut::<u32>("attempts") {
            *n += 1;
        }
        assert_eq!(md.get::<u32>("attempts"), Some(&4));
        assert!(md.remove("user"));
        assert_eq!(md.len(), 1);
    }

    #[test]
    fn phases_order_like_the_wire() {
        assert!(Phase::RequestHeaders < Phase::RequestBody);
        assert!(Phase::RequestTrailers < Phase::ResponseHeaders);
        assert!(Phase::ResponseBody < Phase::ResponseTrailers);
        assert_eq!(Phase::ResponseHeaders.to_string(), "response_headers");
    }
}
