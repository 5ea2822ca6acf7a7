//! Encoding filter decisions into ext_proc replies.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use super::headers::Headers;
use super::validate::{self, ValidationError};
use crate::proto::{
    self, body_mutation, common_response::ResponseStatus,
    header_value_option::HeaderAppendAction,
};

/// Headers the proxy routes on. Changing one requires a route cache clear.
static ROUTING_HEADERS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["host", ":authority", ":path", ":method"]));

fn is_routing_header(key: &str) -> bool {
    ROUTING_HEADERS.contains(key)
}

/// Pseudo-headers and `host` can never be removed.
fn is_reserved_header(key: &str) -> bool {
    key.starts_with(':') || key == "host"
}

/// Which `HeaderValue` field outbound values are written to.
///
/// Proxies that send header values as `raw_value` also expect mutations in
/// `raw_value`, older ones use `value`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HeaderEncoding {
    #[default]
    RawValue,
    Value,
}

impl HeaderEncoding {
    fn encode(self, key: String, value: &str) -> proto::HeaderValue {
        match self {
            HeaderEncoding::RawValue => proto::HeaderValue {
                key,
                value: String::new(),
                raw_value: value.as_bytes().to_vec(),
            },
            HeaderEncoding::Value => proto::HeaderValue {
                key,
                value: value.to_string(),
                raw_value: Vec::new(),
            },
        }
    }

    /// Moves a value into the field this encoding writes, leaving the other empty.
    fn reencode(self, header: &mut proto::HeaderValue) {
        match self {
            HeaderEncoding::RawValue if header.raw_value.is_empty() => {
                header.raw_value = std::mem::take(&mut header.value).into_bytes();
            }
            HeaderEncoding::Value if !header.raw_value.is_empty() => {
                let raw = std::mem::take(&mut header.raw_value);
                header.value = String::from_utf8_lossy(&raw).into_owned();
            }
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BodyMutation {
    Replace(Vec<u8>),
    Clear,
}

/// Set/append/remove bookkeeping shared by the writer and the immediate
/// response builder. Keys are lower-cased on the way in.
fn push_set(
    mutation: &mut proto::HeaderMutation,
    encoding: HeaderEncoding,
    key: &str,
    value: &str,
) -> String {
    let key = key.to_ascii_lowercase();
    mutation
        .set_headers
        .retain(|o| o.header.as_ref().map_or(true, |h| h.key != key));
    mutation.set_headers.push(proto::HeaderValueOption {
        header: Some(encoding.encode(key.clone(), value)),
        append: None,
        append_action: HeaderAppendAction::OverwriteIfExistsOrAdd as i32,
        keep_empty_value: false,
    });
    key
}

fn push_append(
    mutation: &mut proto::HeaderMutation,
    encoding: HeaderEncoding,
    key: &str,
    value: &str,
) -> String {
    let key = key.to_ascii_lowercase();
    // some proxy versions only honour the legacy `append` flag
    mutation.set_headers.push(proto::HeaderValueOption {
        header: Some(encoding.encode(key.clone(), value)),
        append: Some(true),
        append_action: HeaderAppendAction::AppendIfExistsOrAdd as i32,
        keep_empty_value: false,
    });
    key
}

/// Returns the normalised key, or `None` when the header is reserved.
fn push_remove(mutation: &mut proto::HeaderMutation, key: &str) -> Option<String> {
    let key = key.to_ascii_lowercase();
    if is_reserved_header(&key) {
        return None;
    }
    // The proxy applies removals before sets, so a pending set would survive.
    mutation
        .set_headers
        .retain(|o| o.header.as_ref().map_or(true, |h| h.key != key));
    if !mutation.remove_headers.contains(&key) {
        mutation.remove_headers.push(key.clone());
    }
    Some(key)
}

/// Accumulates the header mutation for one header phase.
///
/// Every edit is applied twice: to the outbound `CommonResponse` and to a
/// live copy of the phase's headers, so filters running later in the same
/// phase observe what earlier filters did.
#[derive(Clone, Debug)]
pub struct HeaderMutationWriter {
    response: proto::CommonResponse,
    headers: Headers,
    encoding: HeaderEncoding,
}

impl HeaderMutationWriter {
    pub fn new(headers: Headers) -> Self {
        Self::with_encoding(headers, HeaderEncoding::default())
    }

    pub fn with_encoding(headers: Headers, encoding: HeaderEncoding) -> Self {
        Self {
            response: proto::CommonResponse {
                header_mutation: Some(proto::HeaderMutation::default()),
                ..Default::default()
            },
            headers,
            encoding,
        }
    }

    fn mutation(&mut self) -> &mut proto::HeaderMutation {
        self.response
            .header_mutation
            .get_or_insert_with(proto::HeaderMutation::default)
    }

    /// Replaces all values of `key`.
    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        let encoding = self.encoding;
        let key = push_set(self.mutation(), encoding, key, value);
        self.headers.set(&key, value);
        if is_routing_header(&key) {
            self.response.clear_route_cache = true;
        }
        self
    }

    /// Adds a value to `key`, keeping the existing ones.
    pub fn append_header(&mut self, key: &str, value: &str) -> &mut Self {
        let encoding = self.encoding;
        let key = push_append(self.mutation(), encoding, key, value);
        self.headers.add(&key, value);
        if is_routing_header(&key) {
            self.response.clear_route_cache = true;
        }
        self
    }

    /// Removes headers. Pseudo-headers and `host` are silently kept.
    pub fn remove_headers<I, S>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in keys {
            if let Some(key) = push_remove(self.mutation(), key.as_ref()) {
                self.headers.remove(&key);
            }
        }
        self
    }

    pub fn set_status(&mut self, status: ResponseStatus) -> &mut Self {
        self.response.status = status as i32;
        self
    }

    pub fn clear_route_cache(&mut self, clear: bool) -> &mut Self {
        self.response.clear_route_cache = clear;
        self
    }

    /// Replaces or clears the body. Switches the status to
    /// `CONTINUE_AND_REPLACE`, the only status under which the proxy applies
    /// a body mutation sent with headers.
    pub fn body_mutation(&mut self, body: BodyMutation) -> &mut Self {
        let mutation = match body {
            BodyMutation::Replace(bytes) => body_mutation::Mutation::Body(bytes),
            BodyMutation::Clear => body_mutation::Mutation::ClearBody(true),
        };
        self.response.body_mutation = Some(proto::BodyMutation {
            mutation: Some(mutation),
        });
        self.set_status(ResponseStatus::ContinueAndReplace)
    }

    /// Live view of the phase's headers with all edits so far applied.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn route_cache_cleared(&self) -> bool {
        self.response.clear_route_cache
    }

    pub fn common_response(&self) -> &proto::CommonResponse {
        &self.response
    }

    pub fn into_common_response(self) -> proto::CommonResponse {
        self.response
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate::validate_common_response(&self.response)
    }
}

/// A locally generated reply that ends the stream.
#[derive(Clone, Debug, PartialEq)]
pub struct ImmediateResponse(proto::ImmediateResponse);

impl ImmediateResponse {
    pub fn builder() -> ImmediateResponseBuilder {
        ImmediateResponseBuilder::new()
    }

    pub fn status(&self) -> Option<u16> {
        self.0
            .status
            .as_ref()
            .and_then(|s| u16::try_from(s.code).ok())
    }

    pub fn body(&self) -> &[u8] {
        &self.0.body
    }

    pub fn header_mutation(&self) -> Option<&proto::HeaderMutation> {
        self.0.headers.as_ref()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate::validate_immediate_response(&self.0)
    }

    /// Rewrites header values into the field `encoding` uses, whatever the
    /// builder was configured with.
    pub fn with_header_encoding(mut self, encoding: HeaderEncoding) -> Self {
        if let Some(mutation) = self.0.headers.as_mut() {
            for header in mutation.set_headers.iter_mut().filter_map(|o| o.header.as_mut()) {
                encoding.reencode(header);
            }
        }
        self
    }

    pub fn as_proto(&self) -> &proto::ImmediateResponse {
        &self.0
    }

    pub fn into_proto(self) -> proto::ImmediateResponse {
        self.0
    }
}

impl From<proto::ImmediateResponse> for ImmediateResponse {
    fn from(resp: proto::ImmediateResponse) -> Self {
        Self(resp)
    }
}

/// Builds an [`ImmediateResponse`].
///
/// No field is required here. A response without a status is rejected by
/// the engine when a filter returns it.
#[derive(Clone, Debug, Default)]
pub struct ImmediateResponseBuilder {
    status: Option<u16>,
    headers: proto::HeaderMutation,
    body: Vec<u8>,
    details: String,
    encoding: HeaderEncoding,
}

impl ImmediateResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn http_status(mut self, code: u16) -> Self {
        self.status = Some(code);
        self
    }

    pub fn header_encoding(mut self, encoding: HeaderEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn set_header(mut self, key: &str, value: &str) -> Self {
        push_set(&mut self.headers, self.encoding, key, value);
        self
    }

    pub fn append_header(mut self, key: &str, value: &str) -> Self {
        push_append(&mut self.headers, self.encoding, key, value);
        self
    }

    pub fn remove_headers<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in keys {
            push_remove(&mut self.headers, key.as_ref());
        }
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Free-form reason, surfaced by the proxy as response code details.
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn build(self) -> ImmediateResponse {
        let has_headers = !self.headers.set_headers.is_empty() || !self.headers.remove_headers.is_empty();
        ImmediateResponse(proto::ImmediateResponse {
            status: self.status.map(|code| proto::HttpStatus { code: code.into() }),
            headers: has_headers.then_some(self.headers),
            body: self.body,
            details: self.details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_keys(m: &proto::HeaderMutation) -> Vec<(String, Vec<u8>, i32)> {
        m.set_headers
            .iter()
            .filter_map(|o| o.header.as_ref().map(|h| (h.key.clone(), h.raw_value.clone(), o.append_action)))
            .collect()
    }

    #[test]
    fn value_encoding_writes_the_string_field() {
        let mut w = HeaderMutationWriter::with_encoding(Headers::new(), HeaderEncoding::Value);
        w.set_header("X-A", "1");
        let m = w.common_response().header_mutation.as_ref().unwrap();
        let h = m.set_headers[0].header.as_ref().unwrap();
        assert_eq!(h.key, "x-a");
        assert_eq!(h.value, "1");
        assert!(h.raw_value.is_empty());
    }

    #[test]
    fn remove_after_set_drops_the_pending_set() {
        let mut w = HeaderMutationWriter::new(Headers::new());
        w.set_header("x-a", "1").append_header("x-b", "2").remove_headers(["X-A", "x-a"]);
        let m = w.common_response().header_mutation.as_ref().unwrap();
        assert_eq!(
            set_keys(m),
            vec![("x-b".into(), b"2".to_vec(), HeaderAppendAction::AppendIfExistsOrAdd as i32)]
        );
        assert_eq!(m.remove_headers, vec!["x-a".to_string()]);
        assert!(!w.headers().contains_key("x-a"));
    }

    #[test]
    fn body_mutation_forces_continue_and_replace() {
        let mut w = HeaderMutationWriter::new(Headers::new());
        w.body_mutation(BodyMutation::Clear);
        let resp = w.into_common_response();
        assert_eq!(resp.status, ResponseStatus::ContinueAndReplace as i32);
        assert_eq!(
            resp.body_mutation.and_then(|b| b.mutation),
            Some(body_mutation::Mutation::ClearBody(true))
        );
    }

    #[test]
    fn immediate_response_headers_follow_the_requested_encoding() {
        let resp = ImmediateResponse::builder()
            .http_status(302)
            .set_header("location", "/login")
            .build()
            .with_header_encoding(HeaderEncoding::Value);
        let h = resp.header_mutation().unwrap().set_headers[0].header.as_ref().unwrap();
        assert_eq!(h.value, "/login");
        assert!(h.raw_value.is_empty());

        let back = resp.with_header_encoding(HeaderEncoding::RawValue);
        let h = back.header_mutation().unwrap().set_headers[0].header.as_ref().unwrap();
        assert_eq!(h.raw_value, b"/login");
        assert!(h.value.is_empty());
    }

    #[test]
    fn empty_builder_has_no_status() {
        let resp = ImmediateResponseBuilder::new().build();
        assert_eq!(resp.status(), None);
        assert!(resp.header_mutation().is_none());
        assert!(resp.validate().is_err());
    }
}
