#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use extproc::filter::{Filter, FilterResult, HeaderMutationWriter, RequestContext};
use extproc::proto::{
    self, processing_request::Request, processing_response::Response, ProcessingRequest,
    ProcessingResponse,
};
use extproc::{ChannelStream, ExtProcessor, ProcessError};
use tokio_util::sync::CancellationToken;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

pub fn header_map(pairs: &[(&str, &str)]) -> proto::HeaderMap {
    proto::HeaderMap {
        headers: pairs
            .iter()
            .map(|(k, v)| proto::HeaderValue {
                key: k.to_string(),
                value: String::new(),
                raw_value: v.as_bytes().to_vec(),
            })
            .collect(),
    }
}

fn headers(pairs: &[(&str, &str)], end_of_stream: bool) -> proto::HttpHeaders {
    proto::HttpHeaders {
        headers: Some(header_map(pairs)),
        end_of_stream,
    }
}

pub fn request_headers(pairs: &[(&str, &str)]) -> ProcessingRequest {
    ProcessingRequest {
        request: Some(Request::RequestHeaders(headers(pairs, false))),
        ..Default::default()
    }
}

pub fn response_headers(pairs: &[(&str, &str)]) -> ProcessingRequest {
    ProcessingRequest {
        request: Some(Request::ResponseHeaders(headers(pairs, false))),
        ..Default::default()
    }
}

pub fn request_body(body: &[u8]) -> ProcessingRequest {
    ProcessingRequest {
        request: Some(Request::RequestBody(proto::HttpBody {
            body: body.to_vec(),
            end_of_stream: true,
        })),
        ..Default::default()
    }
}

pub fn response_body(body: &[u8]) -> ProcessingRequest {
    ProcessingRequest {
        request: Some(Request::ResponseBody(proto::HttpBody {
            body: body.to_vec(),
            end_of_stream: true,
        })),
        ..Default::default()
    }
}

pub fn request_trailers() -> ProcessingRequest {
    ProcessingRequest {
        request: Some(Request::RequestTrailers(proto::HttpTrailers {
            trailers: Some(header_map(&[("grpc-status", "0")])),
        })),
        ..Default::default()
    }
}

pub fn response_trailers() -> ProcessingRequest {
    ProcessingRequest {
        request: Some(Request::ResponseTrailers(proto::HttpTrailers {
            trailers: Some(header_map(&[("grpc-status", "0")])),
        })),
        ..Default::default()
    }
}

pub fn basic_request() -> ProcessingRequest {
    request_headers(&[
        (":scheme", "https"),
        (":authority", "api.example.com"),
        (":method", "GET"),
        (":path", "/v1/items?limit=10"),
        ("x-request-id", "req-1"),
    ])
}

/// Feeds `messages` to `processor` over an in-process stream, closes the
/// proxy side and returns every reply together with the engine's result.
pub async fn exchange(
    processor: &ExtProcessor,
    messages: Vec<ProcessingRequest>,
) -> (Vec<ProcessingResponse>, Result<(), ProcessError>) {
    let (mut stream, mut peer) = ChannelStream::pair(messages.len() + 1);
    for msg in messages {
        // the engine may already have stopped reading after an immediate response
        let _ = peer.requests.send(msg).await;
    }
    drop(peer.requests);
    let cancel = CancellationToken::new();
    let result = processor.process(&mut stream, &cancel).await;
    drop(stream);
    let mut replies = Vec::new();
    while let Some(reply) = peer.responses.recv().await {
        replies.push(reply);
    }
    (replies, result)
}

/// `(key, value, append_action)` for every set entry of a headers reply.
pub fn set_headers(reply: &ProcessingResponse) -> Vec<(String, String, i32)> {
    common_response(reply)
        .and_then(|c| c.header_mutation.as_ref())
        .map(|m| {
            m.set_headers
                .iter()
                .filter_map(|o| {
                    o.header.as_ref().map(|h| {
                        (
                            h.key.clone(),
                            String::from_utf8_lossy(&h.raw_value).into_owned(),
                            o.append_action,
                        )
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn removed_headers(reply: &ProcessingResponse) -> Vec<String> {
    common_response(reply)
        .and_then(|c| c.header_mutation.as_ref())
        .map(|m| m.remove_headers.clone())
        .unwrap_or_default()
}

pub fn common_response(reply: &ProcessingResponse) -> Option<&proto::CommonResponse> {
    match reply.response.as_ref()? {
        Response::RequestHeaders(h) | Response::ResponseHeaders(h) => h.response.as_ref(),
        _ => None,
    }
}

/// Records `"<name>:<hook>"` into a shared log every time a hook runs.
pub struct Recorder {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
        })
    }

    fn record(&self, hook: &str) {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, hook));
    }
}

#[async_trait::async_trait]
impl Filter for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_request_headers(
        &self,
        _cancel: &CancellationToken,
        _writer: &mut HeaderMutationWriter,
        _req: &mut RequestContext,
    ) -> FilterResult {
        self.record("request");
        Ok(None)
    }

    async fn on_response_headers(
        &self,
        _cancel: &CancellationToken,
        _writer: &mut HeaderMutationWriter,
        _req: &mut RequestContext,
    ) -> FilterResult {
        self.record("response");
        Ok(None)
    }
}
