//! Filter infrastructure.
//!
//! A filter inspects one stream's headers through the [`RequestContext`]
//! and edits them through the [`HeaderMutationWriter`] it is handed for
//! each header phase. Filters run in registration order for request
//! headers and in reverse order for response headers, so a filter wraps
//! every filter registered after it.

use tokio_util::sync::CancellationToken;

pub mod cookie;
pub mod headers;
pub mod request;
pub mod response;
pub mod validate;

pub use self::cookie::{Cookie, SameSite};
pub use self::headers::Headers;
pub use self::request::{Metadata, Phase, RequestContext, RequestUrl};
pub use self::response::{
    BodyMutation, HeaderEncoding, HeaderMutationWriter, ImmediateResponse,
    ImmediateResponseBuilder,
};
pub use self::validate::ValidationError;

/// `Ok(None)` continues, `Ok(Some(_))` ends the stream with a local reply,
/// `Err(_)` aborts the stream.
pub type FilterResult = anyhow::Result<Option<ImmediateResponse>>;

/// Trait implemented by all filters. One instance serves every stream, so
/// state kept inside a filter must be safe for concurrent use; per-stream
/// state belongs in [`RequestContext::metadata_mut`].
#[async_trait::async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    async fn on_request_headers(
        &self,
        cancel: &CancellationToken,
        writer: &mut HeaderMutationWriter,
        req: &mut RequestContext,
    ) -> FilterResult;

    async fn on_response_headers(
        &self,
        cancel: &CancellationToken,
        writer: &mut HeaderMutationWriter,
        req: &mut RequestContext,
    ) -> FilterResult;
}

/// A filter that also wants to see the final state of every stream.
///
/// Called once after the stream ends, however it ended. Errors are logged
/// and otherwise ignored.
pub trait StreamFilter: Filter {
    fn on_stream_complete(&self, req: &RequestContext) -> anyhow::Result<()>;
}

/// Passes everything through. Useful as a placeholder in a chain.
#[derive(Clone, Debug, Default)]
pub struct NoOpFilter;

#[async_trait::async_trait]
impl Filter for NoOpFilter {
    fn name(&self) -> &str {
        "noop"
    }

    async fn on_request_headers(
        &self,
        _cancel: &CancellationToken,
        _writer: &mut HeaderMutationWriter,
        _req: &mut RequestContext,
    ) -> FilterResult {
        Ok(None)
    }

    async fn on_response_headers(
        &self,
        _cancel: &CancellationToken,
        _writer: &mut HeaderMutationWriter,
        _req: &mut RequestContext,
    ) -> FilterResult {
        Ok(None)
    }
}
