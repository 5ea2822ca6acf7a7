use tokio_util::sync::CancellationToken;

use crate::filter::{
    Filter, FilterResult, HeaderMutationWriter, RequestContext, StreamFilter,
};

/// Logs one line per finished stream.
#[derive(Clone, Debug, Default)]
pub struct AccessLog;

#[async_trait::async_trait]
impl Filter for AccessLog {
    fn name(&self) -> &str {
        "access_log"
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

impl StreamFilter for AccessLog {
    fn on_stream_complete(&self, req: &RequestContext) -> anyhow::Result<()> {
        tracing::info!(
            target: "access_log",
            request_id = %req.request_id(),
            method = %req.method(),
            authority = %req.authority(),
            path = %req.url().path(),
            status = req.status(),
            phase = %req.phase(),
            duration_ms = req.duration().as_millis() as u64,
            "request completed"
        );
        Ok(())
    }
}
