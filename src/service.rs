//! The ext_proc protocol engine.
//!
//! One call to [`ExtProcessor::process`] serves one stream: it receives
//! phase messages in order, folds them into a [`RequestContext`], runs the
//! filter chain for header phases and answers every message the proxy
//! expects an answer for.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{ignore_canceled, ProcessError};
use crate::filter::{
    Filter, HeaderEncoding, HeaderMutationWriter, Headers, ImmediateResponse, Phase,
    RequestContext, StreamFilter,
};
use crate::metrics::{FilterOutcome, ServiceMetrics};
use crate::proto::{
    processing_request::Request, processing_response::Response, BodyResponse, HeadersResponse,
    ProcessingResponse, TrailersResponse,
};
use crate::stream::ProcessingStream;

const DEFAULT_FILTER_WARN_MS: u64 = 100;

/// Immutable filter chain plus the settings shared by all streams.
/// Cloning is cheap; clones share filters and metrics.
#[derive(Clone)]
pub struct ExtProcessor {
    filters: Arc<[Arc<dyn Filter>]>,
    stream_filters: Arc<[Arc<dyn StreamFilter>]>,
    header_encoding: HeaderEncoding,
    filter_warn_ms: u64,
    metrics: Arc<ServiceMetrics>,
}

pub struct ExtProcessorBuilder {
    filters: Vec<Arc<dyn Filter>>,
    stream_filters: Vec<Arc<dyn StreamFilter>>,
    header_encoding: HeaderEncoding,
    filter_warn_ms: u64,
}

impl Default for ExtProcessorBuilder {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            stream_filters: Vec::new(),
            header_encoding: HeaderEncoding::default(),
            filter_warn_ms: DEFAULT_FILTER_WARN_MS,
        }
    }
}

impl ExtProcessorBuilder {
    /// Appends a filter to the chain.
    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Appends a filter to the chain and registers its completion hook.
    pub fn stream_filter<F: StreamFilter + 'static>(mut self, filter: Arc<F>) -> Self {
        self.filters.push(filter.clone());
        self.stream_filters.push(filter);
        self
    }

    pub fn header_encoding(mut self, encoding: HeaderEncoding) -> Self {
        self.header_encoding = encoding;
        self
    }

    /// Filters slower than this are logged at warn level.
    pub fn filter_warn_ms(mut self, ms: u64) -> Self {
        self.filter_warn_ms = ms;
        self
    }

    pub fn build(self) -> ExtProcessor {
        let names: Vec<&str> = self.filters.iter().map(|f| f.name()).collect();
        let metrics = Arc::new(ServiceMetrics::new(&names[..]));
        ExtProcessor {
            filters: self.filters.into(),
            stream_filters: self.stream_filters.into(),
            header_encoding: self.header_encoding,
            filter_warn_ms: self.filter_warn_ms,
            metrics,
        }
    }
}

enum PhaseOutcome {
    Reply(Response),
    Immediate(ImmediateResponse),
    Cancelled,
}

impl ExtProcessor {
    pub fn builder() -> ExtProcessorBuilder {
        ExtProcessorBuilder::default()
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    pub fn stream_filter_count(&self) -> usize {
        self.stream_filters.len()
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Serves one stream until the peer closes it, a filter ends it with
    /// an immediate response, or an error occurs. Completion hooks run in
    /// every case, in chain order.
    pub async fn process<S>(
        &self,
        stream: &mut S,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError>
    where
        S: ProcessingStream + ?Sized,
    {
        let span = tracing::info_span!("stream", request_id = tracing::field::Empty);
        async move {
            let mut req = RequestContext::new();
            self.metrics.stream_started();
            let result = ignore_canceled(self.run(stream, cancel, &mut req).await);

            for filter in self.stream_filters.iter() {
                if let Err(err) = filter.on_stream_complete(&req) {
                    tracing::warn!(filter = %filter.name(), error = %format!("{err:#}"), "stream completion hook failed");
                }
            }

            let elapsed_ms = req.duration().as_millis() as u64;
            self.metrics.stream_finished(elapsed_ms, result.is_err());
            match &result {
                Ok(()) => tracing::debug!(elapsed_ms, phase = %req.phase(), "stream closed"),
                Err(err) => tracing::warn!(elapsed_ms, error = %err, "stream failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run<S>(
        &self,
        stream: &mut S,
        cancel: &CancellationToken,
        req: &mut RequestContext,
    ) -> Result<(), ProcessError>
    where
        S: ProcessingStream + ?Sized,
    {
        loop {
            let Some(message) = stream.recv().await.map_err(ProcessError::Recv)? else {
                return Ok(());
            };
            let observe_only = message.observability_mode;
            let Some(request) = message.request else {
                return Err(ProcessError::UnknownMessage);
            };
            let phase = Phase::of(&request);
            self.metrics.message_received(phase);
            req.process(&request, Headers::new());
            tracing::debug!(%phase, observe_only, "message received");

            let reply = match request {
                Request::RequestHeaders(_) | Request::ResponseHeaders(_) => {
                    if phase == Phase::RequestHeaders {
                        tracing::Span::current().record("request_id", req.request_id());
                    }
                    let outcome = self
                        .headers_phase(phase, cancel, req)
                        .instrument(tracing::debug_span!("phase", %phase))
                        .await?;
                    match outcome {
                        PhaseOutcome::Reply(reply) => reply,
                        PhaseOutcome::Immediate(immediate) => {
                            if !observe_only {
                                let immediate = immediate.with_header_encoding(self.header_encoding);
                                let response = ProcessingResponse {
                                    response: Some(Response::ImmediateResponse(
                                        immediate.into_proto(),
                                    )),
                                };
                                stream
                                    .send(response)
                                    .await
                                    .map_err(|source| ProcessError::Send { phase, source })?;
                                self.metrics.immediate_response_sent();
                            }
                            return Ok(());
                        }
                        PhaseOutcome::Cancelled => {
                            tracing::debug!(%phase, "stream cancelled, phase left unanswered");
                            continue;
                        }
                    }
                }
                Request::RequestBody(_) => Response::RequestBody(BodyResponse::default()),
                Request::ResponseBody(_) => Response::ResponseBody(BodyResponse::default()),
                Request::RequestTrailers(_) => {
                    Response::RequestTrailers(TrailersResponse::default())
                }
                Request::ResponseTrailers(_) => {
                    Response::ResponseTrailers(TrailersResponse::default())
                }
            };

            if observe_only {
                continue;
            }
            stream
                .send(ProcessingResponse {
                    response: Some(reply),
                })
                .await
                .map_err(|source| ProcessError::Send { phase, source })?;
        }
    }

    async fn headers_phase(
        &self,
        phase: Phase,
        cancel: &CancellationToken,
        req: &mut RequestContext,
    ) -> Result<PhaseOutcome, ProcessError> {
        let mut writer =
            HeaderMutationWriter::with_encoding(req.mutated_headers(phase), self.header_encoding);

        // response headers walk the chain backwards
        let order: Vec<usize> = if phase == Phase::RequestHeaders {
            (0..self.filters.len()).collect()
        } else {
            (0..self.filters.len()).rev().collect()
        };

        for idx in order {
            if cancel.is_cancelled() {
                return Ok(PhaseOutcome::Cancelled);
            }
            let filter = &self.filters[idx];
            let name = filter.name();
            tracing::trace!(filter = %name, "running filter");

            let start = Instant::now();
            let fut = if phase == Phase::RequestHeaders {
                filter.on_request_headers(cancel, &mut writer, req)
            } else {
                filter.on_response_headers(cancel, &mut writer, req)
            };
            let result = fut
                .instrument(tracing::trace_span!("filter", filter = %name))
                .await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            if elapsed_ms > self.filter_warn_ms {
                tracing::warn!(
                    filter = %name,
                    elapsed_ms,
                    warn_ms = self.filter_warn_ms,
                    "filter exceeded warn threshold"
                );
            }
            req.sync_mutated_headers(phase, writer.headers());

            let outcome = match &result {
                Ok(None) => FilterOutcome::Continue,
                Ok(Some(_)) => FilterOutcome::ImmediateResponse,
                Err(_) => FilterOutcome::Error,
            };
            if let Some(fm) = self.metrics.filter(idx) {
                fm.observe(elapsed_ms, outcome);
            }

            match result {
                Err(error) => {
                    return Err(ProcessError::Filter {
                        phase,
                        filter: name.to_string(),
                        error,
                    });
                }
                Ok(Some(immediate)) => {
                    immediate
                        .validate()
                        .map_err(|source| ProcessError::InvalidMutation {
                            phase,
                            filter: name.to_string(),
                            source,
                        })?;
                    tracing::info!(filter = %name, status = ?immediate.status(), "immediate response");
                    return Ok(PhaseOutcome::Immediate(immediate));
                }
                Ok(None) => {
                    writer
                        .validate()
                        .map_err(|source| ProcessError::InvalidMutation {
                            phase,
                            filter: name.to_string(),
                            source,
                        })?;
                }
            }
        }

        let headers = HeadersResponse {
            response: Some(writer.into_common_response()),
        };
        Ok(PhaseOutcome::Reply(if phase == Phase::RequestHeaders {
            Response::RequestHeaders(headers)
        } else {
            Response::ResponseHeaders(headers)
        }))
    }
}
