//! Server side of the Envoy external processing (ext_proc) protocol.
//!
//! Envoy opens one bidirectional gRPC stream per HTTP request and sends the
//! request headers, body, trailers and the matching response phases over it.
//! [`ExtProcessor`] answers each message, running a chain of [`Filter`]s on
//! the header phases. Filters read the request through a
//! [`RequestContext`] and describe header edits through a
//! [`HeaderMutationWriter`], or end the request early with an
//! [`ImmediateResponse`].
//!
//! [`Filter`]: filter::Filter
//! [`RequestContext`]: filter::RequestContext
//! [`HeaderMutationWriter`]: filter::HeaderMutationWriter
//! [`ImmediateResponse`]: filter::ImmediateResponse

pub mod admin;
mod config;
pub mod error;
pub mod filter;
pub mod filters;
pub mod metrics;
pub mod proto;
pub mod server;
pub mod service;
pub mod stream;

pub use config::AppConfig;
pub use error::ProcessError;
pub use metrics::ServiceMetrics;
pub use server::{serve, serve_listener, ListenAddr};
pub use service::{ExtProcessor, ExtProcessorBuilder};
pub use stream::{ChannelPeer, ChannelStream, GrpcStream, ProcessingStream};

/// Builds the processor described by `config`: the named filters in order,
/// plus the header encoding and slow-filter threshold.
pub fn build_processor(config: &AppConfig) -> ExtProcessor {
    let builder = ExtProcessor::builder()
        .header_encoding(config.header_encoding)
        .filter_warn_ms(config.filter_warn_ms);
    let processor =
        filters::register(builder, &config.filter_order, &config.filter_config).build();
    if processor.filter_count() == 0 {
        tracing::warn!("filter chain is empty: every phase will be passed through unchanged");
    }
    processor
}
