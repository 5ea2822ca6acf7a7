//! Protocol buffer definitions for the subset of the Envoy API used by the
//! external processing protocol.
//!
//! These mirror what `prost-build`/`tonic-build` emit for the upstream
//! `.proto` files, trimmed to the messages and fields this crate reads or
//! writes. Field tags match upstream, and prost skips unknown fields while
//! decoding, so peers sending the full messages interoperate.

pub mod envoy_config_core_v3;
pub mod envoy_service_ext_proc_v3;
pub mod envoy_type_v3;

pub use envoy_config_core_v3::{header_value_option, HeaderMap, HeaderValue, HeaderValueOption};
pub use envoy_service_ext_proc_v3::{
    body_mutation, common_response, external_processor_client, external_processor_server,
    processing_request, processing_response, BodyMutation, BodyResponse, CommonResponse,
    HeaderMutation, HeadersResponse, HttpBody, HttpHeaders, HttpTrailers, ImmediateResponse,
    ProcessingRequest, ProcessingResponse, TrailersResponse,
};
pub use envoy_type_v3::HttpStatus;
