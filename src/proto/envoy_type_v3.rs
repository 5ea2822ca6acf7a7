/// HTTP status.
///
/// Upstream declares `code` as the `envoy.type.v3.StatusCode` enum. Enum
/// values travel as varints, so it is carried here as its `int32` wire
/// representation and checked against the defined codes during validation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpStatus {
    /// Supplies HTTP response code.
    #[prost(int32, tag = "1")]
    pub code: i32,
}
