//! Structural checks applied before a mutation leaves the process.
//!
//! These mirror the constraints the proxy enforces on the messages it
//! accepts. Header names and values are limited to 16 KiB and must not
//! contain NUL, CR or LF.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::proto::{self, header_value_option::HeaderAppendAction};

const MAX_HEADER_BYTES: usize = 16384;

static HEADER_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\x00\n\r]+$").unwrap());
static HEADER_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\x00\n\r]*$").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("header option without a header")]
    MissingHeader,
    #[error("header name must not be empty")]
    EmptyHeaderName,
    #[error("header name exceeds 16384 bytes")]
    HeaderNameTooLong,
    #[error("header name {0:?} contains NUL, CR or LF")]
    InvalidHeaderName(String),
    #[error("value of header {0:?} exceeds 16384 bytes")]
    HeaderValueTooLong(String),
    #[error("value of header {0:?} contains NUL, CR or LF")]
    InvalidHeaderValue(String),
    #[error("header {key:?} uses undefined append action {action}")]
    UndefinedAppendAction { key: String, action: i32 },
    #[error("undefined response status {0}")]
    UndefinedResponseStatus(i32),
    #[error("immediate response without a status")]
    MissingStatus,
    #[error("immediate response status {0} is not a defined HTTP status")]
    UndefinedHttpStatus(i32),
}

pub fn validate_common_response(resp: &proto::CommonResponse) -> Result<(), ValidationError> {
    if proto::common_response::ResponseStatus::try_from(resp.status).is_err() {
        return Err(ValidationError::UndefinedResponseStatus(resp.status));
    }
    if let Some(mutation) = &resp.header_mutation {
        validate_header_mutation(mutation)?;
    }
    Ok(())
}

pub fn validate_immediate_response(resp: &proto::ImmediateResponse) -> Result<(), ValidationError> {
    let code = resp
        .status
        .as_ref()
        .map(|s| s.code)
        .ok_or(ValidationError::MissingStatus)?;
    if !is_defined_status(code) {
        return Err(ValidationError::UndefinedHttpStatus(code));
    }
    if let Some(mutation) = &resp.headers {
        validate_header_mutation(mutation)?;
    }
    Ok(())
}

pub fn validate_header_mutation(mutation: &proto::HeaderMutation) -> Result<(), ValidationError> {
    for option in &mutation.set_headers {
        let header = option.header.as_ref().ok_or(ValidationError::MissingHeader)?;
        validate_name(&header.key)?;
        if header.value.len() > MAX_HEADER_BYTES || header.raw_value.len() > MAX_HEADER_BYTES {
            return Err(ValidationError::HeaderValueTooLong(header.key.clone()));
        }
        let raw_ok = !header
            .raw_value
            .iter()
            .any(|b| matches!(b, b'\0' | b'\r' | b'\n'));
        if !raw_ok || !HEADER_VALUE.is_match(&header.value) {
            return Err(ValidationError::InvalidHeaderValue(header.key.clone()));
        }
        if HeaderAppendAction::try_from(option.append_action).is_err() {
            return Err(ValidationError::UndefinedAppendAction {
                key: header.key.clone(),
                action: option.append_action,
            });
        }
    }
    for key in &mutation.remove_headers {
        validate_name(key)?;
    }
    Ok(())
}

fn validate_name(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::EmptyHeaderName);
    }
    if key.len() > MAX_HEADER_BYTES {
        return Err(ValidationError::HeaderNameTooLong);
    }
    if !HEADER_NAME.is_match(key) {
        return Err(ValidationError::InvalidHeaderName(key.to_string()));
    }
    Ok(())
}

/// Codes the proxy's `StatusCode` enum defines.
fn is_defined_status(code: i32) -> bool {
    matches!(
        code,
        100 | 200..=208
            | 226
            | 300..=305
            | 307
            | 308
            | 400..=417
            | 421..=424
            | 426
            | 428
            | 429
            | 431
            | 500..=508
            | 510
            | 511
    )
}
