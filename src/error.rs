use thiserror::Error;
use tonic::{Code, Status};

use crate::filter::{Phase, ValidationError};

/// Why a stream ended abnormally. Peer EOF and cancellation are not errors.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("processing request carries no known phase message")]
    UnknownMessage,
    /// The filter's error is rendered with its whole context chain in the
    /// message and not exposed through `source()`.
    #[error("{phase}: filter {filter} failed: {error:#}")]
    Filter {
        phase: Phase,
        filter: String,
        error: anyhow::Error,
    },
    #[error("{phase}: filter {filter} produced an invalid response: {source}")]
    InvalidMutation {
        phase: Phase,
        filter: String,
        #[source]
        source: ValidationError,
    },
    #[error("{phase}: failed sending response: {source}")]
    Send {
        phase: Phase,
        #[source]
        source: Status,
    },
    #[error("failed receiving request: {0}")]
    Recv(#[source] Status),
}

impl ProcessError {
    /// gRPC status the stream is closed with.
    pub fn to_status(&self) -> Status {
        match self {
            ProcessError::UnknownMessage => Status::invalid_argument(self.to_string()),
            ProcessError::Send { source, .. } | ProcessError::Recv(source) => {
                Status::new(source.code(), self.to_string())
            }
            _ => Status::unknown(self.to_string()),
        }
    }

    /// Phase the error surfaced in, when it belongs to one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            ProcessError::Filter { phase, .. }
            | ProcessError::InvalidMutation { phase, .. }
            | ProcessError::Send { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Transport statuses that mean the peer went away on purpose.
pub fn is_canceled(status: &Status) -> bool {
    status.code() == Code::Cancelled
}

/// Drops errors that only signal the peer closed or cancelled the stream.
pub fn ignore_canceled(result: Result<(), ProcessError>) -> Result<(), ProcessError> {
    match result {
        Err(ProcessError::Recv(ref s)) | Err(ProcessError::Send { source: ref s, .. })
            if is_canceled(s) =>
        {
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_an_error() {
        assert!(ignore_canceled(Err(ProcessError::Recv(Status::cancelled("gone")))).is_ok());
        let err = ignore_canceled(Err(ProcessError::Recv(Status::internal("boom")))).unwrap_err();
        assert_eq!(err.to_status().code(), Code::Internal);
    }

    #[test]
    fn filter_errors_name_phase_and_filter() {
        let err = ProcessError::Filter {
            phase: Phase::RequestHeaders,
            filter: "auth".into(),
            error: anyhow::anyhow!("backend unavailable"),
        };
        let status = err.to_status();
        assert_eq!(status.code(), Code::Unknown);
        assert_eq!(
            status.message(),
            "request_headers: filter auth failed: backend unavailable"
        );
        assert_eq!(err.phase(), Some(Phase::RequestHeaders));
        assert_eq!(ProcessError::UnknownMessage.to_status().code(), Code::InvalidArgument);
    }

    #[test]
    fn filter_error_chain_is_reported_once() {
        let err = ProcessError::Filter {
            phase: Phase::ResponseHeaders,
            filter: "auth".into(),
            error: anyhow::anyhow!("connection refused").context("token lookup"),
        };
        assert_eq!(
            err.to_status().message(),
            "response_headers: filter auth failed: token lookup: connection refused"
        );
        let report = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(report.matches("connection refused").count(), 1);
        assert_eq!(report.matches("token lookup").count(), 1);
    }
}
