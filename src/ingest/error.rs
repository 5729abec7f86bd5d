// src/ingest/error.rs
//! Error taxonomy shared by the fetch path, the pipeline and manual capture.

use std::time::Duration;

use serde::Serialize;
use snafu::Snafu;

use crate::ingest::guard::GuardRejection;
use crate::ingest::types::SourceId;

/// Coarse failure classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed source configuration or target. Never retried.
    Validation,
    /// Fetch target refused by the SSRF guard. Never retried automatically.
    SsrfRejected,
    /// Recoverable; left for the next scheduled run.
    Network,
    /// Recoverable; left for the next scheduled run.
    Timeout,
    /// Malformed feed content.
    Parse,
    /// Store or registry failure.
    Persistence,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    #[snafu(display("invalid source target: {reason}"))]
    InvalidTarget { reason: String },
    #[snafu(display("fetch target rejected: {source}"))]
    Blocked { source: GuardRejection },
    #[snafu(display("HTTP request failed: {source}"))]
    Http { source: reqwest::Error },
    #[snafu(display("HTTP {status}{} from {url}", status_hint(*status)))]
    Status { status: u16, url: String },
    #[snafu(display("timed out after {secs}s"))]
    Timeout { secs: u64 },
    #[snafu(display("more than {max} redirects"))]
    TooManyRedirects { max: usize },
    #[snafu(display("redirect from {url} without a usable Location header"))]
    BadRedirect { url: String },
    #[snafu(display("response body exceeds {limit} bytes"))]
    BodyTooLarge { limit: usize },
    #[snafu(display("could not parse {what}: {reason}"))]
    Parse { what: &'static str, reason: String },
}

fn status_hint(status: u16) -> &'static str {
    match status {
        403 => " (access denied, private or blocking automated access)",
        404 => " (not found)",
        429 => " (rate limited by remote)",
        _ => "",
    }
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::InvalidTarget { .. } => ErrorKind::Validation,
            FetchError::Blocked { source } if source.is_malformed() => ErrorKind::Validation,
            FetchError::Blocked { .. } => ErrorKind::SsrfRejected,
            FetchError::Http { source } if source.is_timeout() => ErrorKind::Timeout,
            FetchError::Timeout { .. } => ErrorKind::Timeout,
            FetchError::Http { .. }
            | FetchError::Status { .. }
            | FetchError::TooManyRedirects { .. }
            | FetchError::BadRedirect { .. }
            | FetchError::BodyTooLarge { .. } => ErrorKind::Network,
            FetchError::Parse { .. } => ErrorKind::Parse,
        }
    }

    /// HTTP status of the remote response, if the failure was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable { reason: String },
    #[snafu(display("source {id} not found"))]
    UnknownSource { id: SourceId },
}

/// Faults that stop the orchestrator itself. Everything else is isolated
/// to a single source outcome.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PipelineError {
    #[snafu(display("source registry unusable: {source}"))]
    Registry { source: StoreError },
    #[snafu(display("source {id} not found"))]
    SourceNotFound { id: SourceId },
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum CaptureError {
    #[snafu(display("invalid capture target: {reason}"))]
    InvalidTarget { reason: String },
    #[snafu(display("capture target blocked: {source}"))]
    BlockedTarget { source: GuardRejection },
    #[snafu(display("capture timed out after {secs}s"))]
    Timeout { secs: u64 },
    #[snafu(display("fetching page failed: {source}"))]
    Fetch { source: FetchError },
    #[snafu(display("could not extract article: {reason}"))]
    Extraction { reason: String },
    #[snafu(display("{url} was already captured"))]
    Duplicate { url: String },
    #[snafu(display("too many captures, retry in {}ms", retry_after.as_millis()))]
    Throttled { retry_after: Duration },
    #[snafu(display("saving article failed: {source}"))]
    Persistence { source: StoreError },
    #[snafu(display("capture cancelled"))]
    Cancelled,
}

impl CaptureError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CaptureError::InvalidTarget { .. } | CaptureError::Extraction { .. } => {
                Some(ErrorKind::Validation)
            }
            CaptureError::BlockedTarget { .. } => Some(ErrorKind::SsrfRejected),
            CaptureError::Timeout { .. } | CaptureError::Cancelled => Some(ErrorKind::Timeout),
            CaptureError::Fetch { source } => Some(source.kind()),
            CaptureError::Persistence { .. } => Some(ErrorKind::Persistence),
            CaptureError::Duplicate { .. } | CaptureError::Throttled { .. } => None,
        }
    }
}

impl From<FetchError> for CaptureError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Blocked { source } if source.is_malformed() => {
                CaptureError::InvalidTarget {
                    reason: source.to_string(),
                }
            }
            FetchError::Blocked { source } => CaptureError::BlockedTarget { source },
            FetchError::Timeout { secs } => CaptureError::Timeout { secs },
            other => CaptureError::Fetch { source: other },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_carry_hints_and_kind() {
        let e = FetchError::Status {
            status: 404,
            url: "https://example.com/feed".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Network);
        assert_eq!(e.status(), Some(404));
        assert!(e.to_string().contains("not found"));
    }

    #[test]
    fn malformed_guard_rejections_become_invalid_targets() {
        let e: CaptureError = FetchError::Blocked {
            source: GuardRejection::SchemeNotAllowed {
                scheme: "ftp".into(),
            },
        }
        .into();
        assert!(matches!(e, CaptureError::InvalidTarget { .. }));

        let e: CaptureError = FetchError::Blocked {
            source: GuardRejection::BlockedHost {
                host: "localhost".into(),
            },
        }
        .into();
        assert!(matches!(e, CaptureError::BlockedTarget { .. }));
        assert_eq!(e.kind(), Some(ErrorKind::SsrfRejected));
    }

    #[test]
    fn malformed_guard_rejection_is_a_validation_kind() {
        let e = FetchError::Blocked {
            source: GuardRejection::MissingHost,
        };
        assert_eq!(e.kind(), ErrorKind::Validation);
        let e = FetchError::Blocked {
            source: GuardRejection::BlockedPort { port: 22 },
        };
        assert_eq!(e.kind(), ErrorKind::SsrfRejected);
    }
}
