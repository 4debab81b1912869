use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Retryable,
    Fatal,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("response refused or empty (finish reason: {0})")]
    Refused(String),

    #[error("response truncated at the token budget")]
    Truncated,

    #[error("unexpected response body: {0}")]
    Protocol(String),
}

impl LlmError {
    pub fn severity(&self) -> Severity {
        match self {
            LlmError::Timeout | LlmError::Transport(_) => Severity::Retryable,
            LlmError::Status { status, .. } if *status == 429 || *status >= 500 => {
                Severity::Retryable
            }
            _ => Severity::Fatal,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_decode() {
            LlmError::Protocol(e.to_string())
        } else {
            LlmError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("{task}: service unavailable after {attempts} attempts: {source}")]
    Exhausted {
        task: String,
        attempts: usize,
        #[source]
        source: LlmError,
    },

    #[error("{task}: {source}")]
    Content {
        task: String,
        #[source]
        source: LlmError,
    },

    #[error("{task}: malformed response after {attempts} attempts: {message}")]
    Malformed {
        task: String,
        attempts: usize,
        message: String,
    },

    #[error("worker for {task} stopped unexpectedly: {message}")]
    Worker { task: String, message: String },
}

impl AnalysisError {
    /// Retries are exhausted by the time an `AnalysisError` exists, so only
    /// the transient kind is reported as retryable; the workflow still
    /// decides whether to stop.
    pub fn severity(&self) -> Severity {
        match self {
            AnalysisError::Exhausted { .. } => Severity::Retryable,
            _ => Severity::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let busy = LlmError::Status { status: 503, body: String::new() };
        let limited = LlmError::Status { status: 429, body: String::new() };
        let bad_key = LlmError::Status { status: 401, body: String::new() };
        assert_eq!(busy.severity(), Severity::Retryable);
        assert_eq!(limited.severity(), Severity::Retryable);
        assert_eq!(bad_key.severity(), Severity::Fatal);
    }

    #[test]
    fn test_content_errors_are_fatal() {
        assert_eq!(LlmError::Truncated.severity(), Severity::Fatal);
        assert_eq!(LlmError::Refused("SAFETY".into()).severity(), Severity::Fatal);
        assert_eq!(LlmError::Timeout.severity(), Severity::Retryable);
    }
}
