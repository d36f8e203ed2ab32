//! Error types of the remote ESI client

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("ESI overloaded (status {status})")]
    ServerOverloaded { status: u16 },

    #[error("ESI error limit reached, resets in {reset:?}")]
    ErrorLimited { reset: Duration },

    #[error("ESI upstream timeout, suggested wait {wait:?}")]
    UpstreamTimeout { wait: Duration },

    #[error("Undecodable ESI response: {0}")]
    Decode(String),

    #[error("ESI error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Timed out waiting for {stage}")]
    QueueTimeout { stage: &'static str },

    #[error("Request cancelled")]
    Cancelled,

    #[error("No attempts left")]
    NoAttemptsLeft,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Failures worth another attempt: the remote side may behave on retry
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::ServerOverloaded { .. }
                | Self::ErrorLimited { .. }
                | Self::UpstreamTimeout { .. }
                | Self::Decode(_)
        )
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Status code of a semantic rejection by the remote API
    pub const fn remote_code(&self) -> Option<u16> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FetchError::ServerOverloaded { status: 503 }, true)]
    #[case(FetchError::ErrorLimited { reset: Duration::from_secs(5) }, true)]
    #[case(FetchError::UpstreamTimeout { wait: Duration::from_secs(3) }, true)]
    #[case(FetchError::Decode("truncated".into()), true)]
    #[case(FetchError::Remote { code: 404, message: "Type not found!".into() }, false)]
    #[case(FetchError::QueueTimeout { stage: "admission" }, false)]
    #[case(FetchError::Cancelled, false)]
    #[case(FetchError::Auth("bad token".into()), false)]
    fn transient_classification(#[case] error: FetchError, #[case] transient: bool) {
        assert_eq!(error.is_transient(), transient);
    }

    #[test]
    fn remote_code_only_for_semantic_errors() {
        let error = FetchError::Remote {
            code: 400,
            message: "bad type".into(),
        };
        assert_eq!(error.remote_code(), Some(400));
        assert_eq!(error.to_string(), "ESI error 400: bad type");
        assert_eq!(FetchError::Cancelled.remote_code(), None);
        assert!(FetchError::Cancelled.is_cancelled());
    }
}
