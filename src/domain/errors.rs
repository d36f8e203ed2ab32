//! Errors raised while validating or transforming remote market data.

use thiserror::Error;

/// Failures of the pure series engine and of remote payload validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketDataError {
    /// The remote API handed back data that cannot be trusted: malformed
    /// dates, out-of-order records, absurd spans or impossible values.
    /// Only the affected work unit is abandoned.
    #[error("Invalid remote data: {0}")]
    InvalidRemoteData(String),

    /// An internal bookkeeping assumption does not hold. The whole pass
    /// must stop.
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

impl MarketDataError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRemoteData(message.into())
    }

    pub const fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}
