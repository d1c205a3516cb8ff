use std::path::PathBuf;
use thiserror::Error;

// Binance rejects an order with this code when the wallet cannot cover the
// initial margin.
pub const MARGIN_INSUFFICIENT_CODE: i64 = -2019;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("exchange rejected request (code {code}): {message}")]
    Rejection { code: i64, message: String },

    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("missing api credentials for {0}")]
    MissingCredentials(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::TransientNetwork(_) | ExchangeError::RateLimited(_)
        )
    }

    pub fn rejection_code(&self) -> Option<i64> {
        match self {
            ExchangeError::Rejection { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_margin_insufficient(&self) -> bool {
        self.rejection_code() == Some(MARGIN_INSUFFICIENT_CODE)
    }
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("price data unavailable: {0}")]
    Unavailable(String),

    #[error("replay data exhausted")]
    Exhausted,
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("corrupt state document {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(ExchangeError::TransientNetwork("timeout".into()).is_transient());
        assert!(ExchangeError::RateLimited("429".into()).is_transient());
        assert!(!ExchangeError::DataUnavailable("no mark".into()).is_transient());
        let rejection = ExchangeError::Rejection {
            code: -1111,
            message: "precision".into(),
        };
        assert!(!rejection.is_transient());
        assert_eq!(rejection.rejection_code(), Some(-1111));
    }

    #[test]
    fn margin_code_is_detected() {
        let err = ExchangeError::Rejection {
            code: MARGIN_INSUFFICIENT_CODE,
            message: "Margin is insufficient.".into(),
        };
        assert!(err.is_margin_insufficient());
        assert!(!ExchangeError::MissingCredentials("order".into()).is_margin_insufficient());
    }
}
