//! Engine errors.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::api::ExchangeError;

/// Failure to build or run a trader monitor or client mirror.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("duplicate trader name '{0}'")]
    DuplicateTrader(String),

    #[error("duplicate client name '{0}'")]
    DuplicateClient(String),

    #[error("client '{client}' subscribes to unknown trader '{trader}'")]
    UnknownTrader { client: String, trader: String },

    #[error("client '{client}' uses ratio {ratio} for trader '{trader}'; ratio must be > 0")]
    InvalidRatio {
        client: String,
        trader: String,
        ratio: Decimal,
    },

    #[error("client '{0}' has no subscriptions")]
    NoSubscriptions(String),

    #[error("trader '{trader}' was shut down")]
    TraderGone { trader: String },

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl CopyError {
    /// Configuration problems abort startup; everything else is runtime.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CopyError::DuplicateTrader(_)
                | CopyError::DuplicateClient(_)
                | CopyError::UnknownTrader { .. }
                | CopyError::InvalidRatio { .. }
                | CopyError::NoSubscriptions(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_configuration_classification() {
        let err = CopyError::InvalidRatio {
            client: "c1".into(),
            trader: "alpha".into(),
            ratio: dec!(-1),
        };
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "client 'c1' uses ratio -1 for trader 'alpha'; ratio must be > 0"
        );

        let err: CopyError = ExchangeError::RateLimited.into();
        assert!(!err.is_configuration());
        assert!(!CopyError::ShuttingDown.is_configuration());
    }
}
