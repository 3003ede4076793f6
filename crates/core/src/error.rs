//! Typed error set for the exchange boundary.
//!
//! Exchange-native failures are mapped into this closed set inside the
//! adapter; the engine only ever branches on these variants.

use thiserror::Error;

/// Errors reported by an exchange adapter.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Connection-level failure (DNS, TCP, TLS, 5xx without body).
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded its deadline.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// Exchange rate limit hit.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },

    /// Exchange rejected the request with an API-level error.
    #[error("exchange API error: {status_code} - {message}")]
    Api { status_code: u16, message: String },

    /// Not enough margin to place the order.
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Cancel/fetch of an order the exchange no longer knows about.
    #[error("order not found: {order_id}")]
    OrderNotFound { order_id: String },

    /// Order violates lot size, precision, or minimum notional rules.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Anything the adapter could not classify.
    #[error("exchange error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// True when the failure is expected to clear on its own; the caller
    /// should log and let the next scheduler tick retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::RateLimit { .. } => true,
            Self::Api { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }

    /// True when a cancel/fetch failed only because the order is already
    /// gone; callers treat this as success-equivalent.
    #[must_use]
    pub const fn is_order_missing(&self) -> bool {
        matches!(self, Self::OrderNotFound { .. })
    }

    /// Convenience constructor for order-not-found.
    pub fn order_not_found(order_id: impl Into<String>) -> Self {
        Self::OrderNotFound {
            order_id: order_id.into(),
        }
    }
}

/// Result alias for adapter operations.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_timeout_are_transient() {
        assert!(ExchangeError::Network("refused".into()).is_transient());
        assert!(ExchangeError::Timeout("10s".into()).is_transient());
        assert!(ExchangeError::RateLimit { retry_after_secs: 2 }.is_transient());
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        assert!(ExchangeError::Api { status_code: 503, message: "down".into() }.is_transient());
        assert!(!ExchangeError::Api { status_code: 400, message: "bad".into() }.is_transient());
    }

    #[test]
    fn missing_order_is_success_equivalent() {
        assert!(ExchangeError::order_not_found("x-1").is_order_missing());
        assert!(!ExchangeError::InvalidOrder("qty".into()).is_order_missing());
    }
}
