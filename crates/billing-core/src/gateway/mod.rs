//! Payment Gateway external interface (§4.4, §6).
//!
//! The real gateway is out of scope; this module specifies the contract
//! the Payment Orchestrator depends on and ships a mock used by tests and
//! local development.

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    Succeeded { txn_id: String },
    Failed { reason: String },
    Pending { txn_id: String },
}

/// Guarantees two calls with the same `idempotency_key` produce at most
/// one charge.
#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    async fn attempt(
        &self,
        amount: i64,
        currency: &str,
        payment_method_token: &str,
        idempotency_key: &str,
    ) -> crate::Result<GatewayOutcome>;
}

/// Deterministic in-memory gateway for tests and local development.
/// Declines tokens containing `"decline"`, times out (returns
/// `ExternalTransient`) on tokens containing `"timeout"`, otherwise
/// succeeds. Remembers keys it has already seen to honour the
/// at-most-one-charge guarantee.
pub struct MockPaymentGateway {
    seen: std::sync::Mutex<std::collections::HashMap<String, GatewayOutcome>>,
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self {
            seen: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn attempt(
        &self,
        _amount: i64,
        _currency: &str,
        payment_method_token: &str,
        idempotency_key: &str,
    ) -> crate::Result<GatewayOutcome> {
        let mut seen = self.seen.lock().expect("gateway mutex poisoned");
        if let Some(outcome) = seen.get(idempotency_key) {
            return Ok(outcome.clone());
        }

        if payment_method_token.contains("timeout") {
            return Err(crate::Error::external_transient("gateway timeout"));
        }

        let outcome = if payment_method_token.contains("decline") {
            GatewayOutcome::Failed {
                reason: "card_declined".to_string(),
            }
        } else {
            GatewayOutcome::Succeeded {
                txn_id: format!("txn_{idempotency_key}"),
            }
        };
        seen.insert(idempotency_key.to_string(), outcome.clone());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_key_returns_same_outcome() {
        let gateway = MockPaymentGateway::default();
        let first = gateway.attempt(1000, "USD", "tok_good", "key_1").await.unwrap();
        let second = gateway.attempt(1000, "USD", "tok_good", "key_1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn decline_token_fails() {
        let gateway = MockPaymentGateway::default();
        let outcome = gateway.attempt(1000, "USD", "tok_decline", "key_2").await.unwrap();
        assert!(matches!(outcome, GatewayOutcome::Failed { .. }));
    }
}
