//! Tax Oracle external interface (§6).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Fallback rate applied when the oracle call fails.
pub const FALLBACK_RATE: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaxExemptReason {
    TaxExempt,
    ReverseCharge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxResult {
    pub amount: i64,
    pub rate: f64,
    pub breakdown: Vec<(String, i64)>,
    pub reason: Option<TaxExemptReason>,
}

impl TaxResult {
    pub fn exempt(reason: TaxExemptReason) -> Self {
        Self {
            amount: 0,
            rate: 0.0,
            breakdown: Vec::new(),
            reason: Some(reason),
        }
    }
}

#[async_trait]
pub trait TaxOracle: Send + Sync + 'static {
    async fn calculate(
        &self,
        account_location: &str,
        amount: i64,
        currency: &str,
    ) -> crate::Result<TaxResult>;
}

/// Flat-rate fallback oracle: always applies `FALLBACK_RATE`. Stands in
/// for a real jurisdiction-aware oracle, which is out of scope.
pub struct FlatRateTaxOracle {
    pub rate: f64,
}

impl Default for FlatRateTaxOracle {
    fn default() -> Self {
        Self { rate: FALLBACK_RATE }
    }
}

#[async_trait]
impl TaxOracle for FlatRateTaxOracle {
    async fn calculate(
        &self,
        _account_location: &str,
        amount: i64,
        _currency: &str,
    ) -> crate::Result<TaxResult> {
        let tax = (amount as f64 * self.rate).floor() as i64;
        Ok(TaxResult {
            amount: tax,
            rate: self.rate,
            breakdown: vec![("flat".to_string(), tax)],
            reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flat_rate_rounds_down() {
        let oracle = FlatRateTaxOracle::default();
        let result = oracle.calculate("US", 2000, "USD").await.unwrap();
        assert_eq!(result.amount, 200);
    }
}
