//! Fee policy consulted by the fee iterator

use crate::config::FeeConfig;
use serde::{Deserialize, Serialize};

/// Fee rate in native units per 1000 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeeRate {
    pub per_kb: i64,
}

impl FeeRate {
    pub fn new(per_kb: i64) -> Self {
        Self { per_kb }
    }

    /// Fee for `size` bytes; never rounds a positive rate down to zero.
    pub fn get_fee(&self, size: usize) -> i64 {
        let fee = self.per_kb.saturating_mul(size as i64) / 1000;
        if fee == 0 && self.per_kb > 0 && size > 0 {
            self.per_kb
        } else {
            fee
        }
    }
}

pub trait FeePolicy: Send + Sync {
    /// Smallest fee relay nodes accept for `size` bytes.
    fn min_relay_fee(&self, size: usize) -> i64;

    /// Fee the wallet pays for `size` bytes.
    fn minimum_fee(&self, size: usize) -> i64;

    /// Whether a transaction with this priority may go without a fee.
    fn allow_free(&self, priority: f64) -> bool;

    /// Protocol fee for the off-chain payload referenced by the outputs.
    fn offchain_fee(&self, payload_size: u64) -> i64;
}

#[derive(Debug, Clone)]
pub struct StandardFeePolicy {
    pub min_relay: FeeRate,
    pub pay_tx: FeeRate,
    pub free_priority_threshold: f64,
    pub offchain: FeeRate,
    pub min_offchain_fee: i64,
}

impl StandardFeePolicy {
    pub fn from_config(config: &FeeConfig) -> Self {
        Self {
            min_relay: FeeRate::new(config.min_relay_fee_per_kb),
            pay_tx: FeeRate::new(config.pay_tx_fee_per_kb),
            free_priority_threshold: config.free_priority_threshold,
            offchain: FeeRate::new(config.offchain_fee_per_kb),
            min_offchain_fee: config.min_offchain_fee,
        }
    }
}

impl Default for StandardFeePolicy {
    fn default() -> Self {
        Self::from_config(&FeeConfig::default())
    }
}

impl FeePolicy for StandardFeePolicy {
    fn min_relay_fee(&self, size: usize) -> i64 {
        self.min_relay.get_fee(size)
    }

    fn minimum_fee(&self, size: usize) -> i64 {
        self.pay_tx.get_fee(size).max(self.min_relay.get_fee(size))
    }

    fn allow_free(&self, priority: f64) -> bool {
        priority > self.free_priority_threshold
    }

    fn offchain_fee(&self, payload_size: u64) -> i64 {
        if payload_size == 0 {
            return 0;
        }
        self.offchain
            .get_fee(payload_size as usize)
            .max(self.min_offchain_fee)
    }
}

/// Input-age weighted priority: sum of `value * (age + 1)` over the inputs
/// divided by the transaction size less a fixed per-input allowance.
pub fn compute_priority(weighted_inputs: f64, size: usize, input_count: usize) -> f64 {
    let allowance = input_count * 41;
    let modified = if size > allowance { size - allowance } else { size };
    if modified == 0 {
        return 0.0;
    }
    weighted_inputs / modified as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_rate_rounding() {
        let rate = FeeRate::new(1000);
        assert_eq!(rate.get_fee(250), 250);
        assert_eq!(FeeRate::new(3).get_fee(100), 3);
        assert_eq!(FeeRate::new(0).get_fee(100), 0);
    }

    #[test]
    fn test_minimum_fee_respects_relay() {
        let policy = StandardFeePolicy {
            min_relay: FeeRate::new(2000),
            pay_tx: FeeRate::new(1000),
            free_priority_threshold: 1.0,
            offchain: FeeRate::new(0),
            min_offchain_fee: 0,
        };
        assert_eq!(policy.minimum_fee(500), 1000);
        assert!(policy.allow_free(2.0));
        assert!(!policy.allow_free(0.5));
    }

    #[test]
    fn test_offchain_fee() {
        let policy = StandardFeePolicy {
            offchain: FeeRate::new(100),
            min_offchain_fee: 50,
            ..StandardFeePolicy::default()
        };
        assert_eq!(policy.offchain_fee(0), 0);
        assert_eq!(policy.offchain_fee(100), 50);
        assert_eq!(policy.offchain_fee(10_000), 1000);
    }

    #[test]
    fn test_priority() {
        assert_eq!(compute_priority(0.0, 200, 1), 0.0);
        assert!((compute_priority(1590.0, 200, 1) - 10.0).abs() < f64::EPSILON);
    }
}
