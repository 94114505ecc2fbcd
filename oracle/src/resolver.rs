// Bounded-median consensus over fresh attestations

use crate::collector::Attestation;
use crate::error::OracleError;
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// Why a consensus attempt produced no balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    InsufficientAttestations {
        have: usize,
        need: usize,
    },
    ExcessiveDeviation {
        outlier: U256,
        median: U256,
        deviation_percent: U256,
    },
    LedgerRejected(String),
}

impl From<RejectionReason> for OracleError {
    fn from(reason: RejectionReason) -> Self {
        match reason {
            RejectionReason::InsufficientAttestations { have, need } => {
                OracleError::InsufficientAttestations { have, need }
            }
            RejectionReason::ExcessiveDeviation {
                outlier,
                median,
                deviation_percent,
            } => OracleError::ExcessiveDeviation {
                outlier,
                median,
                deviation_percent,
            },
            RejectionReason::LedgerRejected(detail) => OracleError::Ledger(detail),
        }
    }
}

/// Accepted consensus value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub balance: U256,
    pub participants: usize,
}

/// Median of `values`; the mean of the middle two for even counts
pub fn median(values: &[U256]) -> Option<U256> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        // both halves are at most 2^128 - 1, so the sum cannot overflow
        Some((sorted[mid - 1] + sorted[mid]) / U256::from(2u8))
    }
}

/// `|value - median| * 100 / median`, rounded down
pub fn deviation_percent(value: U256, median: U256) -> U256 {
    if median.is_zero() {
        return if value.is_zero() { U256::ZERO } else { U256::MAX };
    }
    let diff = if value > median {
        value - median
    } else {
        median - value
    };
    diff * U256::from(100u8) / median
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusResolver {
    pub threshold: usize,
    pub max_deviation_percent: u64,
}

impl ConsensusResolver {
    pub fn new(threshold: usize, max_deviation_percent: u64) -> Self {
        Self {
            threshold,
            max_deviation_percent,
        }
    }

    /// Median of the attestations if enough exist and none strays too far
    ///
    /// The first outlier (largest deviation, then largest value) is reported.
    pub fn resolve(&self, attestations: &[Attestation]) -> Result<Resolution, RejectionReason> {
        if attestations.len() < self.threshold {
            return Err(RejectionReason::InsufficientAttestations {
                have: attestations.len(),
                need: self.threshold,
            });
        }

        let balances: Vec<U256> = attestations.iter().map(|a| a.balance).collect();
        let Some(median) = median(&balances) else {
            return Err(RejectionReason::InsufficientAttestations {
                have: 0,
                need: self.threshold,
            });
        };

        let bound = U256::from(self.max_deviation_percent);
        let worst = balances
            .iter()
            .map(|b| (deviation_percent(*b, median), *b))
            .max();
        if let Some((deviation, outlier)) = worst {
            if deviation > bound {
                return Err(RejectionReason::ExcessiveDeviation {
                    outlier,
                    median,
                    deviation_percent: deviation,
                });
            }
        }

        Ok(Resolution {
            balance: median,
            participants: attestations.len(),
        })
    }
}
