// Reserve oracle configuration

use crate::error::{OracleError, Result};
use serde::{Deserialize, Serialize};
use watchdog_consensus::config::HOUR;

/// Fewest agreeing attesters ever accepted
pub const MIN_CONSENSUS_THRESHOLD: usize = 3;
pub const MAX_CONSENSUS_THRESHOLD: usize = 32;

/// Largest balance an attester may report (2^128 - 1)
pub const MAX_BALANCE: u128 = u128::MAX;

pub const MAX_DEVIATION_PERCENT: u64 = 50;
pub const MAX_STALENESS_BOUND: u64 = 7 * 24 * HOUR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Fresh attestations needed before consensus is attempted
    pub consensus_threshold: usize,
    /// Seconds an attestation stays usable
    pub attestation_timeout: u64,
    /// Seconds after which a consensus balance is stale
    pub max_staleness: u64,
    /// Largest accepted distance from the median, in whole percent
    pub max_deviation_percent: u64,
    /// Minimum seconds between accepted consensus updates per subject
    pub min_consensus_interval: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            consensus_threshold: 3,
            attestation_timeout: 6 * HOUR,
            max_staleness: 24 * HOUR,
            max_deviation_percent: 5,
            min_consensus_interval: HOUR,
        }
    }
}

impl OracleConfig {
    /// Load and validate a JSON configuration; missing fields take defaults
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_CONSENSUS_THRESHOLD..=MAX_CONSENSUS_THRESHOLD).contains(&self.consensus_threshold) {
            return Err(OracleError::InvalidConfig(format!(
                "consensus threshold {} outside {}..={}",
                self.consensus_threshold, MIN_CONSENSUS_THRESHOLD, MAX_CONSENSUS_THRESHOLD
            )));
        }
        if self.attestation_timeout == 0 || self.attestation_timeout > self.max_staleness {
            return Err(OracleError::InvalidConfig(format!(
                "attestation timeout {}s must be non-zero and within staleness bound {}s",
                self.attestation_timeout, self.max_staleness
            )));
        }
        if self.max_staleness > MAX_STALENESS_BOUND {
            return Err(OracleError::InvalidConfig(format!(
                "max staleness {}s above {}s",
                self.max_staleness, MAX_STALENESS_BOUND
            )));
        }
        if self.max_deviation_percent == 0 || self.max_deviation_percent > MAX_DEVIATION_PERCENT {
            return Err(OracleError::InvalidConfig(format!(
                "max deviation {}% outside 1..={}",
                self.max_deviation_percent, MAX_DEVIATION_PERCENT
            )));
        }
        if self.min_consensus_interval > self.max_staleness {
            return Err(OracleError::InvalidConfig(
                "consensus interval longer than staleness bound".into(),
            ));
        }
        Ok(())
    }
}
