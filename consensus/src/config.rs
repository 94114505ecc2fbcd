// Watchdog consensus configuration
//
// Owner-governed parameters. Bounds are enforced when the configuration is
// loaded and again on every runtime update.

use crate::error::{Result, WatchdogError};
use crate::escalation::EscalationLadder;
use serde::{Deserialize, Serialize};

pub const HOUR: u64 = 3600;

/// Roster bounds
pub const MIN_WATCHDOGS: usize = 3;
pub const MAX_WATCHDOGS: usize = 20;

/// Size limits on caller-supplied bytes
pub const MAX_PAYLOAD_LENGTH: usize = 8 * 1024;
pub const MAX_EVIDENCE_LENGTH: usize = 4 * 1024;
pub const MAX_REASON_LENGTH: usize = 256;

/// Objections accepted per operation
pub const MAX_OBJECTIONS: u32 = 10;

/// Escalation tier delay bounds
pub const MIN_TIER_DELAY: u64 = HOUR;
pub const MAX_TIER_DELAY: u64 = 24 * HOUR;

/// Emergency timelock bounds
pub const MIN_EMERGENCY_DELAY: u64 = HOUR;
pub const MAX_EMERGENCY_DELAY: u64 = 48 * HOUR;
pub const DEFAULT_EMERGENCY_DELAY: u64 = 2 * HOUR;

/// Consensus parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Escalation thresholds and delays
    pub escalation: EscalationLadder,
    /// Emergency override timelock (seconds)
    pub emergency_delay: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            escalation: EscalationLadder::default(),
            emergency_delay: DEFAULT_EMERGENCY_DELAY,
        }
    }
}

impl WatchdogConfig {
    /// Load and validate a JSON configuration; missing fields take defaults
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.escalation.validate()?;
        if !(MIN_EMERGENCY_DELAY..=MAX_EMERGENCY_DELAY).contains(&self.emergency_delay) {
            return Err(WatchdogError::InvalidParameters(format!(
                "emergency delay {}s outside {}s..={}s",
                self.emergency_delay, MIN_EMERGENCY_DELAY, MAX_EMERGENCY_DELAY
            )));
        }
        Ok(())
    }
}
