// Escalation ladder
//
// Pure mapping from an operation's objection count to the delay tier and the
// number of explicit approvals needed before it may execute.

use crate::config::{HOUR, MAX_OBJECTIONS, MAX_TIER_DELAY, MIN_TIER_DELAY};
use crate::error::{Result, WatchdogError};
use serde::{Deserialize, Serialize};

pub const TIER_COUNT: usize = 4;

/// Tier from which approvals are demanded
pub const APPROVAL_TIER: u8 = 2;

/// Resolved escalation level for an objection count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationTier {
    /// Index into the ladder, 0..TIER_COUNT
    pub level: u8,
    /// Objection count at which this tier starts
    pub threshold: u32,
    /// Window length applied from the moment of the objection (seconds)
    pub delay: u64,
}

impl EscalationTier {
    pub fn requires_approval(&self) -> bool {
        self.level >= APPROVAL_TIER
    }
}

/// Tier thresholds and delays, owner-configurable within bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationLadder {
    pub thresholds: [u32; TIER_COUNT],
    pub delays: [u64; TIER_COUNT],
}

impl Default for EscalationLadder {
    fn default() -> Self {
        Self {
            thresholds: [0, 2, 3, 5],
            delays: [HOUR, 4 * HOUR, 12 * HOUR, 24 * HOUR],
        }
    }
}

impl EscalationLadder {
    /// Highest tier whose threshold is at or below `objections`
    pub fn tier(&self, objections: u32) -> EscalationTier {
        let level = (0..TIER_COUNT)
            .rev()
            .find(|&i| objections >= self.thresholds[i])
            .unwrap_or(0);

        EscalationTier {
            level: level as u8,
            threshold: self.thresholds[level],
            delay: self.delays[level],
        }
    }

    /// Window length for a freshly submitted operation
    pub fn initial_delay(&self) -> u64 {
        self.delays[0]
    }

    /// True when `objections` lands exactly on a tier boundary above tier 0
    pub fn crosses_threshold(&self, objections: u32) -> bool {
        objections > 0 && self.thresholds[1..].contains(&objections)
    }

    /// Approvals needed to execute after `objections`, given the live roster size
    ///
    /// - below tier 2: none, the challenge only delays
    /// - tier 2: max(3, 40% of roster) for rosters of 7+, otherwise 3
    /// - tier 3: strict majority of the roster
    pub fn required_approvals(&self, objections: u32, roster_size: usize) -> u32 {
        let roster = roster_size as u32;
        match self.tier(objections).level {
            0 | 1 => 0,
            2 => {
                if roster >= 7 {
                    (roster * 40 / 100).max(3)
                } else {
                    3
                }
            }
            _ => roster / 2 + 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.thresholds[0] != 0 {
            return Err(WatchdogError::InvalidParameters(
                "first escalation threshold must be 0".to_string(),
            ));
        }
        if !self.thresholds.windows(2).all(|w| w[0] < w[1]) {
            return Err(WatchdogError::InvalidParameters(
                "escalation thresholds must be strictly increasing".to_string(),
            ));
        }
        if self.thresholds[TIER_COUNT - 1] > MAX_OBJECTIONS {
            return Err(WatchdogError::InvalidParameters(format!(
                "highest escalation threshold exceeds objection cap {}",
                MAX_OBJECTIONS
            )));
        }
        if let Some(delay) = self
            .delays
            .iter()
            .find(|d| !(MIN_TIER_DELAY..=MAX_TIER_DELAY).contains(*d))
        {
            return Err(WatchdogError::InvalidParameters(format!(
                "tier delay {}s outside {}s..={}s",
                delay, MIN_TIER_DELAY, MAX_TIER_DELAY
            )));
        }
        if !self.delays.windows(2).all(|w| w[0] <= w[1]) {
            return Err(WatchdogError::InvalidParameters(
                "tier delays must be non-decreasing".to_string(),
            ));
        }
        Ok(())
    }
}
