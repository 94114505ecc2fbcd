// Emergency override path
//
// A timelocked bypass of the optimistic challenge window for active-threat
// response. The delay is short compared to the escalation ladder but never
// zero, so emergency power stays attributable and cancellable.

use crate::config::{MAX_REASON_LENGTH, MAX_EMERGENCY_DELAY, MIN_EMERGENCY_DELAY};
use crate::crypto::{hash_fields, Hash};
use crate::error::{Result, WatchdogError};
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyAction {
    pub id: Hash,
    pub operation_id: Hash,
    pub reason: String,
    pub proposer: Address,
    /// Earliest execution time
    pub scheduled_time: u64,
    pub executed: bool,
}

/// Pending and executed emergency actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyOverride {
    actions: BTreeMap<Hash, EmergencyAction>,
    nonce: u64,
    delay: u64,
}

impl EmergencyOverride {
    pub fn new(delay: u64) -> Self {
        Self {
            actions: BTreeMap::new(),
            nonce: 0,
            delay,
        }
    }

    pub fn delay(&self) -> u64 {
        self.delay
    }

    pub(crate) fn set_delay(&mut self, delay: u64) -> Result<()> {
        if !(MIN_EMERGENCY_DELAY..=MAX_EMERGENCY_DELAY).contains(&delay) {
            return Err(WatchdogError::InvalidParameters(format!(
                "emergency delay {}s outside {}s..={}s",
                delay, MIN_EMERGENCY_DELAY, MAX_EMERGENCY_DELAY
            )));
        }
        self.delay = delay;
        Ok(())
    }

    /// Validate the reason; called before anything is recorded
    pub fn check_reason(reason: &str) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(WatchdogError::ReasonRequired);
        }
        if reason.len() > MAX_REASON_LENGTH {
            return Err(WatchdogError::ReasonTooLong {
                len: reason.len(),
                max: MAX_REASON_LENGTH,
            });
        }
        Ok(())
    }

    /// Record a new action; the caller has already checked role and operation
    pub(crate) fn schedule(
        &mut self,
        operation_id: Hash,
        reason: &str,
        proposer: Address,
        now: u64,
    ) -> Result<EmergencyAction> {
        Self::check_reason(reason)?;

        let id = hash_fields(
            b"watchdog.emergency",
            &[
                operation_id.as_bytes(),
                reason.as_bytes(),
                proposer.as_slice(),
                &now.to_le_bytes(),
                &self.nonce.to_le_bytes(),
            ],
        );
        if self.actions.contains_key(&id) {
            return Err(WatchdogError::InvalidParameters(format!(
                "emergency action {} already scheduled",
                id
            )));
        }

        let action = EmergencyAction {
            id,
            operation_id,
            reason: reason.to_string(),
            proposer,
            scheduled_time: now.saturating_add(self.delay),
            executed: false,
        };
        self.nonce = self.nonce.wrapping_add(1);
        self.actions.insert(id, action.clone());

        info!(
            action = %id,
            operation = %operation_id,
            scheduled_time = action.scheduled_time,
            "Emergency action scheduled"
        );
        Ok(action)
    }

    /// The action if it exists, is unexecuted and its timelock has elapsed
    pub fn ready(&self, action_id: Hash, now: u64) -> Result<&EmergencyAction> {
        let action = self
            .actions
            .get(&action_id)
            .ok_or(WatchdogError::EmergencyActionNotFound(action_id))?;
        if action.executed {
            return Err(WatchdogError::EmergencyAlreadyExecuted(action_id));
        }
        if now < action.scheduled_time {
            return Err(WatchdogError::TimelockActive {
                ready_at: action.scheduled_time,
            });
        }
        Ok(action)
    }

    pub(crate) fn mark_executed(&mut self, action_id: Hash) {
        if let Some(action) = self.actions.get_mut(&action_id) {
            action.executed = true;
        }
    }

    /// Remove a pending action entirely
    pub(crate) fn cancel(&mut self, action_id: Hash) -> Result<EmergencyAction> {
        match self.actions.get(&action_id) {
            None => return Err(WatchdogError::EmergencyActionNotFound(action_id)),
            Some(action) if action.executed => {
                return Err(WatchdogError::EmergencyAlreadyExecuted(action_id))
            }
            Some(_) => {}
        }
        let action = self
            .actions
            .remove(&action_id)
            .ok_or(WatchdogError::EmergencyActionNotFound(action_id))?;
        info!(action = %action_id, operation = %action.operation_id, "Emergency action cancelled");
        Ok(action)
    }

    pub fn get(&self, action_id: &Hash) -> Option<&EmergencyAction> {
        self.actions.get(action_id)
    }

    /// Unexecuted actions, oldest schedule first
    pub fn pending(&self) -> Vec<&EmergencyAction> {
        let mut pending: Vec<_> = self.actions.values().filter(|a| !a.executed).collect();
        pending.sort_by_key(|a| a.scheduled_time);
        pending
    }
}
