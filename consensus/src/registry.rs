// Watchdog roster
//
// Canonical committee membership. Members live in a dense vector with an
// address -> index map so that lookup, insertion and removal are all O(1);
// removal swaps the last member into the vacated slot.

use crate::config::{MAX_REASON_LENGTH, MAX_WATCHDOGS, MIN_WATCHDOGS};
use crate::error::{Result, WatchdogError};
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Tells externally owned identities apart from delegated contract identities
pub trait AccountInspector: Send + Sync {
    fn is_contract(&self, account: Address) -> bool;
}

/// Inspector that treats every account as externally owned
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternallyOwned;

impl AccountInspector for ExternallyOwned {
    fn is_contract(&self, _account: Address) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogRegistry {
    /// Identity of the consensus instance itself, never admissible
    self_address: Address,
    members: Vec<Address>,
    #[serde(skip)]
    index: HashMap<Address, usize>,
}

impl WatchdogRegistry {
    pub fn new(self_address: Address) -> Self {
        Self {
            self_address,
            members: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuild the index after deserialization
    pub(crate) fn reindex(&mut self) {
        self.index = self
            .members
            .iter()
            .enumerate()
            .map(|(i, member)| (*member, i))
            .collect();
    }

    pub fn add(&mut self, candidate: Address, inspector: &dyn AccountInspector) -> Result<usize> {
        if self.index.contains_key(&candidate) {
            return Err(WatchdogError::AlreadyWatchdog(candidate));
        }
        if self.members.len() >= MAX_WATCHDOGS {
            return Err(WatchdogError::RosterFull { max: MAX_WATCHDOGS });
        }
        if candidate == Address::ZERO
            || candidate == self.self_address
            || inspector.is_contract(candidate)
        {
            return Err(WatchdogError::NotExternallyOwned(candidate));
        }

        self.index.insert(candidate, self.members.len());
        self.members.push(candidate);

        info!(watchdog = %candidate, size = self.members.len(), "Watchdog added");
        Ok(self.members.len())
    }

    pub fn remove(&mut self, member: Address, reason: &str) -> Result<usize> {
        let position = *self
            .index
            .get(&member)
            .ok_or(WatchdogError::NotWatchdog(member))?;
        if self.members.len() <= MIN_WATCHDOGS {
            return Err(WatchdogError::RosterMinimum { min: MIN_WATCHDOGS });
        }
        if reason.trim().is_empty() {
            return Err(WatchdogError::ReasonRequired);
        }
        if reason.len() > MAX_REASON_LENGTH {
            return Err(WatchdogError::ReasonTooLong {
                len: reason.len(),
                max: MAX_REASON_LENGTH,
            });
        }

        self.members.swap_remove(position);
        self.index.remove(&member);
        if let Some(moved) = self.members.get(position) {
            self.index.insert(*moved, position);
        }

        info!(watchdog = %member, reason, size = self.members.len(), "Watchdog removed");
        Ok(self.members.len())
    }

    pub fn contains(&self, account: Address) -> bool {
        self.index.contains_key(&account)
    }

    /// Fail with `NotWatchdog` unless `account` is active
    pub fn require_member(&self, account: Address) -> Result<()> {
        if self.contains(account) {
            Ok(())
        } else {
            Err(WatchdogError::NotWatchdog(account))
        }
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }

    pub fn get(&self, position: usize) -> Option<Address> {
        self.members.get(position).copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn self_address(&self) -> Address {
        self.self_address
    }
}
