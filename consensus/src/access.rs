// Capability roles for privileged entry points

use crate::error::{Result, WatchdogError};
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Capability roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Governs parameters, pause switch and role assignment
    Owner,
    /// Adds and removes watchdogs
    Manager,
    /// Schedules, executes and cancels emergency actions
    Emergency,
    /// Submits reserve attestations
    Attester,
    /// Forces reserve consensus checks
    Arbiter,
}

/// Role assignments keyed by role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    grants: BTreeMap<Role, BTreeSet<Address>>,
}

impl AccessControl {
    /// Create with `admin` holding every role
    pub fn new(admin: Address) -> Self {
        let mut access = Self::default();
        for role in [
            Role::Owner,
            Role::Manager,
            Role::Emergency,
            Role::Attester,
            Role::Arbiter,
        ] {
            access.grants.entry(role).or_default().insert(admin);
        }
        access
    }

    pub fn has_role(&self, role: Role, account: Address) -> bool {
        self.grants
            .get(&role)
            .map(|holders| holders.contains(&account))
            .unwrap_or(false)
    }

    /// Fail with `MissingRole` unless `caller` holds `role`
    pub fn require(&self, role: Role, caller: Address) -> Result<()> {
        if self.has_role(role, caller) {
            Ok(())
        } else {
            Err(WatchdogError::MissingRole { caller, role })
        }
    }

    /// Grant `role` to `account`; only an owner may do this
    pub fn grant(&mut self, caller: Address, role: Role, account: Address) -> Result<bool> {
        self.require(Role::Owner, caller)?;
        let added = self.grants.entry(role).or_default().insert(account);
        if added {
            info!(?role, %account, "Role granted");
        }
        Ok(added)
    }

    /// Revoke `role` from `account`; the last owner cannot be removed
    pub fn revoke(&mut self, caller: Address, role: Role, account: Address) -> Result<bool> {
        self.require(Role::Owner, caller)?;
        if role == Role::Owner && self.holders(Role::Owner).count() == 1
            && self.has_role(Role::Owner, account)
        {
            return Err(WatchdogError::InvalidParameters(
                "cannot revoke the last owner".to_string(),
            ));
        }
        let removed = self
            .grants
            .get_mut(&role)
            .map(|holders| holders.remove(&account))
            .unwrap_or(false);
        if removed {
            info!(?role, %account, "Role revoked");
        }
        Ok(removed)
    }

    pub fn holders(&self, role: Role) -> impl Iterator<Item = &Address> {
        self.grants.get(&role).into_iter().flatten()
    }
}
