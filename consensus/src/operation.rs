// Operation records for the optimistic consensus state machine
//
// An operation's lifecycle is held in a tagged [`OperationStatus`] so that
// "executed" and "challenged" can never disagree with the stored window.

use crate::crypto::{hash_fields, Hash};
use crate::dispatch::DispatchOutcome;
use crate::error::WatchdogError;
use crate::escalation::EscalationTier;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Privileged actions the committee can gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationType {
    ReserveAttestation,
    WalletRegistration,
    StatusChange,
    RedemptionFulfillment,
}

impl OperationType {
    pub const ALL: [OperationType; 4] = [
        OperationType::ReserveAttestation,
        OperationType::WalletRegistration,
        OperationType::StatusChange,
        OperationType::RedemptionFulfillment,
    ];

    /// Stable wire tag, also fed into identifiers and proposer selection
    pub fn tag(&self) -> u8 {
        match self {
            OperationType::ReserveAttestation => 0,
            OperationType::WalletRegistration => 1,
            OperationType::StatusChange => 2,
            OperationType::RedemptionFulfillment => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationType::ReserveAttestation => "RESERVE_ATTESTATION",
            OperationType::WalletRegistration => "WALLET_REGISTRATION",
            OperationType::StatusChange => "STATUS_CHANGE",
            OperationType::RedemptionFulfillment => "REDEMPTION_FULFILLMENT",
        }
    }
}

impl TryFrom<u8> for OperationType {
    type Error = WatchdogError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        OperationType::ALL
            .get(tag as usize)
            .copied()
            .ok_or(WatchdogError::UnknownOperationType(tag))
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which path carried an operation to execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionPath {
    Optimistic,
    Emergency { action_id: Hash },
}

/// Stored lifecycle of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Submitted, no objections
    Pending,
    /// At least one objection; `tier` reflects the current count
    Challenged { tier: EscalationTier },
    /// Terminal
    Executed {
        executed_at: u64,
        path: ExecutionPath,
        outcome: DispatchOutcome,
    },
}

/// Observable state at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Challenged { tier: EscalationTier },
    /// Window closed, not yet executed; approvals may still be outstanding
    Executable,
    Executed,
}

/// A proposed privileged action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Hash,
    pub operation_type: OperationType,
    pub payload: Vec<u8>,
    pub primary_validator: Address,
    pub submitted_at: u64,
    /// End of the challenge window; only ever moves forward
    pub finalized_at: u64,
    pub objection_count: u32,
    pub approval_count: u32,
    pub status: OperationStatus,
}

impl Operation {
    /// Content-derived identifier
    pub fn compute_id(
        operation_type: OperationType,
        payload: &[u8],
        proposer: Address,
        nonce: u64,
        submitted_at: u64,
    ) -> Hash {
        hash_fields(
            b"watchdog.operation",
            &[
                &[operation_type.tag()],
                payload,
                proposer.as_slice(),
                &nonce.to_le_bytes(),
                &submitted_at.to_le_bytes(),
            ],
        )
    }

    pub fn is_executed(&self) -> bool {
        matches!(self.status, OperationStatus::Executed { .. })
    }

    pub fn is_challenged(&self) -> bool {
        match &self.status {
            OperationStatus::Pending => false,
            OperationStatus::Challenged { .. } => true,
            OperationStatus::Executed { .. } => self.objection_count > 0,
        }
    }

    pub fn window_open(&self, now: u64) -> bool {
        now < self.finalized_at
    }

    pub fn state(&self, now: u64) -> OperationState {
        match &self.status {
            OperationStatus::Executed { .. } => OperationState::Executed,
            _ if !self.window_open(now) => OperationState::Executable,
            OperationStatus::Pending => OperationState::Pending,
            OperationStatus::Challenged { tier } => OperationState::Challenged { tier: *tier },
        }
    }

    pub fn outcome(&self) -> Option<&DispatchOutcome> {
        match &self.status {
            OperationStatus::Executed { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

/// A recorded objection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub challenger: Address,
    pub evidence: Vec<u8>,
    pub challenged_at: u64,
}
