// Error taxonomy for the watchdog consensus layer
//
// Every precondition failure is a named variant so callers can tell
// "retry later" apart from "never valid".

use crate::access::Role;
use crate::crypto::Hash;
use alloy_primitives::Address;
use thiserror::Error;

/// Broad classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller lacks membership, role, or proposer rights
    Authorization,
    /// Request can never succeed as submitted
    Invariant,
    /// Request may succeed after time passes or other parties act
    Temporal,
    /// Not enough agreeing observations to derive a value
    ConsensusInsufficient,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchdogError {
    // Authorization
    #[error("{0} is not an active watchdog")]
    NotWatchdog(Address),

    #[error("{caller} is not the primary validator (expected {expected})")]
    NotPrimaryValidator { caller: Address, expected: Address },

    #[error("{caller} lacks the {role:?} role")]
    MissingRole { caller: Address, role: Role },

    #[error("Re-entrant call rejected while a dispatch is in flight")]
    Reentrant,

    // Invariant
    #[error("{0} is already a watchdog")]
    AlreadyWatchdog(Address),

    #[error("{0} is not an externally owned identity")]
    NotExternallyOwned(Address),

    #[error("Roster is full (max {max})")]
    RosterFull { max: usize },

    #[error("Removal would breach minimum roster size {min}")]
    RosterMinimum { min: usize },

    #[error("Watchdog roster is empty")]
    EmptyRoster,

    #[error("A non-empty reason is required")]
    ReasonRequired,

    #[error("Reason too long: {len} > {max}")]
    ReasonTooLong { len: usize, max: usize },

    #[error("Unknown operation type: {0}")]
    UnknownOperationType(u8),

    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Evidence is empty")]
    EmptyEvidence,

    #[error("Evidence too large: {len} > {max}")]
    EvidenceTooLarge { len: usize, max: usize },

    #[error("Operation not found: {0}")]
    OperationNotFound(Hash),

    #[error("Operation already exists: {0}")]
    DuplicateOperation(Hash),

    #[error("{0} already challenged this operation")]
    AlreadyChallenged(Address),

    #[error("{0} already approved this operation")]
    AlreadyApproved(Address),

    #[error("Objection cap of {max} reached")]
    ObjectionCapReached { max: u32 },

    #[error("Operation was never challenged")]
    NotChallenged,

    #[error("Emergency action not found: {0}")]
    EmergencyActionNotFound(Hash),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    // Temporal
    #[error("Consensus is paused")]
    Paused,

    #[error("Challenge window open until {finalized_at}")]
    WindowOpen { finalized_at: u64 },

    #[error("Challenge window closed at {finalized_at}")]
    WindowClosed { finalized_at: u64 },

    #[error("Operation already executed: {0}")]
    AlreadyExecuted(Hash),

    #[error("Insufficient approvals: {have} < {need}")]
    InsufficientApprovals { have: u32, need: u32 },

    #[error("Emergency timelock active until {ready_at}")]
    TimelockActive { ready_at: u64 },

    #[error("Emergency action already executed: {0}")]
    EmergencyAlreadyExecuted(Hash),
}

impl WatchdogError {
    pub fn kind(&self) -> ErrorKind {
        use WatchdogError::*;
        match self {
            NotWatchdog(_) | NotPrimaryValidator { .. } | MissingRole { .. } | Reentrant => {
                ErrorKind::Authorization
            }
            Paused
            | WindowOpen { .. }
            | WindowClosed { .. }
            | AlreadyExecuted(_)
            | InsufficientApprovals { .. }
            | TimelockActive { .. }
            | EmergencyAlreadyExecuted(_) => ErrorKind::Temporal,
            _ => ErrorKind::Invariant,
        }
    }

    /// Whether waiting (never an immediate retry) may make the call succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Temporal
    }
}

pub type Result<T> = std::result::Result<T, WatchdogError>;
