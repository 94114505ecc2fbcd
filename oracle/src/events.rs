// Reserve oracle events

use crate::config::OracleConfig;
use crate::resolver::RejectionReason;
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleEvent {
    AttestationSubmitted {
        subject: Address,
        attester: Address,
        balance: U256,
        pending: usize,
    },
    AttestationsExpired {
        subject: Address,
        count: usize,
    },
    ConsensusReached {
        subject: Address,
        balance: U256,
        participants: usize,
    },
    ConsensusRejected {
        subject: Address,
        reason: RejectionReason,
    },
    ConsensusDeferred {
        subject: Address,
        next_allowed: u64,
    },
    ConfigUpdated {
        config: OracleConfig,
    },
}
