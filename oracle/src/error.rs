// Reserve oracle errors

use alloy_primitives::{Address, U256};
use thiserror::Error;
use watchdog_consensus::{ErrorKind, WatchdogError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error(transparent)]
    Access(#[from] WatchdogError),

    #[error("Attested balance must be non-zero")]
    ZeroBalance,

    #[error("Attested balance {balance} exceeds maximum")]
    BalanceTooLarge { balance: U256 },

    #[error("Attester {attester} already has a pending attestation for {subject}")]
    DuplicateAttestation { attester: Address, subject: Address },

    #[error("Insufficient fresh attestations: have {have}, need {need}")]
    InsufficientAttestations { have: usize, need: usize },

    #[error("Attestation {outlier} deviates {deviation_percent}% from median {median}")]
    ExcessiveDeviation {
        outlier: U256,
        median: U256,
        deviation_percent: U256,
    },

    #[error("Consensus for {subject} rate limited until {next_allowed}")]
    RateLimited { subject: Address, next_allowed: u64 },

    #[error("Reserve ledger rejected update: {0}")]
    Ledger(String),

    #[error("Invalid oracle configuration: {0}")]
    InvalidConfig(String),
}

impl OracleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OracleError::Access(e) => e.kind(),
            OracleError::InsufficientAttestations { .. } | OracleError::ExcessiveDeviation { .. } => {
                ErrorKind::ConsensusInsufficient
            }
            OracleError::RateLimited { .. } => ErrorKind::Temporal,
            _ => ErrorKind::Invariant,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Temporal
    }
}

pub type Result<T> = std::result::Result<T, OracleError>;
