// Reserve ledger boundary
//
// Accepted consensus balances are published to an external ledger that
// downstream solvency checks read.

use alloy_primitives::{Address, U256};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Subject not registered: {0}")]
    UnknownSubject(Address),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

pub trait ReserveLedger: Send + Sync {
    fn record_consensus_attestation(
        &self,
        subject: Address,
        balance: U256,
        participants: usize,
    ) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub balance: U256,
    pub participants: usize,
}

/// Ledger kept in memory, optionally restricted to registered subjects
#[derive(Debug, Default)]
pub struct InMemoryReserveLedger {
    entries: RwLock<HashMap<Address, Vec<LedgerEntry>>>,
    registered: RwLock<Option<Vec<Address>>>,
}

impl InMemoryReserveLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept updates for registered subjects from now on
    pub fn register(&self, subject: Address) {
        self.registered
            .write()
            .get_or_insert_with(Vec::new)
            .push(subject);
    }

    pub fn latest(&self, subject: Address) -> Option<LedgerEntry> {
        self.entries
            .read()
            .get(&subject)
            .and_then(|history| history.last().copied())
    }

    pub fn history(&self, subject: Address) -> Vec<LedgerEntry> {
        self.entries
            .read()
            .get(&subject)
            .cloned()
            .unwrap_or_default()
    }
}

impl ReserveLedger for InMemoryReserveLedger {
    fn record_consensus_attestation(
        &self,
        subject: Address,
        balance: U256,
        participants: usize,
    ) -> Result<(), LedgerError> {
        if let Some(registered) = self.registered.read().as_ref() {
            if !registered.contains(&subject) {
                return Err(LedgerError::UnknownSubject(subject));
            }
        }
        self.entries
            .write()
            .entry(subject)
            .or_default()
            .push(LedgerEntry {
                balance,
                participants,
            });
        Ok(())
    }
}
