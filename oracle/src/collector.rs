// Attestation collection
//
// Keeps at most one pending attestation per (subject, attester). Attestations
// older than the configured timeout are no longer fresh and are pruned lazily
// the next time the subject is touched.

use crate::error::{OracleError, Result};
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub attester: Address,
    pub balance: U256,
    pub timestamp: u64,
}

impl Attestation {
    /// Usable at `now` under `timeout`
    pub fn is_fresh(&self, now: u64, timeout: u64) -> bool {
        now.saturating_sub(self.timestamp) <= timeout
    }
}

#[derive(Debug, Clone, Default)]
pub struct AttestationCollector {
    pending: HashMap<Address, BTreeMap<Address, Attestation>>,
}

impl AttestationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if `attester` already holds a fresh attestation for `subject`
    pub fn check_duplicate(
        &self,
        subject: Address,
        attester: Address,
        now: u64,
        timeout: u64,
    ) -> Result<()> {
        let existing = self
            .pending
            .get(&subject)
            .and_then(|by_attester| by_attester.get(&attester));
        match existing {
            Some(a) if a.is_fresh(now, timeout) => {
                Err(OracleError::DuplicateAttestation { attester, subject })
            }
            _ => Ok(()),
        }
    }

    /// Record an attestation, replacing an expired one from the same attester
    pub fn insert(&mut self, subject: Address, attestation: Attestation) {
        self.pending
            .entry(subject)
            .or_default()
            .insert(attestation.attester, attestation);
    }

    /// Drop expired attestations for `subject`; returns how many were removed
    pub fn prune_expired(&mut self, subject: Address, now: u64, timeout: u64) -> usize {
        let Some(by_attester) = self.pending.get_mut(&subject) else {
            return 0;
        };
        let before = by_attester.len();
        by_attester.retain(|_, a| a.is_fresh(now, timeout));
        let removed = before - by_attester.len();
        if by_attester.is_empty() {
            self.pending.remove(&subject);
        }
        if removed > 0 {
            debug!(%subject, removed, "Pruned expired attestations");
        }
        removed
    }

    /// Fresh attestations for `subject`, ordered by attester
    pub fn fresh(&self, subject: Address, now: u64, timeout: u64) -> Vec<Attestation> {
        self.pending
            .get(&subject)
            .map(|by_attester| {
                by_attester
                    .values()
                    .filter(|a| a.is_fresh(now, timeout))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Everything held for `subject`, fresh or not
    pub fn pending(&self, subject: Address) -> Vec<Attestation> {
        self.pending
            .get(&subject)
            .map(|by_attester| by_attester.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self, subject: Address) -> usize {
        self.pending.remove(&subject).map_or(0, |m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: u64 = 6 * 3600;

    fn attestation(attester: u8, balance: u64, timestamp: u64) -> Attestation {
        Attestation {
            attester: Address::with_last_byte(attester),
            balance: U256::from(balance),
            timestamp,
        }
    }

    #[test]
    fn test_freshness_boundary() {
        let a = attestation(1, 100, 1_000);
        assert!(a.is_fresh(1_000 + TIMEOUT, TIMEOUT));
        assert!(!a.is_fresh(1_001 + TIMEOUT, TIMEOUT));
    }

    #[test]
    fn test_duplicate_only_while_fresh() {
        let subject = Address::with_last_byte(0x50);
        let mut collector = AttestationCollector::new();
        collector.insert(subject, attestation(1, 100, 0));

        assert_eq!(
            collector.check_duplicate(subject, Address::with_last_byte(1), 10, TIMEOUT),
            Err(OracleError::DuplicateAttestation {
                attester: Address::with_last_byte(1),
                subject
            })
        );
        assert!(collector
            .check_duplicate(subject, Address::with_last_byte(1), TIMEOUT + 1, TIMEOUT)
            .is_ok());
        assert!(collector
            .check_duplicate(subject, Address::with_last_byte(2), 10, TIMEOUT)
            .is_ok());
    }

    #[test]
    fn test_prune_and_fresh() {
        let subject = Address::with_last_byte(0x50);
        let mut collector = AttestationCollector::new();
        collector.insert(subject, attestation(1, 100, 0));
        collector.insert(subject, attestation(2, 101, 5 * 3600));

        let now = 7 * 3600;
        assert_eq!(collector.fresh(subject, now, TIMEOUT).len(), 1);
        assert_eq!(collector.pending(subject).len(), 2);
        assert_eq!(collector.prune_expired(subject, now, TIMEOUT), 1);
        assert_eq!(collector.pending(subject).len(), 1);
        assert_eq!(collector.clear(subject), 1);
        assert!(collector.pending(subject).is_empty());
    }
}
