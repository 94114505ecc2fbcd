// Primary validator selection
//
// Each operation has exactly one committee member allowed to propose it:
//
//   primary = roster[hash(entropy || type || payload) mod |roster|]
//
// The preferred entropy is a recent block commitment that the proposer could
// not know when preparing the payload. When no commitment is available (the
// window aged out or the source is cold) selection falls back to
// hash(now || local nonce), which is predictable to anyone who can read the
// nonce. The fallback keeps proposals live but is a LOWER-SECURITY mode: a
// member can grind payloads until they select themselves. Every selection
// reports which path it took so audits can flag fallback elections.

use crate::crypto::{hash_fields, Hash};
use crate::error::{Result, WatchdogError};
use crate::operation::OperationType;
use alloy_primitives::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of recent commitments kept available
pub const COMMITMENT_WINDOW: u64 = 256;

/// Source of unpredictable-at-submission entropy
pub trait EntropySource: Send + Sync {
    /// Latest usable commitment, `None` when unavailable
    fn commitment(&self) -> Option<Hash>;
}

/// Sliding window of recent block commitments
///
/// Commitments older than `capacity` heights behind the newest one are
/// no longer served.
#[derive(Debug)]
pub struct BlockCommitments {
    capacity: u64,
    window: RwLock<VecDeque<(u64, Hash)>>,
}

impl BlockCommitments {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            window: RwLock::new(VecDeque::new()),
        }
    }

    /// Record the commitment for `height` and age out entries that fell behind
    pub fn record(&self, height: u64, commitment: Hash) {
        let mut window = self.window.write();
        if window.back().map_or(false, |(h, _)| *h >= height) {
            return;
        }
        window.push_back((height, commitment));
        Self::prune(&mut window, height, self.capacity);
    }

    /// Advance the chain head without a new commitment
    pub fn advance_to(&self, height: u64) {
        Self::prune(&mut self.window.write(), height, self.capacity);
    }

    /// Commitment recorded for `height`, if still in the window
    pub fn at(&self, height: u64) -> Option<Hash> {
        self.window
            .read()
            .iter()
            .find(|(h, _)| *h == height)
            .map(|(_, c)| *c)
    }

    pub fn len(&self) -> usize {
        self.window.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.read().is_empty()
    }

    fn prune(window: &mut VecDeque<(u64, Hash)>, head: u64, capacity: u64) {
        while window
            .front()
            .map_or(false, |(h, _)| h.saturating_add(capacity) <= head)
        {
            window.pop_front();
        }
    }
}

impl Default for BlockCommitments {
    fn default() -> Self {
        Self::new(COMMITMENT_WINDOW)
    }
}

impl EntropySource for BlockCommitments {
    fn commitment(&self) -> Option<Hash> {
        self.window.read().back().map(|(_, c)| *c)
    }
}

/// Entropy path taken for a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntropyPath {
    /// Block commitment, unpredictable at payload preparation time
    Commitment,
    /// Time and local nonce; predictable, liveness only
    Fallback,
}

/// Result of a primary validator selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub validator: Address,
    pub index: usize,
    pub path: EntropyPath,
    pub seed: Hash,
}

/// Deterministic proposer selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSelector {
    /// Advances on every accepted submission; feeds the fallback seed
    nonce: u64,
}

impl ValidatorSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub(crate) fn advance(&mut self) {
        self.nonce = self.nonce.wrapping_add(1);
    }

    pub fn select(
        &self,
        roster: &[Address],
        operation_type: OperationType,
        payload: &[u8],
        now: u64,
        entropy: &dyn EntropySource,
    ) -> Result<Selection> {
        if roster.is_empty() {
            return Err(WatchdogError::EmptyRoster);
        }

        let (seed, path) = match entropy.commitment() {
            Some(commitment) => (
                hash_fields(
                    b"watchdog.select.commitment",
                    &[commitment.as_bytes(), &[operation_type.tag()], payload],
                ),
                EntropyPath::Commitment,
            ),
            None => (
                hash_fields(
                    b"watchdog.select.fallback",
                    &[
                        &now.to_le_bytes(),
                        &self.nonce.to_le_bytes(),
                        &[operation_type.tag()],
                        payload,
                    ],
                ),
                EntropyPath::Fallback,
            ),
        };

        let index = seed.reduce(roster.len());
        Ok(Selection {
            validator: roster[index],
            index,
            path,
            seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_data;

    struct NoEntropy;

    impl EntropySource for NoEntropy {
        fn commitment(&self) -> Option<Hash> {
            None
        }
    }

    fn roster(n: u8) -> Vec<Address> {
        (1..=n).map(Address::with_last_byte).collect()
    }

    #[test]
    fn test_selection_is_deterministic() {
        let commitments = BlockCommitments::default();
        commitments.record(10, hash_data(b"block10"));
        let selector = ValidatorSelector::new();
        let members = roster(5);

        let a = selector
            .select(&members, OperationType::StatusChange, b"payload", 100, &commitments)
            .unwrap();
        let b = selector
            .select(&members, OperationType::StatusChange, b"payload", 999, &commitments)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.path, EntropyPath::Commitment);
        assert_eq!(a.validator, members[a.index]);
    }

    #[test]
    fn test_selection_spreads_across_roster() {
        let commitments = BlockCommitments::default();
        commitments.record(1, hash_data(b"seed"));
        let selector = ValidatorSelector::new();
        let members = roster(5);

        let mut hit = std::collections::HashSet::new();
        for i in 0..200u32 {
            let s = selector
                .select(&members, OperationType::WalletRegistration, &i.to_le_bytes(), 0, &commitments)
                .unwrap();
            hit.insert(s.index);
        }
        assert_eq!(hit.len(), 5);
    }

    #[test]
    fn test_fallback_path_is_reported() {
        let mut selector = ValidatorSelector::new();
        let members = roster(7);

        let first = selector
            .select(&members, OperationType::StatusChange, b"p", 50, &NoEntropy)
            .unwrap();
        assert_eq!(first.path, EntropyPath::Fallback);

        let again = selector
            .select(&members, OperationType::StatusChange, b"p", 50, &NoEntropy)
            .unwrap();
        assert_eq!(first, again);

        selector.advance();
        let advanced = selector
            .select(&members, OperationType::StatusChange, b"p", 50, &NoEntropy)
            .unwrap();
        assert_ne!(first.seed, advanced.seed);
    }

    #[test]
    fn test_empty_roster_rejected() {
        let selector = ValidatorSelector::new();
        assert_eq!(
            selector.select(&[], OperationType::StatusChange, b"p", 0, &NoEntropy),
            Err(WatchdogError::EmptyRoster)
        );
    }

    #[test]
    fn test_commitments_age_out() {
        let commitments = BlockCommitments::new(4);
        commitments.record(1, hash_data(b"1"));
        commitments.record(2, hash_data(b"2"));
        assert_eq!(commitments.commitment(), Some(hash_data(b"2")));
        assert_eq!(commitments.at(1), Some(hash_data(b"1")));

        commitments.advance_to(5);
        assert_eq!(commitments.at(1), None);
        assert_eq!(commitments.commitment(), Some(hash_data(b"2")));

        commitments.advance_to(6);
        assert!(commitments.is_empty());
        assert_eq!(commitments.commitment(), None);
    }

    #[test]
    fn test_commitments_ignore_stale_heights() {
        let commitments = BlockCommitments::new(4);
        commitments.record(5, hash_data(b"5"));
        commitments.record(3, hash_data(b"3"));
        assert_eq!(commitments.len(), 1);
        assert_eq!(commitments.commitment(), Some(hash_data(b"5")));
    }
}
