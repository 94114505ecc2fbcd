// Multi-attester reserve oracle
//
// Attesters report observed balances per subject. Once enough fresh reports
// exist their bounded median becomes the subject's reserve balance and is
// published to the reserve ledger. Consensus values decay: past the staleness
// bound a subject is reported `Stale`, never zero.

use crate::collector::{Attestation, AttestationCollector};
use crate::config::{OracleConfig, MAX_BALANCE};
use crate::error::{OracleError, Result};
use crate::events::OracleEvent;
use crate::ledger::ReserveLedger;
use crate::resolver::{ConsensusResolver, RejectionReason, Resolution};
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use watchdog_consensus::{AccessControl, EventLog, Role};

/// Latest accepted consensus for a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveData {
    pub balance: U256,
    pub last_update: u64,
    pub participants: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveStatus {
    /// No consensus has ever been reached
    Unknown,
    Stale { balance: U256, age: u64 },
    Fresh { balance: U256 },
}

impl ReserveStatus {
    /// Balance usable for solvency decisions
    pub fn usable_balance(&self) -> Option<U256> {
        match self {
            ReserveStatus::Fresh { balance } => Some(*balance),
            _ => None,
        }
    }
}

/// Result of attempting consensus for a subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusOutcome {
    /// Below threshold; nothing attempted
    Awaiting { have: usize, need: usize },
    Reached(ReserveData),
    Rejected(RejectionReason),
    RateLimited { next_allowed: u64 },
}

pub struct ReserveOracle {
    config: OracleConfig,
    access: AccessControl,
    collector: AttestationCollector,
    reserves: HashMap<Address, ReserveData>,
    /// When the resolver last ran for each subject, accepted or not
    last_attempt: HashMap<Address, u64>,
    ledger: Arc<dyn ReserveLedger>,
    events: EventLog<OracleEvent>,
}

impl ReserveOracle {
    pub fn new(config: OracleConfig, admin: Address, ledger: Arc<dyn ReserveLedger>) -> Result<Self> {
        config.validate()?;
        info!(
            threshold = config.consensus_threshold,
            max_deviation_percent = config.max_deviation_percent,
            "Reserve oracle initialized"
        );
        Ok(Self {
            config,
            access: AccessControl::new(admin),
            collector: AttestationCollector::new(),
            reserves: HashMap::new(),
            last_attempt: HashMap::new(),
            ledger,
            events: EventLog::new(),
        })
    }

    /// Record an attestation and attempt consensus once the threshold is met
    ///
    /// The attestation is accepted whatever the consensus attempt yields.
    pub fn submit_attestation(
        &mut self,
        caller: Address,
        subject: Address,
        balance: U256,
        now: u64,
    ) -> Result<ConsensusOutcome> {
        self.access.require(Role::Attester, caller)?;
        if balance.is_zero() {
            return Err(OracleError::ZeroBalance);
        }
        if balance > U256::from(MAX_BALANCE) {
            return Err(OracleError::BalanceTooLarge { balance });
        }
        let timeout = self.config.attestation_timeout;
        self.collector.check_duplicate(subject, caller, now, timeout)?;

        self.prune_expired(subject, now);
        self.collector.insert(
            subject,
            Attestation {
                attester: caller,
                balance,
                timestamp: now,
            },
        );
        let pending = self.collector.fresh(subject, now, timeout).len();

        debug!(%subject, attester = %caller, %balance, pending, "Attestation submitted");
        self.events.emit(OracleEvent::AttestationSubmitted {
            subject,
            attester: caller,
            balance,
            pending,
        });

        if pending < self.config.consensus_threshold {
            return Ok(ConsensusOutcome::Awaiting {
                have: pending,
                need: self.config.consensus_threshold,
            });
        }
        Ok(self.attempt_consensus(subject, now))
    }

    /// Run the resolver on demand
    pub fn force_consensus_check(
        &mut self,
        caller: Address,
        subject: Address,
        now: u64,
    ) -> Result<ReserveData> {
        self.access.require(Role::Arbiter, caller)?;
        match self.attempt_consensus(subject, now) {
            ConsensusOutcome::Reached(data) => Ok(data),
            ConsensusOutcome::Rejected(reason) => Err(reason.into()),
            ConsensusOutcome::RateLimited { next_allowed } => Err(OracleError::RateLimited {
                subject,
                next_allowed,
            }),
            ConsensusOutcome::Awaiting { have, need } => {
                Err(OracleError::InsufficientAttestations { have, need })
            }
        }
    }

    /// Drop expired attestations for `subject`; anyone may call
    pub fn prune_expired(&mut self, subject: Address, now: u64) -> usize {
        let count = self
            .collector
            .prune_expired(subject, now, self.config.attestation_timeout);
        if count > 0 {
            self.events
                .emit(OracleEvent::AttestationsExpired { subject, count });
        }
        count
    }

    pub fn update_oracle_config(&mut self, caller: Address, config: OracleConfig) -> Result<()> {
        self.access.require(Role::Owner, caller)?;
        config.validate()?;
        self.config = config;
        info!(
            threshold = config.consensus_threshold,
            max_deviation_percent = config.max_deviation_percent,
            max_staleness = config.max_staleness,
            "Oracle configuration updated"
        );
        self.events.emit(OracleEvent::ConfigUpdated { config });
        Ok(())
    }

    pub fn grant_role(&mut self, caller: Address, role: Role, account: Address) -> Result<bool> {
        Ok(self.access.grant(caller, role, account)?)
    }

    pub fn revoke_role(&mut self, caller: Address, role: Role, account: Address) -> Result<bool> {
        Ok(self.access.revoke(caller, role, account)?)
    }

    // Queries

    pub fn pending_attestations(&self, subject: Address) -> Vec<Attestation> {
        self.collector.pending(subject)
    }

    pub fn reserve_data(&self, subject: Address) -> Option<&ReserveData> {
        self.reserves.get(&subject)
    }

    pub fn reserve_status(&self, subject: Address, now: u64) -> ReserveStatus {
        match self.reserves.get(&subject) {
            None => ReserveStatus::Unknown,
            Some(data) => {
                let age = now.saturating_sub(data.last_update);
                if age > self.config.max_staleness {
                    ReserveStatus::Stale {
                        balance: data.balance,
                        age,
                    }
                } else {
                    ReserveStatus::Fresh {
                        balance: data.balance,
                    }
                }
            }
        }
    }

    pub fn is_stale(&self, subject: Address, now: u64) -> bool {
        !matches!(self.reserve_status(subject, now), ReserveStatus::Fresh { .. })
    }

    pub fn has_role(&self, role: Role, account: Address) -> bool {
        self.access.has_role(role, account)
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Earliest time consensus may next be attempted for `subject`
    pub fn next_attempt_allowed(&self, subject: Address) -> Option<u64> {
        self.last_attempt
            .get(&subject)
            .map(|last| last.saturating_add(self.config.min_consensus_interval))
    }

    pub fn events(&self) -> &VecDeque<OracleEvent> {
        self.events.events()
    }

    pub fn take_events(&mut self) -> Vec<OracleEvent> {
        self.events.take()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<OracleEvent> {
        self.events.subscribe()
    }

    // Internals

    fn attempt_consensus(&mut self, subject: Address, now: u64) -> ConsensusOutcome {
        if let Some(next_allowed) = self.next_attempt_allowed(subject) {
            if now < next_allowed {
                debug!(%subject, next_allowed, "Consensus attempt rate limited");
                self.events.emit(OracleEvent::ConsensusDeferred {
                    subject,
                    next_allowed,
                });
                return ConsensusOutcome::RateLimited { next_allowed };
            }
        }

        let fresh = self
            .collector
            .fresh(subject, now, self.config.attestation_timeout);
        let resolver = ConsensusResolver::new(
            self.config.consensus_threshold,
            self.config.max_deviation_percent,
        );
        let resolution = resolver.resolve(&fresh);
        if !matches!(
            resolution,
            Err(RejectionReason::InsufficientAttestations { .. })
        ) {
            self.last_attempt.insert(subject, now);
        }
        let resolution = resolution.and_then(|Resolution { balance, participants }| {
            self.ledger
                .record_consensus_attestation(subject, balance, participants)
                .map(|()| (balance, participants))
                .map_err(|e| RejectionReason::LedgerRejected(e.to_string()))
        });

        match resolution {
            Ok((balance, participants)) => {
                let data = ReserveData {
                    balance,
                    last_update: now,
                    participants,
                };
                self.reserves.insert(subject, data);
                self.collector.clear(subject);

                info!(%subject, %balance, participants, "Reserve consensus reached");
                self.events.emit(OracleEvent::ConsensusReached {
                    subject,
                    balance,
                    participants,
                });
                ConsensusOutcome::Reached(data)
            }
            Err(reason) => {
                warn!(%subject, ?reason, "Reserve consensus rejected");
                self.events.emit(OracleEvent::ConsensusRejected {
                    subject,
                    reason: reason.clone(),
                });
                ConsensusOutcome::Rejected(reason)
            }
        }
    }
}
