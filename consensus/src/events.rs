// Consensus events
//
// Every accepted state transition emits one or more events. Events are kept
// in a bounded in-memory log and optionally forwarded to a subscriber channel
// for off-chain monitoring. The log itself is shared with the reserve oracle.

use crate::crypto::Hash;
use crate::escalation::EscalationLadder;
use crate::operation::OperationType;
use crate::selector::EntropyPath;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Events retained in memory before the oldest are dropped
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchdogEvent {
    WatchdogAdded {
        watchdog: Address,
        roster_size: usize,
    },
    WatchdogRemoved {
        watchdog: Address,
        reason: String,
        roster_size: usize,
    },
    ProposerSelected {
        operation_id: Hash,
        proposer: Address,
        path: EntropyPath,
    },
    OperationSubmitted {
        operation_id: Hash,
        operation_type: OperationType,
        proposer: Address,
        finalized_at: u64,
    },
    OperationChallenged {
        operation_id: Hash,
        challenger: Address,
        objection_count: u32,
        finalized_at: u64,
    },
    EscalationTriggered {
        operation_id: Hash,
        level: u8,
        objection_count: u32,
        required_approvals: u32,
    },
    OperationApproved {
        operation_id: Hash,
        approver: Address,
        approval_count: u32,
    },
    OperationExecuted {
        operation_id: Hash,
        executor: Address,
        success: bool,
    },
    EmergencyScheduled {
        action_id: Hash,
        operation_id: Hash,
        proposer: Address,
        scheduled_time: u64,
    },
    EmergencyExecuted {
        action_id: Hash,
        operation_id: Hash,
        success: bool,
    },
    EmergencyCancelled {
        action_id: Hash,
        operation_id: Hash,
    },
    ParametersUpdated {
        escalation: EscalationLadder,
        emergency_delay: u64,
    },
    Paused {
        by: Address,
    },
    Unpaused {
        by: Address,
    },
}

/// Bounded event log with an optional live subscriber
///
/// Once `capacity` events are held the oldest is dropped for each new one.
/// The subscriber sees every event regardless.
#[derive(Debug)]
pub struct EventLog<E> {
    events: VecDeque<E>,
    capacity: usize,
    subscriber: Option<mpsc::UnboundedSender<E>>,
}

impl<E> Default for EventLog<E> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E> EventLog<E> {
    /// A capacity of zero keeps nothing in memory
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            subscriber: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<E: Clone> EventLog<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, event: E) {
        if let Some(tx) = &self.subscriber {
            if tx.send(event.clone()).is_err() {
                // Receiver dropped
                self.subscriber = None;
            }
        }
        if self.capacity == 0 {
            return;
        }
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Replace the subscriber and return the receiving end
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    /// Retained events, oldest first
    pub fn events(&self) -> &VecDeque<E> {
        &self.events
    }

    /// Drain everything retained so far
    pub fn take(&mut self) -> Vec<E> {
        self.events.drain(..).collect()
    }
}
