// Watchdog operation consensus engine
//
// Optimistic execution state machine:
//
//   NonExistent -> Pending -> (Challenged)* -> Executable -> Executed
//
// A committee member selected as primary submits an operation, which opens a
// challenge window. Objections consult the escalation ladder to lengthen the
// window and, from tier 2 upward, demand explicit approvals. Once the window
// has closed (and approvals are satisfied) anyone may execute, which hands the
// payload to the handler for its type exactly once. The emergency path can
// execute an operation early after its own timelock.
//
// Every entry point validates all preconditions before mutating anything, so
// a failed call leaves no trace.

use crate::access::{AccessControl, Role};
use crate::config::{
    WatchdogConfig, MAX_EVIDENCE_LENGTH, MAX_OBJECTIONS, MAX_PAYLOAD_LENGTH, MIN_WATCHDOGS,
};
use crate::crypto::Hash;
use crate::dispatch::{DispatchOutcome, HandlerRegistry, OperationHandler};
use crate::emergency::{EmergencyAction, EmergencyOverride};
use crate::error::{Result, WatchdogError};
use crate::events::{EventLog, WatchdogEvent};
use crate::operation::{
    Challenge, ExecutionPath, Operation, OperationState, OperationStatus, OperationType,
};
use crate::registry::{AccountInspector, ExternallyOwned, WatchdogRegistry};
use crate::selector::{EntropyPath, EntropySource, Selection, ValidatorSelector};
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Serializable image of the engine's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusSnapshot {
    pub config: WatchdogConfig,
    pub access: AccessControl,
    pub registry: WatchdogRegistry,
    pub selector: ValidatorSelector,
    pub operations: BTreeMap<Hash, Operation>,
    pub challenges: BTreeMap<Hash, Vec<Challenge>>,
    pub approvals: BTreeMap<Hash, BTreeSet<Address>>,
    pub emergency: EmergencyOverride,
    pub paused: bool,
}

pub struct WatchdogConsensus {
    config: WatchdogConfig,
    access: AccessControl,
    registry: WatchdogRegistry,
    selector: ValidatorSelector,
    operations: BTreeMap<Hash, Operation>,
    challenges: BTreeMap<Hash, Vec<Challenge>>,
    approvals: BTreeMap<Hash, BTreeSet<Address>>,
    emergency: EmergencyOverride,
    paused: bool,
    handlers: HandlerRegistry,
    entropy: Arc<dyn EntropySource>,
    inspector: Arc<dyn AccountInspector>,
    events: EventLog<WatchdogEvent>,
    /// Operations changed since the last persisted snapshot
    touched: BTreeSet<Hash>,
}

/// An operation marked executed whose handler has not run yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDispatch {
    operation_id: Hash,
    operation_type: OperationType,
    payload: Vec<u8>,
    executor: Address,
    path: ExecutionPath,
}

impl PendingDispatch {
    pub fn operation_id(&self) -> Hash {
        self.operation_id
    }

    pub fn path(&self) -> ExecutionPath {
        self.path
    }
}

impl WatchdogConsensus {
    /// Create an engine with an initial committee
    ///
    /// `admin` receives every role; `self_address` is the identity of this
    /// consensus instance and can never join the committee.
    pub fn new(
        config: WatchdogConfig,
        admin: Address,
        self_address: Address,
        watchdogs: &[Address],
        entropy: Arc<dyn EntropySource>,
    ) -> Result<Self> {
        config.validate()?;

        let inspector: Arc<dyn AccountInspector> = Arc::new(ExternallyOwned);
        let mut registry = WatchdogRegistry::new(self_address);
        for watchdog in watchdogs {
            registry.add(*watchdog, inspector.as_ref())?;
        }
        if registry.len() < MIN_WATCHDOGS {
            return Err(WatchdogError::InvalidParameters(format!(
                "initial committee of {} is below minimum {}",
                registry.len(),
                MIN_WATCHDOGS
            )));
        }

        info!(
            watchdogs = registry.len(),
            emergency_delay = config.emergency_delay,
            "Watchdog consensus initialized"
        );

        Ok(Self {
            emergency: EmergencyOverride::new(config.emergency_delay),
            config,
            access: AccessControl::new(admin),
            registry,
            selector: ValidatorSelector::new(),
            operations: BTreeMap::new(),
            challenges: BTreeMap::new(),
            approvals: BTreeMap::new(),
            paused: false,
            handlers: HandlerRegistry::new(),
            entropy,
            inspector,
            events: EventLog::new(),
            touched: BTreeSet::new(),
        })
    }

    /// Rebuild an engine from a snapshot; handlers must be registered again
    pub fn restore(snapshot: ConsensusSnapshot, entropy: Arc<dyn EntropySource>) -> Result<Self> {
        snapshot.config.validate()?;
        let mut registry = snapshot.registry;
        registry.reindex();

        info!(
            operations = snapshot.operations.len(),
            watchdogs = registry.len(),
            "Watchdog consensus restored from snapshot"
        );

        Ok(Self {
            config: snapshot.config,
            access: snapshot.access,
            registry,
            selector: snapshot.selector,
            operations: snapshot.operations,
            challenges: snapshot.challenges,
            approvals: snapshot.approvals,
            emergency: snapshot.emergency,
            paused: snapshot.paused,
            handlers: HandlerRegistry::new(),
            entropy,
            inspector: Arc::new(ExternallyOwned),
            events: EventLog::new(),
            touched: BTreeSet::new(),
        })
    }

    pub fn snapshot(&self) -> ConsensusSnapshot {
        ConsensusSnapshot {
            config: self.config,
            access: self.access.clone(),
            registry: self.registry.clone(),
            selector: self.selector.clone(),
            operations: self.operations.clone(),
            challenges: self.challenges.clone(),
            approvals: self.approvals.clone(),
            emergency: self.emergency.clone(),
            paused: self.paused,
        }
    }

    /// Working copy sharing handlers, entropy and inspector
    ///
    /// The copy starts with an empty, unsubscribed event log; `commit` moves
    /// its state and events back into this engine.
    pub(crate) fn stage(&self) -> Self {
        Self {
            config: self.config,
            access: self.access.clone(),
            registry: self.registry.clone(),
            selector: self.selector.clone(),
            operations: self.operations.clone(),
            challenges: self.challenges.clone(),
            approvals: self.approvals.clone(),
            emergency: self.emergency.clone(),
            paused: self.paused,
            handlers: self.handlers.clone(),
            entropy: self.entropy.clone(),
            inspector: self.inspector.clone(),
            events: EventLog::new(),
            touched: BTreeSet::new(),
        }
    }

    /// Adopt the state of a staged copy and publish the events it logged
    pub(crate) fn commit(&mut self, mut staged: Self) {
        self.config = staged.config;
        self.access = staged.access;
        self.registry = staged.registry;
        self.selector = staged.selector;
        self.operations = staged.operations;
        self.challenges = staged.challenges;
        self.approvals = staged.approvals;
        self.emergency = staged.emergency;
        self.paused = staged.paused;
        self.touched.extend(staged.touched);
        for event in staged.events.take() {
            self.events.emit(event);
        }
    }

    /// Ids of operations changed since the last `clear_touched`
    pub(crate) fn touched(&self) -> Vec<Hash> {
        self.touched.iter().copied().collect()
    }

    pub(crate) fn clear_touched(&mut self) {
        self.touched.clear();
    }

    /// Retain at most `capacity` events in memory
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = EventLog::with_capacity(capacity);
        self
    }

    /// Inspector used to reject contract identities on later additions
    pub fn with_inspector(mut self, inspector: Arc<dyn AccountInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn register_handler(
        &mut self,
        operation_type: OperationType,
        handler: Arc<dyn OperationHandler>,
    ) {
        info!(%operation_type, "Operation handler registered");
        self.handlers.register(operation_type, handler);
    }

    // ---------------------------------------------------------------------
    // Roster
    // ---------------------------------------------------------------------

    pub fn add_watchdog(&mut self, caller: Address, watchdog: Address) -> Result<usize> {
        self.access.require(Role::Manager, caller)?;
        let roster_size = self.registry.add(watchdog, self.inspector.as_ref())?;
        self.events.emit(WatchdogEvent::WatchdogAdded {
            watchdog,
            roster_size,
        });
        Ok(roster_size)
    }

    pub fn remove_watchdog(
        &mut self,
        caller: Address,
        watchdog: Address,
        reason: &str,
    ) -> Result<usize> {
        self.access.require(Role::Manager, caller)?;
        let roster_size = self.registry.remove(watchdog, reason)?;
        self.events.emit(WatchdogEvent::WatchdogRemoved {
            watchdog,
            reason: reason.to_string(),
            roster_size,
        });
        Ok(roster_size)
    }

    // ---------------------------------------------------------------------
    // Optimistic path
    // ---------------------------------------------------------------------

    /// Primary validator for `(operation_type, payload)` at `now`
    pub fn select_primary(
        &self,
        operation_type: OperationType,
        payload: &[u8],
        now: u64,
    ) -> Result<Selection> {
        self.selector.select(
            self.registry.members(),
            operation_type,
            payload,
            now,
            self.entropy.as_ref(),
        )
    }

    pub fn submit(
        &mut self,
        caller: Address,
        operation_type: OperationType,
        payload: Vec<u8>,
        now: u64,
    ) -> Result<Hash> {
        self.registry.require_member(caller)?;
        if self.paused {
            return Err(WatchdogError::Paused);
        }
        if payload.is_empty() {
            return Err(WatchdogError::EmptyPayload);
        }
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(WatchdogError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LENGTH,
            });
        }

        let selection = self.select_primary(operation_type, &payload, now)?;
        if selection.validator != caller {
            return Err(WatchdogError::NotPrimaryValidator {
                caller,
                expected: selection.validator,
            });
        }

        let id = Operation::compute_id(
            operation_type,
            &payload,
            caller,
            self.selector.nonce(),
            now,
        );
        if self.operations.contains_key(&id) {
            return Err(WatchdogError::DuplicateOperation(id));
        }

        let finalized_at = now.saturating_add(self.config.escalation.initial_delay());
        self.operations.insert(
            id,
            Operation {
                id,
                operation_type,
                payload,
                primary_validator: caller,
                submitted_at: now,
                finalized_at,
                objection_count: 0,
                approval_count: 0,
                status: OperationStatus::Pending,
            },
        );
        self.selector.advance();
        self.touched.insert(id);

        if selection.path == EntropyPath::Fallback {
            warn!(operation = %id, "Primary selected via fallback entropy");
        }
        info!(operation = %id, %operation_type, proposer = %caller, finalized_at, "Operation submitted");

        self.events.emit(WatchdogEvent::ProposerSelected {
            operation_id: id,
            proposer: caller,
            path: selection.path,
        });
        self.events.emit(WatchdogEvent::OperationSubmitted {
            operation_id: id,
            operation_type,
            proposer: caller,
            finalized_at,
        });
        Ok(id)
    }

    /// Object to an operation, extending its window per the escalation ladder
    ///
    /// Returns the new objection count.
    pub fn challenge(
        &mut self,
        caller: Address,
        operation_id: Hash,
        evidence: Vec<u8>,
        now: u64,
    ) -> Result<u32> {
        self.registry.require_member(caller)?;
        let operation = self.pending_operation(operation_id)?;
        if !operation.window_open(now) {
            return Err(WatchdogError::WindowClosed {
                finalized_at: operation.finalized_at,
            });
        }
        if self
            .challenges
            .get(&operation_id)
            .map_or(false, |c| c.iter().any(|c| c.challenger == caller))
        {
            return Err(WatchdogError::AlreadyChallenged(caller));
        }
        if evidence.is_empty() {
            return Err(WatchdogError::EmptyEvidence);
        }
        if evidence.len() > MAX_EVIDENCE_LENGTH {
            return Err(WatchdogError::EvidenceTooLarge {
                len: evidence.len(),
                max: MAX_EVIDENCE_LENGTH,
            });
        }
        if operation.objection_count >= MAX_OBJECTIONS {
            return Err(WatchdogError::ObjectionCapReached {
                max: MAX_OBJECTIONS,
            });
        }

        let objection_count = operation.objection_count + 1;
        let ladder = self.config.escalation;
        let tier = ladder.tier(objection_count);
        let finalized_at = operation
            .finalized_at
            .max(now.saturating_add(tier.delay));
        let required_approvals = ladder.required_approvals(objection_count, self.registry.len());

        let Some(operation) = self.operations.get_mut(&operation_id) else {
            return Err(WatchdogError::OperationNotFound(operation_id));
        };
        operation.objection_count = objection_count;
        operation.finalized_at = finalized_at;
        operation.status = OperationStatus::Challenged { tier };
        self.touched.insert(operation_id);

        self.challenges
            .entry(operation_id)
            .or_default()
            .push(Challenge {
                challenger: caller,
                evidence,
                challenged_at: now,
            });

        info!(
            operation = %operation_id,
            challenger = %caller,
            objection_count,
            level = tier.level,
            finalized_at,
            "Operation challenged"
        );
        self.events.emit(WatchdogEvent::OperationChallenged {
            operation_id,
            challenger: caller,
            objection_count,
            finalized_at,
        });

        if ladder.crosses_threshold(objection_count) {
            info!(
                operation = %operation_id,
                level = tier.level,
                required_approvals,
                "Escalation tier reached"
            );
            self.events.emit(WatchdogEvent::EscalationTriggered {
                operation_id,
                level: tier.level,
                objection_count,
                required_approvals,
            });
        }

        Ok(objection_count)
    }

    /// Approve a challenged operation whose window has closed
    ///
    /// Returns the new approval count.
    pub fn approve(&mut self, caller: Address, operation_id: Hash, now: u64) -> Result<u32> {
        self.registry.require_member(caller)?;
        let operation = self.pending_operation(operation_id)?;
        if !operation.is_challenged() {
            return Err(WatchdogError::NotChallenged);
        }
        if operation.window_open(now) {
            return Err(WatchdogError::WindowOpen {
                finalized_at: operation.finalized_at,
            });
        }
        if self.has_approved(&operation_id, caller) {
            return Err(WatchdogError::AlreadyApproved(caller));
        }

        let Some(operation) = self.operations.get_mut(&operation_id) else {
            return Err(WatchdogError::OperationNotFound(operation_id));
        };
        operation.approval_count += 1;
        let approval_count = operation.approval_count;
        self.approvals.entry(operation_id).or_default().insert(caller);
        self.touched.insert(operation_id);

        debug!(operation = %operation_id, approver = %caller, approval_count, "Operation approved");
        self.events.emit(WatchdogEvent::OperationApproved {
            operation_id,
            approver: caller,
            approval_count,
        });
        Ok(approval_count)
    }

    /// Execute an operation whose window closed with enough approvals
    ///
    /// Execution is final: the returned outcome records what the handler did
    /// but a failed dispatch does not reopen the operation.
    pub fn execute(
        &mut self,
        caller: Address,
        operation_id: Hash,
        now: u64,
    ) -> Result<DispatchOutcome> {
        let pending = self.begin_execute(caller, operation_id, now)?;
        Ok(self.complete_dispatch(pending))
    }

    /// Check and mark an operation executed without running its handler
    ///
    /// The returned dispatch must be passed to `complete_dispatch`.
    pub fn begin_execute(
        &mut self,
        caller: Address,
        operation_id: Hash,
        now: u64,
    ) -> Result<PendingDispatch> {
        let operation = self.pending_operation(operation_id)?;
        if operation.window_open(now) {
            return Err(WatchdogError::WindowOpen {
                finalized_at: operation.finalized_at,
            });
        }
        let need = self.required_approvals_for(operation);
        if operation.approval_count < need {
            return Err(WatchdogError::InsufficientApprovals {
                have: operation.approval_count,
                need,
            });
        }

        self.mark_executed(operation_id, caller, ExecutionPath::Optimistic, now)
    }

    /// Run the handler for a marked operation once and record its outcome
    pub fn complete_dispatch(&mut self, pending: PendingDispatch) -> DispatchOutcome {
        let PendingDispatch {
            operation_id,
            operation_type,
            payload,
            executor,
            path,
        } = pending;
        let outcome = self.handlers.dispatch(operation_type, &payload);

        if let Some(Operation {
            status: OperationStatus::Executed { outcome: stored, .. },
            ..
        }) = self.operations.get_mut(&operation_id)
        {
            *stored = outcome.clone();
            self.touched.insert(operation_id);
        }

        match path {
            ExecutionPath::Optimistic => {
                info!(operation = %operation_id, executor = %executor, success = outcome.success, "Operation executed");
                self.events.emit(WatchdogEvent::OperationExecuted {
                    operation_id,
                    executor,
                    success: outcome.success,
                });
            }
            ExecutionPath::Emergency { action_id } => {
                warn!(
                    action = %action_id,
                    operation = %operation_id,
                    success = outcome.success,
                    "Emergency override executed"
                );
                self.events.emit(WatchdogEvent::EmergencyExecuted {
                    action_id,
                    operation_id,
                    success: outcome.success,
                });
            }
        }
        outcome
    }

    // ---------------------------------------------------------------------
    // Emergency path
    // ---------------------------------------------------------------------

    pub fn schedule_emergency(
        &mut self,
        caller: Address,
        operation_id: Hash,
        reason: &str,
        now: u64,
    ) -> Result<Hash> {
        self.access.require(Role::Emergency, caller)?;
        self.pending_operation(operation_id)?;

        let action = self.emergency.schedule(operation_id, reason, caller, now)?;
        warn!(
            action = %action.id,
            operation = %operation_id,
            proposer = %caller,
            reason,
            "Emergency override scheduled"
        );
        self.events.emit(WatchdogEvent::EmergencyScheduled {
            action_id: action.id,
            operation_id,
            proposer: caller,
            scheduled_time: action.scheduled_time,
        });
        Ok(action.id)
    }

    pub fn execute_emergency(
        &mut self,
        caller: Address,
        action_id: Hash,
        now: u64,
    ) -> Result<DispatchOutcome> {
        let pending = self.begin_emergency(caller, action_id, now)?;
        Ok(self.complete_dispatch(pending))
    }

    /// Emergency counterpart of `begin_execute`
    pub fn begin_emergency(
        &mut self,
        caller: Address,
        action_id: Hash,
        now: u64,
    ) -> Result<PendingDispatch> {
        self.access.require(Role::Emergency, caller)?;
        let operation_id = self.emergency.ready(action_id, now)?.operation_id;
        self.pending_operation(operation_id)?;

        let pending =
            self.mark_executed(operation_id, caller, ExecutionPath::Emergency { action_id }, now)?;
        self.emergency.mark_executed(action_id);
        Ok(pending)
    }

    pub fn cancel_emergency(&mut self, caller: Address, action_id: Hash) -> Result<()> {
        self.access.require(Role::Emergency, caller)?;
        let action = self.emergency.cancel(action_id)?;
        self.events.emit(WatchdogEvent::EmergencyCancelled {
            action_id,
            operation_id: action.operation_id,
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Governance
    // ---------------------------------------------------------------------

    /// Replace escalation and emergency parameters; open windows are unaffected
    pub fn update_consensus_parameters(
        &mut self,
        caller: Address,
        config: WatchdogConfig,
    ) -> Result<()> {
        self.access.require(Role::Owner, caller)?;
        config.validate()?;
        self.emergency.set_delay(config.emergency_delay)?;
        self.config = config;

        info!(
            thresholds = ?config.escalation.thresholds,
            delays = ?config.escalation.delays,
            emergency_delay = config.emergency_delay,
            "Consensus parameters updated"
        );
        self.events.emit(WatchdogEvent::ParametersUpdated {
            escalation: config.escalation,
            emergency_delay: config.emergency_delay,
        });
        Ok(())
    }

    pub fn pause(&mut self, caller: Address) -> Result<()> {
        self.access.require(Role::Owner, caller)?;
        if !self.paused {
            self.paused = true;
            warn!(by = %caller, "Submissions paused");
            self.events.emit(WatchdogEvent::Paused { by: caller });
        }
        Ok(())
    }

    pub fn unpause(&mut self, caller: Address) -> Result<()> {
        self.access.require(Role::Owner, caller)?;
        if self.paused {
            self.paused = false;
            info!(by = %caller, "Submissions resumed");
            self.events.emit(WatchdogEvent::Unpaused { by: caller });
        }
        Ok(())
    }

    pub fn grant_role(&mut self, caller: Address, role: Role, account: Address) -> Result<bool> {
        self.access.grant(caller, role, account)
    }

    pub fn revoke_role(&mut self, caller: Address, role: Role, account: Address) -> Result<bool> {
        self.access.revoke(caller, role, account)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn operation(&self, operation_id: &Hash) -> Option<&Operation> {
        self.operations.get(operation_id)
    }

    pub fn operation_state(&self, operation_id: &Hash, now: u64) -> Option<OperationState> {
        self.operations.get(operation_id).map(|op| op.state(now))
    }

    pub fn challenges(&self, operation_id: &Hash) -> &[Challenge] {
        self.challenges
            .get(operation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_approved(&self, operation_id: &Hash, approver: Address) -> bool {
        self.approvals
            .get(operation_id)
            .map_or(false, |set| set.contains(&approver))
    }

    /// Approvals the operation needs against the current roster
    pub fn required_approvals(&self, operation_id: &Hash) -> Option<u32> {
        self.operations
            .get(operation_id)
            .map(|op| self.required_approvals_for(op))
    }

    pub fn emergency_action(&self, action_id: &Hash) -> Option<&EmergencyAction> {
        self.emergency.get(action_id)
    }

    pub fn pending_emergency_actions(&self) -> Vec<&EmergencyAction> {
        self.emergency.pending()
    }

    pub fn watchdogs(&self) -> &[Address] {
        self.registry.members()
    }

    pub fn is_watchdog(&self, account: Address) -> bool {
        self.registry.contains(account)
    }

    pub fn has_role(&self, role: Role, account: Address) -> bool {
        self.access.has_role(role, account)
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn events(&self) -> &VecDeque<WatchdogEvent> {
        self.events.events()
    }

    pub fn take_events(&mut self) -> Vec<WatchdogEvent> {
        self.events.take()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<WatchdogEvent> {
        self.events.subscribe()
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// Existing, unexecuted operation
    fn pending_operation(&self, operation_id: Hash) -> Result<&Operation> {
        let operation = self
            .operations
            .get(&operation_id)
            .ok_or(WatchdogError::OperationNotFound(operation_id))?;
        if operation.is_executed() {
            return Err(WatchdogError::AlreadyExecuted(operation_id));
        }
        Ok(operation)
    }

    fn required_approvals_for(&self, operation: &Operation) -> u32 {
        if !operation.is_challenged() {
            return 0;
        }
        self.config
            .escalation
            .required_approvals(operation.objection_count, self.registry.len())
    }

    /// Flip the operation to executed ahead of its dispatch
    fn mark_executed(
        &mut self,
        operation_id: Hash,
        executor: Address,
        path: ExecutionPath,
        now: u64,
    ) -> Result<PendingDispatch> {
        let Some(operation) = self.operations.get_mut(&operation_id) else {
            return Err(WatchdogError::OperationNotFound(operation_id));
        };
        operation.status = OperationStatus::Executed {
            executed_at: now,
            path,
            outcome: DispatchOutcome::failed("dispatch in flight"),
        };
        self.touched.insert(operation_id);
        Ok(PendingDispatch {
            operation_id,
            operation_type: operation.operation_type,
            payload: operation.payload.clone(),
            executor,
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HOUR;
    use crate::crypto::hash_data;
    use crate::dispatch::HandlerError;
    use crate::selector::BlockCommitments;
    use parking_lot::Mutex;

    const ADMIN: Address = Address::repeat_byte(0xAA);
    const SELF: Address = Address::repeat_byte(0xEE);

    #[derive(Default)]
    struct CountingHandler {
        calls: Mutex<u32>,
        fail: bool,
    }

    impl OperationHandler for CountingHandler {
        fn handle(&self, _: OperationType, _: &[u8]) -> std::result::Result<(), HandlerError> {
            *self.calls.lock() += 1;
            if self.fail {
                Err(HandlerError::Downstream("rejected".into()))
            } else {
                Ok(())
            }
        }
    }

    fn committee(n: u8) -> Vec<Address> {
        (1..=n).map(Address::with_last_byte).collect()
    }

    fn engine(n: u8) -> WatchdogConsensus {
        let entropy = Arc::new(BlockCommitments::default());
        entropy.record(1, hash_data(b"genesis"));
        WatchdogConsensus::new(WatchdogConfig::default(), ADMIN, SELF, &committee(n), entropy)
            .unwrap()
    }

    fn submit_as_primary(
        engine: &mut WatchdogConsensus,
        ty: OperationType,
        payload: &[u8],
        now: u64,
    ) -> Hash {
        let primary = engine.select_primary(ty, payload, now).unwrap().validator;
        engine.submit(primary, ty, payload.to_vec(), now).unwrap()
    }

    fn non_primary(engine: &WatchdogConsensus, primary: Address) -> Vec<Address> {
        engine
            .watchdogs()
            .iter()
            .copied()
            .filter(|w| *w != primary)
            .collect()
    }

    #[test]
    fn test_new_requires_minimum_committee() {
        let entropy = Arc::new(BlockCommitments::default());
        let result = WatchdogConsensus::new(
            WatchdogConfig::default(),
            ADMIN,
            SELF,
            &committee(2),
            entropy,
        );
        assert!(matches!(result, Err(WatchdogError::InvalidParameters(_))));
    }

    #[test]
    fn test_submit_opens_initial_window() {
        let mut engine = engine(5);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"qc1:paused", 1_000);

        let op = engine.operation(&id).unwrap();
        assert_eq!(op.finalized_at, 1_000 + HOUR);
        assert_eq!(op.objection_count, 0);
        assert_eq!(engine.operation_state(&id, 1_000), Some(OperationState::Pending));
        assert_eq!(
            engine.operation_state(&id, 1_000 + HOUR),
            Some(OperationState::Executable)
        );
    }

    #[test]
    fn test_submit_rejects_non_primary() {
        let mut engine = engine(5);
        let payload = b"wallet:bc1q".to_vec();
        let primary = engine
            .select_primary(OperationType::WalletRegistration, &payload, 0)
            .unwrap()
            .validator;

        for other in non_primary(&engine, primary) {
            let err = engine
                .submit(other, OperationType::WalletRegistration, payload.clone(), 0)
                .unwrap_err();
            assert_eq!(
                err,
                WatchdogError::NotPrimaryValidator {
                    caller: other,
                    expected: primary
                }
            );
        }
        assert!(engine
            .submit(primary, OperationType::WalletRegistration, payload, 0)
            .is_ok());
    }

    #[test]
    fn test_submit_guards() {
        let mut engine = engine(5);
        let outsider = Address::with_last_byte(99);
        assert_eq!(
            engine.submit(outsider, OperationType::StatusChange, vec![1], 0),
            Err(WatchdogError::NotWatchdog(outsider))
        );

        let member = engine.watchdogs()[0];
        assert_eq!(
            engine.submit(member, OperationType::StatusChange, vec![], 0),
            Err(WatchdogError::EmptyPayload)
        );
        assert!(matches!(
            engine.submit(member, OperationType::StatusChange, vec![0; MAX_PAYLOAD_LENGTH + 1], 0),
            Err(WatchdogError::PayloadTooLarge { .. })
        ));

        engine.pause(ADMIN).unwrap();
        assert_eq!(
            engine.submit(member, OperationType::StatusChange, vec![1], 0),
            Err(WatchdogError::Paused)
        );
        engine.unpause(ADMIN).unwrap();
    }

    #[test]
    fn test_challenge_escalates_and_never_shrinks_window() {
        let mut engine = engine(5);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let members = engine.watchdogs().to_vec();

        // first objection late in the window: tier 0 extends to now + 1h
        engine.challenge(members[0], id, b"e".to_vec(), 3_000).unwrap();
        assert_eq!(engine.operation(&id).unwrap().finalized_at, 3_000 + HOUR);

        engine.challenge(members[1], id, b"e".to_vec(), 3_100).unwrap();
        let op = engine.operation(&id).unwrap();
        assert_eq!(op.objection_count, 2);
        assert_eq!(op.finalized_at, 3_100 + 4 * HOUR);
        assert!(op.is_challenged());
    }

    #[test]
    fn test_challenge_guards_are_atomic() {
        let mut engine = engine(5);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let member = engine.watchdogs()[0];
        let before = engine.operation(&id).unwrap().clone();

        assert_eq!(
            engine.challenge(member, id, vec![], 10),
            Err(WatchdogError::EmptyEvidence)
        );
        assert!(matches!(
            engine.challenge(member, id, vec![0; MAX_EVIDENCE_LENGTH + 1], 10),
            Err(WatchdogError::EvidenceTooLarge { .. })
        ));
        assert_eq!(
            engine.challenge(member, hash_data(b"missing"), b"e".to_vec(), 10),
            Err(WatchdogError::OperationNotFound(hash_data(b"missing")))
        );
        assert_eq!(engine.operation(&id).unwrap(), &before);
        assert!(engine.challenges(&id).is_empty());

        engine.challenge(member, id, b"e".to_vec(), 10).unwrap();
        assert_eq!(
            engine.challenge(member, id, b"again".to_vec(), 20),
            Err(WatchdogError::AlreadyChallenged(member))
        );
        assert_eq!(engine.operation(&id).unwrap().objection_count, 1);
    }

    #[test]
    fn test_challenge_after_window_rejected() {
        let mut engine = engine(5);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let member = engine.watchdogs()[0];
        assert_eq!(
            engine.challenge(member, id, b"e".to_vec(), HOUR),
            Err(WatchdogError::WindowClosed { finalized_at: HOUR })
        );
    }

    #[test]
    fn test_objection_cap() {
        let mut engine = engine(15);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let members = engine.watchdogs().to_vec();

        for (i, member) in members.iter().take(MAX_OBJECTIONS as usize).enumerate() {
            engine.challenge(*member, id, b"e".to_vec(), i as u64).unwrap();
        }
        assert_eq!(
            engine.challenge(members[10], id, b"e".to_vec(), 20),
            Err(WatchdogError::ObjectionCapReached { max: MAX_OBJECTIONS })
        );
    }

    #[test]
    fn test_escalation_event_on_threshold() {
        let mut engine = engine(5);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let members = engine.watchdogs().to_vec();
        engine.take_events();

        engine.challenge(members[0], id, b"e".to_vec(), 1).unwrap();
        assert!(!engine
            .events()
            .iter()
            .any(|e| matches!(e, WatchdogEvent::EscalationTriggered { .. })));

        engine.challenge(members[1], id, b"e".to_vec(), 2).unwrap();
        engine.challenge(members[2], id, b"e".to_vec(), 3).unwrap();
        let escalations: Vec<_> = engine
            .events()
            .iter()
            .filter_map(|e| match e {
                WatchdogEvent::EscalationTriggered {
                    level,
                    required_approvals,
                    ..
                } => Some((*level, *required_approvals)),
                _ => None,
            })
            .collect();
        assert_eq!(escalations, vec![(1, 0), (2, 3)]);
    }

    #[test]
    fn test_approve_guards() {
        let mut engine = engine(5);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let members = engine.watchdogs().to_vec();

        assert_eq!(
            engine.approve(members[0], id, 2 * HOUR),
            Err(WatchdogError::NotChallenged)
        );

        engine.challenge(members[0], id, b"e".to_vec(), 10).unwrap();
        assert_eq!(
            engine.approve(members[1], id, 20),
            Err(WatchdogError::WindowOpen {
                finalized_at: 10 + HOUR
            })
        );

        engine.approve(members[1], id, 10 + HOUR).unwrap();
        assert!(engine.has_approved(&id, members[1]));
        assert_eq!(
            engine.approve(members[1], id, 10 + HOUR),
            Err(WatchdogError::AlreadyApproved(members[1]))
        );
    }

    #[test]
    fn test_execute_is_single_shot() {
        let mut engine = engine(5);
        let handler = Arc::new(CountingHandler::default());
        engine.register_handler(OperationType::StatusChange, handler.clone());
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);

        assert_eq!(
            engine.execute(ADMIN, id, HOUR - 1),
            Err(WatchdogError::WindowOpen { finalized_at: HOUR })
        );

        let outcome = engine.execute(ADMIN, id, HOUR).unwrap();
        assert!(outcome.success);
        assert_eq!(engine.execute(ADMIN, id, HOUR + 1), Err(WatchdogError::AlreadyExecuted(id)));
        assert_eq!(*handler.calls.lock(), 1);
        assert_eq!(engine.operation_state(&id, 0), Some(OperationState::Executed));
    }

    #[test]
    fn test_begin_execute_marks_without_dispatch() {
        let mut engine = engine(5);
        let handler = Arc::new(CountingHandler::default());
        engine.register_handler(OperationType::StatusChange, handler.clone());
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        engine.take_events();

        let pending = engine.begin_execute(ADMIN, id, HOUR).unwrap();
        assert_eq!(pending.operation_id(), id);
        assert_eq!(*handler.calls.lock(), 0);
        assert!(engine.operation(&id).unwrap().is_executed());
        assert!(engine.events().is_empty());
        assert_eq!(engine.begin_execute(ADMIN, id, HOUR), Err(WatchdogError::AlreadyExecuted(id)));

        let outcome = engine.complete_dispatch(pending);
        assert!(outcome.success);
        assert_eq!(*handler.calls.lock(), 1);
        assert_eq!(engine.operation(&id).unwrap().outcome(), Some(&outcome));
        assert_eq!(engine.touched(), vec![id]);
    }

    #[test]
    fn test_staged_changes_publish_on_commit() {
        let mut engine = engine(5);
        let mut rx = engine.subscribe();
        let before = engine.snapshot();

        let mut staged = engine.stage();
        let id = submit_as_primary(&mut staged, OperationType::StatusChange, b"p", 0);
        assert_eq!(engine.snapshot(), before);
        assert!(rx.try_recv().is_err());

        // discarding the copy leaves nothing behind
        drop(staged);
        assert!(engine.operation(&id).is_none());

        let mut staged = engine.stage();
        let id = submit_as_primary(&mut staged, OperationType::StatusChange, b"p", 0);
        engine.commit(staged);
        assert!(engine.operation(&id).is_some());
        assert_eq!(engine.events().len(), 2);
        assert!(matches!(rx.try_recv(), Ok(WatchdogEvent::ProposerSelected { .. })));
        assert_eq!(engine.touched(), vec![id]);
    }

    #[test]
    fn test_event_capacity_is_configurable() {
        let mut engine = engine(5).with_event_capacity(2);
        let members = engine.watchdogs().to_vec();
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        engine.challenge(members[0], id, b"e".to_vec(), 1).unwrap();

        assert_eq!(engine.events().len(), 2);
        assert!(matches!(
            engine.events().back(),
            Some(WatchdogEvent::OperationChallenged { .. })
        ));
    }

    #[test]
    fn test_dispatch_failure_keeps_executed() {
        let mut engine = engine(5);
        engine.register_handler(
            OperationType::RedemptionFulfillment,
            Arc::new(CountingHandler {
                fail: true,
                ..Default::default()
            }),
        );
        let id = submit_as_primary(&mut engine, OperationType::RedemptionFulfillment, b"r", 0);

        let outcome = engine.execute(ADMIN, id, HOUR).unwrap();
        assert!(!outcome.success);
        let op = engine.operation(&id).unwrap();
        assert!(op.is_executed());
        assert_eq!(op.outcome(), Some(&outcome));
        assert!(engine
            .events()
            .contains(&WatchdogEvent::OperationExecuted {
                operation_id: id,
                executor: ADMIN,
                success: false
            }));
    }

    #[test]
    fn test_emergency_requires_role_and_pending_operation() {
        let mut engine = engine(5);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let member = engine.watchdogs()[0];

        assert_eq!(
            engine.schedule_emergency(member, id, "threat", 0),
            Err(WatchdogError::MissingRole {
                caller: member,
                role: Role::Emergency
            })
        );
        assert_eq!(
            engine.schedule_emergency(ADMIN, id, "", 0),
            Err(WatchdogError::ReasonRequired)
        );

        engine.execute(ADMIN, id, HOUR).unwrap();
        assert_eq!(
            engine.schedule_emergency(ADMIN, id, "threat", HOUR),
            Err(WatchdogError::AlreadyExecuted(id))
        );
    }

    #[test]
    fn test_emergency_execution_short_circuits() {
        let mut engine = engine(5);
        let handler = Arc::new(CountingHandler::default());
        engine.register_handler(OperationType::StatusChange, handler.clone());
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let members = engine.watchdogs().to_vec();
        for m in &members[..3] {
            engine.challenge(*m, id, b"e".to_vec(), 10).unwrap();
        }

        let action = engine.schedule_emergency(ADMIN, id, "active exploit", 100).unwrap();
        let outcome = engine.execute_emergency(ADMIN, action, 100 + 2 * HOUR).unwrap();
        assert!(outcome.success);

        let op = engine.operation(&id).unwrap();
        assert!(matches!(
            op.status,
            OperationStatus::Executed {
                path: ExecutionPath::Emergency { .. },
                ..
            }
        ));
        assert!(engine.emergency_action(&action).unwrap().executed);
        assert_eq!(
            engine.execute(ADMIN, id, 100 * HOUR),
            Err(WatchdogError::AlreadyExecuted(id))
        );
        assert_eq!(*handler.calls.lock(), 1);
    }

    #[test]
    fn test_emergency_fails_if_operation_executed_first() {
        let mut engine = engine(5);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let action = engine.schedule_emergency(ADMIN, id, "threat", 0).unwrap();

        engine.execute(ADMIN, id, 2 * HOUR).unwrap();
        assert_eq!(
            engine.execute_emergency(ADMIN, action, 2 * HOUR),
            Err(WatchdogError::AlreadyExecuted(id))
        );
        assert!(!engine.emergency_action(&action).unwrap().executed);
    }

    #[test]
    fn test_roster_management_requires_manager() {
        let mut engine = engine(4);
        let member = engine.watchdogs()[0];
        let newcomer = Address::with_last_byte(50);

        assert!(matches!(
            engine.add_watchdog(member, newcomer),
            Err(WatchdogError::MissingRole { .. })
        ));
        assert_eq!(engine.add_watchdog(ADMIN, newcomer).unwrap(), 5);
        assert!(engine.is_watchdog(newcomer));

        assert_eq!(engine.remove_watchdog(ADMIN, newcomer, "rotation").unwrap(), 4);
        assert!(engine.events().contains(&WatchdogEvent::WatchdogRemoved {
            watchdog: newcomer,
            reason: "rotation".to_string(),
            roster_size: 4
        }));
    }

    #[test]
    fn test_roster_change_feeds_required_approvals() {
        let mut engine = engine(5);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let members = engine.watchdogs().to_vec();
        for m in &members[..3] {
            engine.challenge(*m, id, b"e".to_vec(), 10).unwrap();
        }
        assert_eq!(engine.required_approvals(&id), Some(3));

        for n in 60..70 {
            engine.add_watchdog(ADMIN, Address::with_last_byte(n)).unwrap();
        }
        // 15 members: 40% is 6
        assert_eq!(engine.required_approvals(&id), Some(6));
    }

    #[test]
    fn test_update_parameters() {
        let mut engine = engine(5);
        let member = engine.watchdogs()[0];
        let mut config = WatchdogConfig::default();
        config.emergency_delay = 4 * HOUR;
        config.escalation.delays[0] = 2 * HOUR;

        assert!(engine.update_consensus_parameters(member, config).is_err());
        engine.update_consensus_parameters(ADMIN, config).unwrap();
        assert_eq!(engine.config().emergency_delay, 4 * HOUR);

        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        assert_eq!(engine.operation(&id).unwrap().finalized_at, 2 * HOUR);

        let mut bad = config;
        bad.escalation.delays[0] = 60;
        assert!(matches!(
            engine.update_consensus_parameters(ADMIN, bad),
            Err(WatchdogError::InvalidParameters(_))
        ));
        assert_eq!(engine.config(), &config);
    }

    #[test]
    fn test_snapshot_restore_preserves_state() {
        let mut engine = engine(5);
        let id = submit_as_primary(&mut engine, OperationType::StatusChange, b"p", 0);
        let member = engine.watchdogs()[0];
        engine.challenge(member, id, b"e".to_vec(), 5).unwrap();

        let snapshot = engine.snapshot();
        let entropy = Arc::new(BlockCommitments::default());
        let mut restored = WatchdogConsensus::restore(snapshot.clone(), entropy).unwrap();

        assert_eq!(restored.snapshot(), snapshot);
        assert!(restored.is_watchdog(member));
        assert_eq!(
            restored.challenge(member, id, b"e".to_vec(), 6),
            Err(WatchdogError::AlreadyChallenged(member))
        );
    }
}
