// Shared consensus node
//
// Wraps the engine for use from many threads. Calls serialize on a single
// lock and the clock supplies `now`. With a store attached, a mutation runs
// against a staged copy of the engine and only becomes visible once its
// snapshot is written; old snapshots beyond the retention window are pruned.
// Execution persists the executed mark before the handler runs. A handler
// that calls back into the node while its operation is being dispatched is
// rejected with `Reentrant` instead of deadlocking on the engine lock.

use crate::access::Role;
use crate::clock::Clock;
use crate::config::WatchdogConfig;
use crate::crypto::Hash;
use crate::dispatch::{DispatchOutcome, OperationHandler};
use crate::emergency::EmergencyAction;
use crate::engine::{PendingDispatch, WatchdogConsensus};
use crate::error::WatchdogError;
use crate::events::WatchdogEvent;
use crate::operation::{Operation, OperationState, OperationType};
use crate::selector::{EntropySource, Selection};
use crate::storage::{SnapshotStore, StorageError, DEFAULT_SNAPSHOT_RETENTION};
use alloy_primitives::Address;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Consensus(#[from] WatchdogError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl NodeError {
    /// The consensus error, if this is one
    pub fn consensus(&self) -> Option<&WatchdogError> {
        match self {
            NodeError::Consensus(e) => Some(e),
            NodeError::Storage(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Tracks the thread currently dispatching an operation
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    owner: Mutex<Option<ThreadId>>,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if the calling thread is in the middle of a dispatch
    pub fn check(&self) -> std::result::Result<(), WatchdogError> {
        if *self.owner.lock() == Some(thread::current().id()) {
            return Err(WatchdogError::Reentrant);
        }
        Ok(())
    }

    pub fn is_dispatching(&self) -> bool {
        self.owner.lock().is_some()
    }

    fn enter(&self) -> DispatchScope<'_> {
        *self.owner.lock() = Some(thread::current().id());
        DispatchScope { guard: self }
    }
}

/// Clears the dispatching thread on drop
struct DispatchScope<'a> {
    guard: &'a ReentrancyGuard,
}

impl Drop for DispatchScope<'_> {
    fn drop(&mut self) {
        *self.guard.owner.lock() = None;
    }
}

#[derive(Clone)]
pub struct WatchdogNode {
    engine: Arc<Mutex<WatchdogConsensus>>,
    clock: Arc<dyn Clock>,
    guard: Arc<ReentrancyGuard>,
    store: Option<Arc<dyn SnapshotStore>>,
    retention: u64,
}

impl WatchdogNode {
    pub fn new(engine: WatchdogConsensus, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            clock,
            guard: Arc::new(ReentrancyGuard::new()),
            store: None,
            retention: DEFAULT_SNAPSHOT_RETENTION,
        }
    }

    /// Persist every accepted mutation; the current state is saved immediately
    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        let sequence = {
            let mut engine = self.engine.lock();
            let snapshot = engine.snapshot();
            let all: Vec<Hash> = snapshot.operations.keys().copied().collect();
            let sequence = store.save_snapshot(&snapshot, &all)?;
            engine.clear_touched();
            sequence
        };
        info!(sequence, retention = self.retention, "Consensus node persistence enabled");
        self.store = Some(store);
        Ok(self)
    }

    /// Number of snapshots kept after each save (at least one)
    pub fn with_retention(mut self, keep: u64) -> Self {
        self.retention = keep.max(1);
        self
    }

    /// Rebuild a node from the latest persisted snapshot, if there is one
    pub fn recover(
        store: Arc<dyn SnapshotStore>,
        entropy: Arc<dyn EntropySource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Option<Self>> {
        let Some(snapshot) = store.load_latest_snapshot()? else {
            return Ok(None);
        };
        let engine = WatchdogConsensus::restore(snapshot, entropy)?;
        Ok(Some(Self {
            engine: Arc::new(Mutex::new(engine)),
            clock,
            guard: Arc::new(ReentrancyGuard::new()),
            store: Some(store),
            retention: DEFAULT_SNAPSHOT_RETENTION,
        }))
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn register_handler(
        &self,
        operation_type: OperationType,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<()> {
        self.guard.check()?;
        self.engine.lock().register_handler(operation_type, handler);
        Ok(())
    }

    // Roster

    pub fn add_watchdog(&self, caller: Address, watchdog: Address) -> Result<usize> {
        self.mutate(|engine, _| engine.add_watchdog(caller, watchdog))
    }

    pub fn remove_watchdog(&self, caller: Address, watchdog: Address, reason: &str) -> Result<usize> {
        self.mutate(|engine, _| engine.remove_watchdog(caller, watchdog, reason))
    }

    // Optimistic path

    pub fn select_primary(&self, operation_type: OperationType, payload: &[u8]) -> Result<Selection> {
        self.read(|engine, now| engine.select_primary(operation_type, payload, now))?
            .map_err(NodeError::from)
    }

    pub fn submit(
        &self,
        caller: Address,
        operation_type: OperationType,
        payload: Vec<u8>,
    ) -> Result<Hash> {
        self.mutate(|engine, now| engine.submit(caller, operation_type, payload, now))
    }

    pub fn challenge(&self, caller: Address, operation_id: Hash, evidence: Vec<u8>) -> Result<u32> {
        self.mutate(|engine, now| engine.challenge(caller, operation_id, evidence, now))
    }

    pub fn approve(&self, caller: Address, operation_id: Hash) -> Result<u32> {
        self.mutate(|engine, now| engine.approve(caller, operation_id, now))
    }

    pub fn execute(&self, caller: Address, operation_id: Hash) -> Result<DispatchOutcome> {
        self.dispatch(|engine, now| engine.begin_execute(caller, operation_id, now))
    }

    // Emergency path

    pub fn schedule_emergency(&self, caller: Address, operation_id: Hash, reason: &str) -> Result<Hash> {
        self.mutate(|engine, now| engine.schedule_emergency(caller, operation_id, reason, now))
    }

    pub fn execute_emergency(&self, caller: Address, action_id: Hash) -> Result<DispatchOutcome> {
        self.dispatch(|engine, now| engine.begin_emergency(caller, action_id, now))
    }

    pub fn cancel_emergency(&self, caller: Address, action_id: Hash) -> Result<()> {
        self.mutate(|engine, _| engine.cancel_emergency(caller, action_id))
    }

    // Governance

    pub fn update_consensus_parameters(&self, caller: Address, config: WatchdogConfig) -> Result<()> {
        self.mutate(|engine, _| engine.update_consensus_parameters(caller, config))
    }

    pub fn pause(&self, caller: Address) -> Result<()> {
        self.mutate(|engine, _| engine.pause(caller))
    }

    pub fn unpause(&self, caller: Address) -> Result<()> {
        self.mutate(|engine, _| engine.unpause(caller))
    }

    pub fn grant_role(&self, caller: Address, role: Role, account: Address) -> Result<bool> {
        self.mutate(|engine, _| engine.grant_role(caller, role, account))
    }

    pub fn revoke_role(&self, caller: Address, role: Role, account: Address) -> Result<bool> {
        self.mutate(|engine, _| engine.revoke_role(caller, role, account))
    }

    // Queries

    pub fn operation(&self, operation_id: &Hash) -> Result<Option<Operation>> {
        self.read(|engine, _| engine.operation(operation_id).cloned())
    }

    pub fn operation_state(&self, operation_id: &Hash) -> Result<Option<OperationState>> {
        self.read(|engine, now| engine.operation_state(operation_id, now))
    }

    pub fn required_approvals(&self, operation_id: &Hash) -> Result<Option<u32>> {
        self.read(|engine, _| engine.required_approvals(operation_id))
    }

    pub fn emergency_action(&self, action_id: &Hash) -> Result<Option<EmergencyAction>> {
        self.read(|engine, _| engine.emergency_action(action_id).cloned())
    }

    pub fn watchdogs(&self) -> Result<Vec<Address>> {
        self.read(|engine, _| engine.watchdogs().to_vec())
    }

    pub fn is_paused(&self) -> Result<bool> {
        self.read(|engine, _| engine.is_paused())
    }

    pub fn events(&self) -> Result<Vec<WatchdogEvent>> {
        self.read(|engine, _| engine.events().iter().cloned().collect())
    }

    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<WatchdogEvent>> {
        self.guard.check()?;
        Ok(self.engine.lock().subscribe())
    }

    /// Run a read-only closure against the engine
    pub fn read<R>(&self, f: impl FnOnce(&WatchdogConsensus, u64) -> R) -> Result<R> {
        self.guard.check()?;
        let engine = self.engine.lock();
        Ok(f(&*engine, self.clock.now()))
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut WatchdogConsensus, u64) -> std::result::Result<R, WatchdogError>,
    ) -> Result<R> {
        self.guard.check()?;
        let mut engine = self.engine.lock();
        self.apply(&mut *engine, f)
    }

    /// Mark an operation executed durably, then run its handler
    ///
    /// If the outcome cannot be saved afterwards the call still succeeds: the
    /// executed mark is already on disk and the next save records the outcome.
    fn dispatch(
        &self,
        begin: impl FnOnce(&mut WatchdogConsensus, u64) -> std::result::Result<PendingDispatch, WatchdogError>,
    ) -> Result<DispatchOutcome> {
        self.guard.check()?;
        let mut engine = self.engine.lock();
        let pending = self.apply(&mut *engine, begin)?;
        let operation_id = pending.operation_id();

        let outcome = {
            let _scope = self.guard.enter();
            engine.complete_dispatch(pending)
        };
        if let Some(store) = &self.store {
            if let Err(e) = self.persist(store.as_ref(), &mut *engine) {
                warn!(operation = %operation_id, error = %e, "Dispatch outcome not persisted");
            }
        }
        Ok(outcome)
    }

    /// Run `f` and make its effects visible only once they are persisted
    fn apply<R>(
        &self,
        engine: &mut WatchdogConsensus,
        f: impl FnOnce(&mut WatchdogConsensus, u64) -> std::result::Result<R, WatchdogError>,
    ) -> Result<R> {
        let now = self.clock.now();
        let Some(store) = &self.store else {
            let value = f(&mut *engine, now)?;
            engine.clear_touched();
            return Ok(value);
        };

        let mut staged = engine.stage();
        let value = f(&mut staged, now)?;
        self.persist(store.as_ref(), &mut staged)?;
        engine.commit(staged);
        Ok(value)
    }

    fn persist(&self, store: &dyn SnapshotStore, engine: &mut WatchdogConsensus) -> Result<u64> {
        let sequence = match store.save_snapshot(&engine.snapshot(), &engine.touched()) {
            Ok(sequence) => sequence,
            Err(e) => {
                error!(error = %e, "Failed to persist consensus snapshot");
                return Err(e.into());
            }
        };
        engine.clear_touched();
        if let Err(e) = store.prune_snapshots(self.retention) {
            warn!(sequence, error = %e, "Failed to prune consensus snapshots");
        }
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::HOUR;
    use crate::crypto::hash_data;
    use crate::dispatch::HandlerError;
    use crate::engine::ConsensusSnapshot;
    use crate::selector::BlockCommitments;
    use crate::storage::{ConsensusStore, Result as StorageResult};
    use std::sync::OnceLock;

    const ADMIN: Address = Address::repeat_byte(0xAA);

    fn node(clock: Arc<ManualClock>) -> WatchdogNode {
        let entropy = Arc::new(BlockCommitments::default());
        entropy.record(1, hash_data(b"genesis"));
        let committee: Vec<_> = (1..=5).map(Address::with_last_byte).collect();
        let engine = WatchdogConsensus::new(
            WatchdogConfig::default(),
            ADMIN,
            Address::repeat_byte(0xEE),
            &committee,
            entropy,
        )
        .unwrap();
        WatchdogNode::new(engine, clock)
    }

    fn submit(node: &WatchdogNode, ty: OperationType, payload: &[u8]) -> Hash {
        let primary = node.select_primary(ty, payload).unwrap().validator;
        node.submit(primary, ty, payload.to_vec()).unwrap()
    }

    /// Accepts a limited number of saves, then fails
    #[derive(Default)]
    struct FlakyStore {
        budget: Mutex<Option<usize>>,
        saved: Mutex<Vec<ConsensusSnapshot>>,
    }

    impl FlakyStore {
        fn allow(&self, saves: Option<usize>) {
            *self.budget.lock() = saves;
        }

        fn last(&self) -> Option<ConsensusSnapshot> {
            self.saved.lock().last().cloned()
        }
    }

    impl SnapshotStore for FlakyStore {
        fn save_snapshot(&self, snapshot: &ConsensusSnapshot, _: &[Hash]) -> StorageResult<u64> {
            match self.budget.lock().as_mut() {
                Some(0) => return Err(StorageError::InvalidData("disk full".into())),
                Some(remaining) => *remaining -= 1,
                None => {}
            }
            let mut saved = self.saved.lock();
            saved.push(snapshot.clone());
            Ok(saved.len() as u64 - 1)
        }

        fn load_latest_snapshot(&self) -> StorageResult<Option<ConsensusSnapshot>> {
            Ok(self.last())
        }

        fn prune_snapshots(&self, _: u64) -> StorageResult<usize> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: Mutex<u32>,
    }

    impl OperationHandler for CountingHandler {
        fn handle(&self, _: OperationType, _: &[u8]) -> std::result::Result<(), HandlerError> {
            *self.calls.lock() += 1;
            Ok(())
        }
    }

    /// Tries to re-enter the node from inside dispatch
    #[derive(Default)]
    struct ReentrantHandler {
        node: OnceLock<WatchdogNode>,
        observed: parking_lot::Mutex<Vec<WatchdogError>>,
    }

    impl OperationHandler for ReentrantHandler {
        fn handle(&self, _: OperationType, _: &[u8]) -> std::result::Result<(), HandlerError> {
            let Some(node) = self.node.get() else {
                return Ok(());
            };
            let target = hash_data(b"anything");
            for result in [
                node.execute(ADMIN, target).map(|_| ()),
                node.pause(ADMIN),
                node.operation(&target).map(|_| ()),
            ] {
                if let Err(NodeError::Consensus(e)) = result {
                    self.observed.lock().push(e);
                }
            }
            Err(HandlerError::Rejected("re-entry attempted".into()))
        }
    }

    #[test]
    fn test_node_uses_clock() {
        let clock = Arc::new(ManualClock::new(1_000));
        let node = node(clock.clone());
        let id = submit(&node, OperationType::StatusChange, b"p");

        assert_eq!(node.operation(&id).unwrap().unwrap().finalized_at, 1_000 + HOUR);
        assert!(matches!(
            node.execute(ADMIN, id),
            Err(NodeError::Consensus(WatchdogError::WindowOpen { .. }))
        ));

        clock.advance(HOUR);
        assert!(node.execute(ADMIN, id).unwrap().success);
        assert_eq!(node.operation_state(&id).unwrap(), Some(OperationState::Executed));
    }

    #[test]
    fn test_reentrant_calls_are_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let node = node(clock.clone());
        let handler = Arc::new(ReentrantHandler::default());
        assert!(handler.node.set(node.clone()).is_ok());
        node.register_handler(OperationType::WalletRegistration, handler.clone())
            .unwrap();

        let id = submit(&node, OperationType::WalletRegistration, b"wallet");
        clock.advance(HOUR);
        let outcome = node.execute(ADMIN, id).unwrap();

        assert!(!outcome.success);
        assert_eq!(
            *handler.observed.lock(),
            vec![WatchdogError::Reentrant; 3]
        );
        assert!(!node.is_paused().unwrap());
        assert!(node.operation(&id).unwrap().unwrap().is_executed());
        assert!(!node.guard.is_dispatching());
    }

    #[test]
    fn test_concurrent_submissions() {
        let clock = Arc::new(ManualClock::new(0));
        let node = node(clock);

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let node = node.clone();
                thread::spawn(move || submit(&node, OperationType::ReserveAttestation, &[i, 1]))
            })
            .collect();
        let mut ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn test_persists_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let id = {
            let store = Arc::new(ConsensusStore::open(dir.path()).unwrap());
            let node = node(clock.clone()).with_store(store).unwrap();
            let id = submit(&node, OperationType::StatusChange, b"p");
            node.challenge(node.watchdogs().unwrap()[0], id, b"e".to_vec())
                .unwrap();
            id
        };

        let store = Arc::new(ConsensusStore::open(dir.path()).unwrap());
        let recovered =
            WatchdogNode::recover(store, Arc::new(BlockCommitments::default()), clock)
                .unwrap()
                .unwrap();
        let op = recovered.operation(&id).unwrap().unwrap();
        assert_eq!(op.objection_count, 1);
    }

    #[test]
    fn test_failed_write_leaves_state_untouched() {
        let store = Arc::new(FlakyStore::default());
        let node = node(Arc::new(ManualClock::new(0)))
            .with_store(store.clone())
            .unwrap();
        let mut rx = node.subscribe().unwrap();
        let before = node.read(|engine, _| engine.snapshot()).unwrap();

        store.allow(Some(0));
        let payload = b"qc:0x01:Revoked";
        let primary = node
            .select_primary(OperationType::StatusChange, payload)
            .unwrap()
            .validator;
        assert!(matches!(
            node.submit(primary, OperationType::StatusChange, payload.to_vec()),
            Err(NodeError::Storage(_))
        ));
        assert!(matches!(node.pause(ADMIN), Err(NodeError::Storage(_))));

        assert_eq!(node.read(|engine, _| engine.snapshot()).unwrap(), before);
        assert!(node.events().unwrap().is_empty());
        assert!(rx.try_recv().is_err());

        // a retry once the store recovers creates exactly one operation
        store.allow(None);
        let id = node
            .submit(primary, OperationType::StatusChange, payload.to_vec())
            .unwrap();
        let ids: Vec<Hash> = store.last().unwrap().operations.into_keys().collect();
        assert_eq!(ids, vec![id]);
        assert!(!node.is_paused().unwrap());
        assert!(matches!(
            rx.try_recv(),
            Ok(WatchdogEvent::ProposerSelected { .. })
        ));
    }

    #[test]
    fn test_failed_write_blocks_dispatch() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(FlakyStore::default());
        let node = node(clock.clone()).with_store(store.clone()).unwrap();
        let handler = Arc::new(CountingHandler::default());
        node.register_handler(OperationType::WalletRegistration, handler.clone())
            .unwrap();
        let id = submit(&node, OperationType::WalletRegistration, b"wallet");
        clock.advance(HOUR);

        store.allow(Some(0));
        assert!(matches!(node.execute(ADMIN, id), Err(NodeError::Storage(_))));
        assert_eq!(*handler.calls.lock(), 0);
        assert_eq!(
            node.operation_state(&id).unwrap(),
            Some(OperationState::Executable)
        );

        store.allow(None);
        assert!(node.execute(ADMIN, id).unwrap().success);
        assert_eq!(*handler.calls.lock(), 1);
    }

    #[test]
    fn test_executed_mark_is_saved_before_dispatch() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(FlakyStore::default());
        let node = node(clock.clone()).with_store(store.clone()).unwrap();
        let handler = Arc::new(CountingHandler::default());
        node.register_handler(OperationType::StatusChange, handler.clone())
            .unwrap();
        let id = submit(&node, OperationType::StatusChange, b"qc:0x02:Active");
        clock.advance(HOUR);

        // the executed mark is written, the outcome write fails
        store.allow(Some(1));
        assert!(node.execute(ADMIN, id).unwrap().success);
        assert_eq!(*handler.calls.lock(), 1);
        let saved = store.last().unwrap();
        assert!(saved.operations[&id].is_executed());
        assert_eq!(saved.operations[&id].outcome().map(|o| o.success), Some(false));

        store.allow(None);
        assert!(matches!(
            node.execute(ADMIN, id),
            Err(NodeError::Consensus(WatchdogError::AlreadyExecuted(_)))
        ));
        assert_eq!(*handler.calls.lock(), 1);

        // the next save carries the recorded outcome
        node.pause(ADMIN).unwrap();
        let saved = store.last().unwrap();
        assert_eq!(saved.operations[&id].outcome().map(|o| o.success), Some(true));
    }

    #[test]
    fn test_snapshots_stay_within_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConsensusStore::open(dir.path()).unwrap());
        let node = node(Arc::new(ManualClock::new(0)))
            .with_store(store.clone())
            .unwrap();

        for i in 0..50u8 {
            submit(&node, OperationType::ReserveAttestation, &[i, 2]);
        }

        assert_eq!(store.latest_sequence().unwrap(), Some(50));
        let kept = (0..=50u64)
            .filter(|sequence| store.load_snapshot(*sequence).unwrap().is_some())
            .count();
        assert_eq!(kept as u64, DEFAULT_SNAPSHOT_RETENTION);
        assert!(store.load_snapshot(0).unwrap().is_none());
        assert_eq!(
            store.load_latest_snapshot().unwrap().unwrap().operations.len(),
            50
        );
    }

    #[test]
    fn test_retention_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConsensusStore::open(dir.path()).unwrap());
        let node = node(Arc::new(ManualClock::new(0)))
            .with_retention(2)
            .with_store(store.clone())
            .unwrap();

        for i in 0..5u8 {
            submit(&node, OperationType::StatusChange, &[i, 3]);
        }
        assert_eq!(store.latest_sequence().unwrap(), Some(5));
        assert!(store.load_snapshot(3).unwrap().is_none());
        assert!(store.load_snapshot(4).unwrap().is_some());
    }

    #[test]
    fn test_recover_from_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConsensusStore::open(dir.path()).unwrap());
        let recovered = WatchdogNode::recover(
            store,
            Arc::new(BlockCommitments::default()),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        assert!(recovered.is_none());
    }
}
