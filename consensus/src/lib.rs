//! Watchdog Operation Consensus
//!
//! Optimistic approval of privileged operations by a small committee:
//! - Unpredictable primary validator selection per operation
//! - Challenge windows that lengthen with each objection (4-tier escalation)
//! - Explicit approval quorums once objections pile up
//! - Timelocked emergency override with cancellation
//! - Exactly-once dispatch to per-type operation handlers

pub mod access;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod emergency;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod events;
pub mod node;
pub mod operation;
pub mod registry;
pub mod selector;
pub mod storage;

pub use access::{AccessControl, Role};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::WatchdogConfig;
pub use crypto::Hash;
pub use dispatch::{DispatchOutcome, HandlerError, OperationHandler};
pub use emergency::EmergencyAction;
pub use engine::{ConsensusSnapshot, PendingDispatch, WatchdogConsensus};
pub use error::{ErrorKind, WatchdogError};
pub use escalation::{EscalationLadder, EscalationTier};
pub use events::{EventLog, WatchdogEvent, DEFAULT_EVENT_CAPACITY};
pub use node::{NodeError, ReentrancyGuard, WatchdogNode};
pub use operation::{Operation, OperationState, OperationStatus, OperationType};
pub use registry::{AccountInspector, ExternallyOwned};
pub use selector::{BlockCommitments, EntropyPath, EntropySource, Selection};
pub use storage::{ConsensusStore, SnapshotStore, DEFAULT_SNAPSHOT_RETENTION};
