//! Multi-Attester Reserve Oracle
//!
//! Collects balance attestations per subject and derives an outlier-resistant
//! median once enough fresh observations agree. Accepted values are published
//! to a reserve ledger and decay to `Stale` after the staleness bound.

pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod oracle;
pub mod resolver;

pub use collector::{Attestation, AttestationCollector};
pub use config::OracleConfig;
pub use error::OracleError;
pub use events::OracleEvent;
pub use ledger::{InMemoryReserveLedger, LedgerError, ReserveLedger};
pub use oracle::{ConsensusOutcome, ReserveData, ReserveOracle, ReserveStatus};
pub use resolver::{median, ConsensusResolver, RejectionReason};
