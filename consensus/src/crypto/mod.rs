// Cryptography module for watchdog consensus
//
// Signature verification is delegated to external validators; this module
// only provides the content hashing used for identifiers and proposer selection.

pub mod hash;

pub use hash::{hash_data, hash_fields, Hash, HashError, HASH_SIZE};
