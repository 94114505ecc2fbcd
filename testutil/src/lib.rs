//! Testing utilities for the watchdog workspace
//!
//! Provides:
//! - Random and property-based data generators
//! - Fixed identities for committees, attesters and admins

pub mod generators;
pub mod fixtures;

pub use generators::*;
pub use fixtures::*;
