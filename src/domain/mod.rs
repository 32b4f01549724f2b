//! Domain layer - pure business logic with no I/O.
//!
//! This layer contains the core concepts of the throttling system:
//! - Throttle identity (`scope`, `key`)
//! - Multi-window admission policies
//! - The state and event records kept per throttle
//!
//! All types in this layer are pure and easily testable.

pub mod identity;
pub mod policy;
pub mod record;
