//! dabby-balance — load-balanced instance selection.
//!
//! Given the registry's live view, `Balancer::select` picks one eligible
//! instance according to the configured strategy and atomically claims a
//! connection slot on it. The returned `ConnectionGuard` releases the slot
//! (and any Suspect trial token) exactly once on drop, so the
//! acquire/release pairing holds on every exit path.
//!
//! Strategies are a closed enum resolved at configuration load; adding one
//! means adding a variant and an arm in `choose`, with no caller changes.

pub mod balancer;
pub mod error;

pub use balancer::{Balancer, ConnectionGuard};
pub use error::{BalanceError, BalanceResult};
