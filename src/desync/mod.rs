//! Desynchronization of the first outbound chunk
//!
//! [`plan`] is pure and shared by the socket path ([`DesyncEngine`]) and the
//! packet-filter path ([`crate::filter::DesyncFilter`]).
//!
//! | Method | Writes |
//! |---|---|
//! | SPLIT | `[0,k)`, delay, `[k,len)` |
//! | SPLIT_REVERSE | `[k,len)`, delay, `[0,k)` |
//! | DISORDER | N pieces ascending, delay after each |
//! | DISORDER_REVERSE | N pieces descending, no delay after the last |
//! | FAKE | decoy record(s), then SPLIT |

mod engine;
mod plan;

pub use engine::{DesyncAction, DesyncDecision, DesyncEngine, DesyncOutcome};
pub use plan::{partition, plan, split_point, Fragment, MAX_SPLIT_COUNT, MIN_SPLIT_COUNT};
