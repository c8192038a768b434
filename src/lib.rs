//! Trial and subscription integrity engine.
//!
//! Issues a stable per-installation device id, keeps the trial record in a
//! tamper-evident local store, reconciles it with the trial server, tracks
//! usage sessions and gates the partial refund window. Applications drive it
//! through [`EntitlementService`].

pub mod billing;
pub mod licensing;
mod logging;
pub mod usage;

pub use licensing::{BillableOutcome, EndedAccess, EngineConfig, EntitlementService, EntitlementServiceBuilder};
pub use licensing::{EntitlementError, TrialError, TrialState, TrialStatus};
pub use logging::{init_logging, DEFAULT_LOG_FILTER};
