// Trial integrity: device identity, sealed local state, reconciliation with
// the trial server and the trial state machine.

pub mod api;
pub mod clock;
pub mod config;
pub mod device;
pub mod manager;
pub mod simulated;
pub mod storage;
pub mod sync;
pub mod trial;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use manager::{BillableOutcome, EndedAccess, EntitlementService, EntitlementServiceBuilder};
pub use types::*;
