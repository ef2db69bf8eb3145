//! Wake-cycle coordination core for a battery-powered cellular sensor node.
//!
//! Hardware is reached only through the traits in [`host`]; everything else here is
//! plain logic that runs (and is tested) on the host.

pub mod combiner;
pub mod cycle;
pub mod history;
pub mod hooks;
pub mod host;
pub mod json;
pub mod persistent;
pub mod schedule;
pub mod settings;
mod sync;

pub use cycle::{CoordinatorConfig, CycleState, LogFlags, SleepCoordinator, SleepParameters};
pub use sync::StoreGuard;
