//! Controller state: records, runs, health, logs and persistence.

mod force;
mod logs;
mod persist;
mod state;

pub use force::ForceTarget;
pub use logs::{LogBuffer, LogEntry, LogLevel};
pub use persist::{PersistedState, read_state, write_state};
pub use state::{Snapshot, StateStore, StoreConfig};
