//! Session persistence and the global session registry.
//!
//! Provides:
//! - `PersistedSession` - durable per-cwd session state with pure mutators
//! - `SessionStore` - crash-safe session file persistence
//! - `SessionRegistry` - global index of sessions by id and cwd

pub mod registry;
pub mod session;
pub mod store;

pub use registry::{RegistryEntry, RegistryError, RegistryFilter, SessionRegistry};
pub use session::{PersistedSession, SessionStatus, TaskSnapshot, TrackerState};
pub use store::{SessionStore, StoreError, SESSION_FILE_NAME};
