//! Durable session lifecycle and access control.

pub mod access;
pub mod gc;
pub mod manager;
pub mod model;
pub mod store;

pub use access::AccessPolicy;
pub use gc::{CleanupReport, GcPolicy};
pub use manager::{LifecycleConfig, LifecycleManager, DEFAULT_EVENT_LIMIT, MAX_EVENT_LIMIT};
pub use model::{
    AccessMode, CreatedSession, Event, EventKind, IssuedAttachToken, IssuedOtp, JsonMap,
    NewSession, Session, SessionConfigUpdate, SessionFilter, SessionLaunch, SessionSource,
    SessionState,
};
pub use store::{BulkTransition, SessionStore, SqliteStore, StoreError};
