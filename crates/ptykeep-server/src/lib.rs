//! ptykeep-server: the session runtime.
//!
//! - [`supervisor`]: live processes on PTYs, output capture, input, exit.
//! - [`lifecycle`]: durable session records, access control and GC.
//! - [`binder`]: sequences the two for spawn, terminate and relaunch.
//! - [`config`]: TOML configuration and component wiring.

pub mod binder;
pub mod config;
pub mod lifecycle;
pub mod supervisor;

pub use binder::{
    BinderConfig, BoundSession, ReconcileReport, SessionBinder, SpawnRequest, SpawnedSession,
};
pub use config::{KeepConfig, Overrides};
pub use lifecycle::{CleanupReport, LifecycleManager};
pub use supervisor::{ProcessStatus, Supervisor};
