//! ptykeep-core: shared building blocks for the ptykeep session runtime.
//!
//! Provides the error taxonomy used by every component, an injectable
//! clock, and the secret/code/token generation and hashing helpers behind
//! session access control.

pub mod clock;
pub mod error;
pub mod secret;

// Re-export commonly used items at crate root.
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorKind, KeepError, KeepResult};
pub use secret::{
    generate_id, generate_otp, generate_password, generate_token, hash_secret, secrets_match,
};
