//! Session lifecycle.
//!
//! One [`SessionManager`] per client owns the authentication token and its
//! state machine: login through the Login rate scope, periodic keep-alive,
//! expiry on a SessionExpired verdict, and re-login.

mod keep_alive;
mod manager;
mod state;

pub use keep_alive::*;
pub use manager::*;
pub use state::{SessionSnapshot, SessionStatus};
