//! Degraded-mode fallback
//!
//! Keeps user management available while the admin channel is down.

pub mod store;

pub use store::{DEFAULT_ROLE, DegradedStore, PLACEHOLDER_OWNER};
