//! Client core for the tenant administration console.
//!
//! [`backend::BackendClient`] talks to the hosted backend and implements
//! [`session_store::SessionStore`]; [`auth::AuthProvider`] runs the session
//! controller on top of it; [`context::AppContext`] carries both to
//! consumers alongside the entity [`services`].

pub mod auth;
pub mod backend;
pub mod config;
pub mod context;
pub mod services;
pub mod session_store;

pub use auth::{AuthHandle, AuthOperation, AuthPhase, AuthProvider, AuthState};
pub use backend::{BackendClient, BackendError};
pub use config::{load_settings, BackendConfig, ConfigError, Settings};
pub use context::AppContext;
pub use services::Services;
pub use session_store::{SessionStore, Subscription};

#[cfg(test)]
#[path = "tests/mock_backend.rs"]
pub(crate) mod mock_backend;
