//! Explicit application scope handed to every consumer.
//!
//! The running [`AuthProvider`](crate::auth::AuthProvider) and the shared
//! backend client are passed down through an [`AppContext`] instead of living
//! in a global. A context built without a provider reports a
//! [`ConfigurationError`] when a consumer asks for the auth controller.

use std::sync::Arc;

use shared::error::ConfigurationError;

use crate::{auth::AuthHandle, backend::BackendClient, services::Services};

#[derive(Clone, Default)]
pub struct AppContext {
    auth: Option<AuthHandle>,
    backend: Option<Arc<BackendClient>>,
}

impl AppContext {
    pub fn new(auth: AuthHandle, backend: Arc<BackendClient>) -> Self {
        Self {
            auth: Some(auth),
            backend: Some(backend),
        }
    }

    /// A scope with no provider mounted.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn use_auth(&self) -> Result<&AuthHandle, ConfigurationError> {
        self.auth
            .as_ref()
            .ok_or(ConfigurationError::missing_provider("use_auth"))
    }

    pub fn services(&self) -> Result<Services, ConfigurationError> {
        self.backend
            .as_ref()
            .map(|backend| Services::new(Arc::clone(backend)))
            .ok_or(ConfigurationError::missing_provider("services"))
    }
}

#[cfg(test)]
#[path = "tests/context_tests.rs"]
mod tests;
