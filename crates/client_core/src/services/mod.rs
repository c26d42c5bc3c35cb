//! Typed CRUD over the backend's entity tables.

use std::{fmt::Display, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};

use crate::backend::{BackendClient, BackendError};

pub mod companies;
pub mod connections;
pub mod messages;
pub mod plans;
pub mod templates;

pub use companies::CompanyService;
pub use connections::ConnectionService;
pub use messages::{count_recipients, MessageService};
pub use plans::PlanService;
pub use templates::{extract_variables, TemplateService};

const NEWEST_FIRST: &str = "created_at.desc";

pub(crate) fn eq(value: impl Display) -> String {
    format!("eq.{value}")
}

/// One backend table, addressed by row id.
#[derive(Clone)]
pub(crate) struct Table {
    backend: Arc<BackendClient>,
    name: &'static str,
}

impl Table {
    pub(crate) fn new(backend: Arc<BackendClient>, name: &'static str) -> Self {
        Self { backend, name }
    }

    pub(crate) fn backend(&self) -> &BackendClient {
        &self.backend
    }

    /// Rows matching `filters`, newest first.
    pub(crate) async fn list<T: DeserializeOwned>(
        &self,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, BackendError> {
        let mut params = filters.to_vec();
        params.push(("order", NEWEST_FIRST.to_string()));
        self.backend.select(self.name, &params).await
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, id: impl Display) -> Result<T, BackendError> {
        self.backend.select_one(self.name, &[("id", eq(id))]).await
    }

    pub(crate) async fn create<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        body: &B,
    ) -> Result<T, BackendError> {
        self.backend.insert(self.name, body).await
    }

    pub(crate) async fn update<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        id: impl Display,
        body: &B,
    ) -> Result<T, BackendError> {
        self.backend.update(self.name, &[("id", eq(id))], body).await
    }

    pub(crate) async fn delete(&self, id: impl Display) -> Result<(), BackendError> {
        self.backend.delete(self.name, &[("id", eq(id))]).await
    }
}

pub(crate) fn require_text(field: &str, value: &str) -> Result<(), BackendError> {
    if value.trim().is_empty() {
        return Err(BackendError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

pub(crate) fn require_optional_text(field: &str, value: Option<&str>) -> Result<(), BackendError> {
    value.map_or(Ok(()), |value| require_text(field, value))
}

/// All entity services over one shared backend client.
#[derive(Clone)]
pub struct Services {
    pub companies: CompanyService,
    pub connections: ConnectionService,
    pub messages: MessageService,
    pub plans: PlanService,
    pub templates: TemplateService,
}

impl Services {
    pub fn new(backend: Arc<BackendClient>) -> Self {
        Self {
            companies: CompanyService::new(Arc::clone(&backend)),
            connections: ConnectionService::new(Arc::clone(&backend)),
            messages: MessageService::new(Arc::clone(&backend)),
            plans: PlanService::new(Arc::clone(&backend)),
            templates: TemplateService::new(backend),
        }
    }
}
