use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{CompanyId, ConnectionId, ConnectionStatus},
    protocol::{Connection, ConnectionUpdate, NewConnection},
};
use tracing::info;

use super::{eq, require_optional_text, require_text, Table};
use crate::backend::{BackendClient, BackendError};

const TABLE: &str = "connections";

#[derive(Clone)]
pub struct ConnectionService {
    table: Table,
}

impl ConnectionService {
    pub fn new(backend: Arc<BackendClient>) -> Self {
        Self {
            table: Table::new(backend, TABLE),
        }
    }

    pub async fn list(&self) -> Result<Vec<Connection>, BackendError> {
        self.table.list(&[]).await
    }

    pub async fn list_for_company(&self, company_id: CompanyId) -> Result<Vec<Connection>, BackendError> {
        self.table.list(&[("company_id", eq(company_id))]).await
    }

    pub async fn get(&self, id: ConnectionId) -> Result<Connection, BackendError> {
        self.table.get(id).await
    }

    pub async fn create(&self, connection: &NewConnection) -> Result<Connection, BackendError> {
        require_text("connection name", &connection.name)?;
        require_text("connection provider", &connection.provider)?;
        let created: Connection = self.table.create(connection).await?;
        info!(connection_id = %created.id, provider = %created.provider, "connections: created");
        Ok(created)
    }

    pub async fn update(&self, id: ConnectionId, patch: &ConnectionUpdate) -> Result<Connection, BackendError> {
        require_optional_text("connection name", patch.name.as_deref())?;
        require_optional_text("connection provider", patch.provider.as_deref())?;
        self.table.update(id, patch).await
    }

    /// Records a status change; moving to `connected` also stamps `last_sync_at`.
    pub async fn set_status(&self, id: ConnectionId, status: ConnectionStatus) -> Result<Connection, BackendError> {
        let patch = ConnectionUpdate {
            status: Some(status),
            last_sync_at: (status == ConnectionStatus::Connected).then(Utc::now),
            ..ConnectionUpdate::default()
        };
        let updated: Connection = self.table.update(id, &patch).await?;
        info!(connection_id = %id, status = status.as_str(), "connections: status changed");
        Ok(updated)
    }

    pub async fn delete(&self, id: ConnectionId) -> Result<(), BackendError> {
        self.table.delete(id).await
    }
}

#[cfg(test)]
#[path = "../tests/connections_tests.rs"]
mod tests;
