use std::sync::Arc;

use shared::{
    domain::{CompanyId, CompanyStatus},
    protocol::{Company, CompanyUpdate, NewCompany},
};
use tracing::info;

use super::{eq, require_optional_text, require_text, Table};
use crate::backend::{BackendClient, BackendError};

const TABLE: &str = "companies";

#[derive(Clone)]
pub struct CompanyService {
    table: Table,
}

impl CompanyService {
    pub fn new(backend: Arc<BackendClient>) -> Self {
        Self {
            table: Table::new(backend, TABLE),
        }
    }

    pub async fn list(&self) -> Result<Vec<Company>, BackendError> {
        self.table.list(&[]).await
    }

    pub async fn list_by_status(&self, status: CompanyStatus) -> Result<Vec<Company>, BackendError> {
        self.table.list(&[("status", eq(status.as_str()))]).await
    }

    pub async fn get(&self, id: CompanyId) -> Result<Company, BackendError> {
        self.table.get(id).await
    }

    pub async fn create(&self, company: &NewCompany) -> Result<Company, BackendError> {
        require_text("company name", &company.name)?;
        validate_email(company.email.as_deref())?;
        let created: Company = self.table.create(company).await?;
        info!(company_id = %created.id, "companies: created");
        Ok(created)
    }

    pub async fn update(&self, id: CompanyId, patch: &CompanyUpdate) -> Result<Company, BackendError> {
        require_optional_text("company name", patch.name.as_deref())?;
        validate_email(patch.email.as_deref())?;
        self.table.update(id, patch).await
    }

    pub async fn delete(&self, id: CompanyId) -> Result<(), BackendError> {
        self.table.delete(id).await?;
        info!(company_id = %id, "companies: deleted");
        Ok(())
    }
}

fn validate_email(email: Option<&str>) -> Result<(), BackendError> {
    match email {
        Some(email) if !email.contains('@') => Err(BackendError::validation(format!(
            "company email '{email}' is not an email address"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[path = "../tests/companies_tests.rs"]
mod tests;
