use std::sync::{Arc, LazyLock};

use regex::Regex;
use shared::{
    domain::{CompanyId, TemplateId},
    protocol::{NewTemplate, Template, TemplateUpdate},
};
use tracing::{debug, info};

use super::{eq, require_optional_text, require_text, Table};
use crate::backend::{BackendClient, BackendError};

const TABLE: &str = "templates";

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern compiles")
});

#[derive(Clone)]
pub struct TemplateService {
    table: Table,
}

impl TemplateService {
    pub fn new(backend: Arc<BackendClient>) -> Self {
        Self {
            table: Table::new(backend, TABLE),
        }
    }

    pub async fn list(&self) -> Result<Vec<Template>, BackendError> {
        self.table.list(&[]).await
    }

    pub async fn list_for_company(&self, company_id: CompanyId) -> Result<Vec<Template>, BackendError> {
        self.table.list(&[("company_id", eq(company_id))]).await
    }

    pub async fn get(&self, id: TemplateId) -> Result<Template, BackendError> {
        self.table.get(id).await
    }

    /// Creates a template; `variables` are taken from the content's
    /// `{{name}}` placeholders when the caller leaves them empty.
    pub async fn create(&self, template: &NewTemplate) -> Result<Template, BackendError> {
        require_text("template name", &template.name)?;
        require_text("template content", &template.content)?;
        let mut template = template.clone();
        if template.variables.is_empty() {
            template.variables = extract_variables(&template.content);
            debug!(count = template.variables.len(), "templates: extracted variables");
        }
        let created: Template = self.table.create(&template).await?;
        info!(template_id = %created.id, "templates: created");
        Ok(created)
    }

    pub async fn update(&self, id: TemplateId, patch: &TemplateUpdate) -> Result<Template, BackendError> {
        require_optional_text("template name", patch.name.as_deref())?;
        require_optional_text("template content", patch.content.as_deref())?;
        self.table.update(id, patch).await
    }

    pub async fn delete(&self, id: TemplateId) -> Result<(), BackendError> {
        self.table.delete(id).await
    }
}

/// Distinct `{{name}}` placeholder names in order of first appearance.
pub fn extract_variables(content: &str) -> Vec<String> {
    let mut variables: Vec<String> = Vec::new();
    for captures in PLACEHOLDER_REGEX.captures_iter(content) {
        let name = captures[1].trim();
        if !name.is_empty() && !variables.iter().any(|known| known == name) {
            variables.push(name.to_string());
        }
    }
    variables
}

#[cfg(test)]
#[path = "../tests/templates_tests.rs"]
mod tests;
