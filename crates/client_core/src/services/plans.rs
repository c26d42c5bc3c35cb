use std::sync::Arc;

use shared::{
    domain::PlanId,
    protocol::{NewPlan, Plan, PlanUpdate},
};
use tracing::info;

use super::{require_optional_text, require_text, Table};
use crate::backend::{BackendClient, BackendError};

const TABLE: &str = "plans";

/// Subscription plans. Feature lists are coerced to `Vec<String>` on every read.
#[derive(Clone)]
pub struct PlanService {
    table: Table,
}

impl PlanService {
    pub fn new(backend: Arc<BackendClient>) -> Self {
        Self {
            table: Table::new(backend, TABLE),
        }
    }

    pub async fn list(&self) -> Result<Vec<Plan>, BackendError> {
        self.table.list(&[]).await
    }

    pub async fn list_active(&self) -> Result<Vec<Plan>, BackendError> {
        self.table.list(&[("is_active", "eq.true".to_string())]).await
    }

    pub async fn get(&self, id: PlanId) -> Result<Plan, BackendError> {
        self.table.get(id).await
    }

    pub async fn create(&self, plan: &NewPlan) -> Result<Plan, BackendError> {
        require_text("plan name", &plan.name)?;
        validate_price(plan.price)?;
        let created: Plan = self.table.create(plan).await?;
        info!(plan_id = %created.id, price = created.price, "plans: created");
        Ok(created)
    }

    pub async fn update(&self, id: PlanId, patch: &PlanUpdate) -> Result<Plan, BackendError> {
        require_optional_text("plan name", patch.name.as_deref())?;
        if let Some(price) = patch.price {
            validate_price(price)?;
        }
        self.table.update(id, patch).await
    }

    pub async fn delete(&self, id: PlanId) -> Result<(), BackendError> {
        self.table.delete(id).await
    }
}

fn validate_price(price: f64) -> Result<(), BackendError> {
    if !price.is_finite() || price < 0.0 {
        return Err(BackendError::validation(format!(
            "plan price must be a non-negative amount, got {price}"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "../tests/plans_tests.rs"]
mod tests;
