//! Communication campaigns and their delivery hand-off.

use std::{collections::HashSet, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use shared::{
    domain::{CompanyId, ConnectionId, GroupId, MessageId, MessageStatus, TemplateId},
    protocol::{ContactGroup, Message, MessageUpdate, NewMessage},
};
use tracing::{info, warn};

use super::{eq, require_optional_text, require_text, Table};
use crate::backend::{BackendClient, BackendError};

const TABLE: &str = "messages";
const GROUPS_TABLE: &str = "contact_groups";

#[derive(Debug, Serialize)]
struct DispatchRequest<'a> {
    message_id: MessageId,
    company_id: CompanyId,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_id: Option<ConnectionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    template_id: Option<TemplateId>,
    title: &'a str,
    content: &'a str,
    target_groups: &'a [GroupId],
}

#[derive(Clone)]
pub struct MessageService {
    table: Table,
    groups: Table,
}

impl MessageService {
    pub fn new(backend: Arc<BackendClient>) -> Self {
        Self {
            table: Table::new(Arc::clone(&backend), TABLE),
            groups: Table::new(backend, GROUPS_TABLE),
        }
    }

    pub async fn list(&self) -> Result<Vec<Message>, BackendError> {
        self.table.list(&[]).await
    }

    pub async fn list_for_company(&self, company_id: CompanyId) -> Result<Vec<Message>, BackendError> {
        self.table.list(&[("company_id", eq(company_id))]).await
    }

    pub async fn get(&self, id: MessageId) -> Result<Message, BackendError> {
        self.table.get(id).await
    }

    /// Estimated audience of `targets` within the company's contact groups.
    pub async fn estimate_recipients(
        &self,
        company_id: CompanyId,
        targets: &[GroupId],
    ) -> Result<u32, BackendError> {
        if targets.is_empty() {
            return Ok(0);
        }
        let groups: Vec<ContactGroup> = self
            .groups
            .list(&[("company_id", eq(company_id))])
            .await?;
        Ok(count_recipients(&groups, targets))
    }

    /// Creates a campaign with `recipient_count` set from the current estimate.
    pub async fn create(&self, message: &NewMessage) -> Result<Message, BackendError> {
        require_text("message title", &message.title)?;
        require_text("message content", &message.content)?;
        let mut message = message.clone();
        message.recipient_count = self
            .estimate_recipients(message.company_id, &message.target_groups)
            .await?;
        let created: Message = self.table.create(&message).await?;
        info!(
            message_id = %created.id,
            company_id = %created.company_id,
            recipients = created.recipient_count,
            "messages: created"
        );
        Ok(created)
    }

    /// Applies `patch`; a new `target_groups` list also refreshes `recipient_count`.
    pub async fn update(&self, id: MessageId, patch: &MessageUpdate) -> Result<Message, BackendError> {
        require_optional_text("message title", patch.title.as_deref())?;
        require_optional_text("message content", patch.content.as_deref())?;
        let Some(targets) = &patch.target_groups else {
            return self.table.update(id, patch).await;
        };
        let current = self.get(id).await?;
        let mut patch = patch.clone();
        patch.recipient_count = Some(self.estimate_recipients(current.company_id, targets).await?);
        self.table.update(id, &patch).await
    }

    pub async fn delete(&self, id: MessageId) -> Result<(), BackendError> {
        self.table.delete(id).await
    }

    /// Hands the campaign to the messaging connector.
    ///
    /// On acceptance the campaign moves to `sending`; if the connector call
    /// fails it is marked `failed` and the connector's error is returned.
    pub async fn dispatch(&self, id: MessageId) -> Result<Message, BackendError> {
        let message = self.get(id).await?;
        let backend = self.table.backend();
        let request = DispatchRequest {
            message_id: message.id,
            company_id: message.company_id,
            connection_id: message.connection_id,
            template_id: message.template_id,
            title: &message.title,
            content: &message.content,
            target_groups: &message.target_groups,
        };

        match backend
            .invoke_function::<_, Value>(backend.connector_function(), &request)
            .await
        {
            Ok(_) => {
                let updated = self.set_status(id, MessageStatus::Sending).await?;
                info!(message_id = %id, recipients = updated.recipient_count, "messages: dispatched");
                Ok(updated)
            }
            Err(err) => {
                warn!(message_id = %id, error = %err, "messages: connector rejected dispatch");
                if let Err(mark_err) = self.set_status(id, MessageStatus::Failed).await {
                    warn!(message_id = %id, error = %mark_err, "messages: failed to mark campaign failed");
                }
                Err(err)
            }
        }
    }

    async fn set_status(&self, id: MessageId, status: MessageStatus) -> Result<Message, BackendError> {
        let patch = MessageUpdate {
            status: Some(status),
            ..MessageUpdate::default()
        };
        self.table.update(id, &patch).await
    }
}

/// Sum of `member_count` over the distinct `targets` present in `groups`.
/// Unknown ids contribute nothing; the sum saturates at `u32::MAX`.
pub fn count_recipients(groups: &[ContactGroup], targets: &[GroupId]) -> u32 {
    let wanted: HashSet<GroupId> = targets.iter().copied().collect();
    let mut seen = HashSet::new();
    groups
        .iter()
        .filter(|group| wanted.contains(&group.id) && seen.insert(group.id))
        .fold(0u32, |total, group| total.saturating_add(group.member_count))
}

#[cfg(test)]
#[path = "../tests/messages_tests.rs"]
mod tests;
