use super::*;

use serde_json::json;

use crate::mock_backend::MockBackend;

fn service(backend: &MockBackend) -> CompanyService {
    CompanyService::new(Arc::new(backend.client()))
}

fn acme() -> NewCompany {
    NewCompany {
        name: "Acme Telecom".into(),
        email: Some("billing@acme.test".into()),
        status: CompanyStatus::Active,
        max_users: Some(25),
        ..NewCompany::default()
    }
}

#[tokio::test]
async fn create_then_get_round_trips_through_backend() {
    let backend = MockBackend::spawn().await;
    let companies = service(&backend);

    let created = companies.create(&acme()).await.expect("create");
    assert_eq!(created.name, "Acme Telecom");
    assert_eq!(created.max_users, Some(25));

    let fetched = companies.get(created.id).await.expect("get");
    assert_eq!(fetched, created);
    assert_eq!(backend.state.rows("companies").len(), 1);
}

#[tokio::test]
async fn list_by_status_filters_rows() {
    let backend = MockBackend::spawn().await;
    let companies = service(&backend);
    companies.create(&acme()).await.expect("active");
    companies
        .create(&NewCompany {
            name: "Dormant Ltd".into(),
            status: CompanyStatus::Suspended,
            ..NewCompany::default()
        })
        .await
        .expect("suspended");

    let suspended = companies
        .list_by_status(CompanyStatus::Suspended)
        .await
        .expect("list");
    assert_eq!(suspended.len(), 1);
    assert_eq!(suspended[0].name, "Dormant Ltd");
    assert_eq!(companies.list().await.expect("all").len(), 2);
}

#[tokio::test]
async fn update_patches_only_given_fields() {
    let backend = MockBackend::spawn().await;
    let companies = service(&backend);
    let created = companies.create(&acme()).await.expect("create");

    let updated = companies
        .update(
            created.id,
            &CompanyUpdate {
                status: Some(CompanyStatus::Inactive),
                ..CompanyUpdate::default()
            },
        )
        .await
        .expect("update");
    assert_eq!(updated.status, CompanyStatus::Inactive);
    assert_eq!(updated.name, created.name);
    assert!(updated.updated_at.is_some());
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_request() {
    let backend = MockBackend::spawn().await;
    let companies = service(&backend);

    let err = companies
        .create(&NewCompany {
            name: "   ".into(),
            ..NewCompany::default()
        })
        .await
        .expect_err("blank name");
    assert!(matches!(err, BackendError::Validation(_)));

    let err = companies
        .create(&NewCompany {
            email: Some("not-an-address".into()),
            ..acme()
        })
        .await
        .expect_err("bad email");
    assert!(matches!(err, BackendError::Validation(_)));
    assert!(backend.state.bearers().is_empty());
}

#[tokio::test]
async fn delete_missing_company_is_not_found() {
    let backend = MockBackend::spawn().await;
    backend.state.seed(
        "companies",
        vec![json!({ "id": CompanyId::new_random(), "name": "Other", "created_at": "2024-01-01T00:00:00Z" })],
    );
    let companies = service(&backend);

    let err = companies
        .delete(CompanyId::new_random())
        .await
        .expect_err("missing");
    assert!(matches!(err, BackendError::NotFound(_)));
    assert_eq!(backend.state.rows("companies").len(), 1);
}
