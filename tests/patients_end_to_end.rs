//! Patient CRUD and health probes end to end over a mocked backend.
//!
//! - Full create → read → update → delete flow with an authenticated client.
//! - Updating a record refreshes its subscribed detail view.
//! - The health probe polls on its refetch interval while subscribed.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use time::macros::date;
use uuid::Uuid;

use cartella::api_types::{PatientRequest, PatientStatus};
use cartella::cache::QueryStatus;
use cartella::config::Settings;
use cartella::infra::storage::{MemoryTokenStore, PersistedSession, TokenStore};
use cartella::Client;

fn client_for(server: &MockServer, configure: impl FnOnce(&mut Settings)) -> Client {
    let mut settings = Settings::default();
    settings.api.base_url = format!("{}/api/v1", server.base_url());
    configure(&mut settings);
    let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
    Client::with_store(settings, store).expect("client")
}

async fn authenticated_client(server: &MockServer) -> Client {
    let mut settings = Settings::default();
    settings.api.base_url = format!("{}/api/v1", server.base_url());
    let store = Arc::new(MemoryTokenStore::new());
    store
        .save(&PersistedSession {
            token: "tok-abc".to_string(),
            identity: cartella::api_types::Identity::new("admin", vec!["ADMIN".to_string()]),
        })
        .await
        .expect("seed");
    let store: Arc<dyn TokenStore> = store;
    let client = Client::with_store(settings, store).expect("client");
    client.start().await;
    client
}

fn patient_json(id: Uuid, first_name: &str, phone: Option<&str>) -> serde_json::Value {
    let mut value = json!({
        "id": id,
        "firstName": first_name,
        "lastName": "Hopper",
        "dateOfBirth": "1906-12-09",
        "medicalRecordNumber": "MRN-0042",
        "status": "ACTIVE",
        "createdAt": "2024-01-15T10:30:00",
        "updatedAt": "2024-01-15T10:30:00"
    });
    if let Some(phone) = phone {
        value["phone"] = json!(phone);
    }
    value
}

fn request(first_name: &str, phone: Option<&str>) -> PatientRequest {
    PatientRequest {
        first_name: first_name.to_string(),
        last_name: "Hopper".to_string(),
        date_of_birth: date!(1906 - 12 - 09),
        email: None,
        phone: phone.map(str::to_string),
        address: None,
    }
}

#[tokio::test]
async fn full_crud_flow() {
    let server = MockServer::start_async().await;
    let id = Uuid::new_v4();

    let create = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/v1/patients")
                .header("authorization", "Bearer tok-abc")
                .json_body_includes(r#"{"firstName": "Grace"}"#);
            then.status(201).json_body(json!({
                "success": true,
                "message": "Patient created successfully",
                "data": patient_json(id, "Grace", None)
            }));
        })
        .await;
    let get = server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/api/v1/patients/{id}"));
            then.status(200)
                .json_body(json!({"success": true, "data": patient_json(id, "Grace", None)}));
        })
        .await;
    let update = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path(format!("/api/v1/patients/{id}"))
                .json_body_includes(r#"{"phone": "555-0100"}"#);
            then.status(200).json_body(json!({
                "success": true,
                "data": patient_json(id, "Grace", Some("555-0100"))
            }));
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE).path(format!("/api/v1/patients/{id}"));
            then.status(200)
                .json_body(json!({"success": true, "message": "Patient deleted", "data": null}));
        })
        .await;

    let client = authenticated_client(&server).await;

    // 1. Create
    let created = client
        .patients()
        .create(&request("Grace", None))
        .await
        .expect("create");
    assert_eq!(created.id, id);
    assert_eq!(created.status, PatientStatus::Active);

    // 2. Read the detail view
    let mut detail = client.patients().get(id);
    let result = detail.settled().await;
    assert_eq!(result.status, QueryStatus::Success);
    assert!(result.data.expect("patient").phone.is_none());

    // 3. Update refreshes the subscribed detail view through invalidation.
    //    Swap the backend state first so the refetch sees the new record.
    get.delete_async().await;
    let get_updated = server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/api/v1/patients/{id}"));
            then.status(200).json_body(json!({
                "success": true,
                "data": patient_json(id, "Grace", Some("555-0100"))
            }));
        })
        .await;
    client
        .patients()
        .update(id, &request("Grace", Some("555-0100")))
        .await
        .expect("update");
    let refreshed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let result = detail.settled().await;
            if let Some(patient) = result.data
                && patient.phone.is_some()
            {
                return patient;
            }
            assert!(detail.changed().await);
        }
    })
    .await
    .expect("detail refreshed");
    assert_eq!(refreshed.phone.as_deref(), Some("555-0100"));
    drop(detail);

    // 4. Delete
    client.patients().delete(id).await.expect("delete");

    create.assert_async().await;
    update.assert_async().await;
    delete.assert_async().await;
    get_updated.assert_async().await;
}

#[tokio::test]
async fn delete_accepts_no_content_responses() {
    let server = MockServer::start_async().await;
    let id = Uuid::new_v4();
    server
        .mock_async(|when, then| {
            when.method(DELETE).path(format!("/api/v1/patients/{id}"));
            then.status(204);
        })
        .await;

    let client = client_for(&server, |_| {});
    client.patients().delete(id).await.expect("delete");
}

#[tokio::test]
async fn health_probe_polls_on_its_interval() {
    let server = MockServer::start_async().await;
    let health = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v1/health");
            then.status(200)
                .json_body(json!({"status": "UP", "timestamp": "2024-01-15T10:30:00"}));
        })
        .await;

    let client = client_for(&server, |settings| {
        settings.cache.health_refetch_interval_ms = 50;
    });

    let mut probe = client.health().health();
    let result = probe.settled().await;
    assert_eq!(result.status, QueryStatus::Success);
    assert!(result.data.expect("status").is_up());

    // The poller keeps hitting the backend while the subscription is alive.
    tokio::time::timeout(Duration::from_secs(2), async {
        while health.hits_async().await < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("interval polling");

    // Dropping the subscription cancels the poller.
    drop(probe);
    tokio::time::sleep(Duration::from_millis(120)).await;
    let after_drop = health.hits_async().await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(health.hits_async().await, after_drop);
}
