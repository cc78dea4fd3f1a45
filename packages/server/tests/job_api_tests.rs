//! Job and server HTTP API behavior.

mod common;

use axum::http::StatusCode;
use common::harness::{minimal_recipe, TestHarness};
use serde_json::json;

#[tokio::test]
async fn create_job_returns_202_with_queued_status() {
    let h = TestHarness::new().await;
    h.upsert_server("SER-1").await;

    let (status, body) = h
        .post_json(
            "/api/v1/jobs",
            json!({"server_serial": "SER-1", "recipe": minimal_recipe()}),
        )
        .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["server_serial"], "SER-1");
    assert!(body["job_id"].as_str().is_some());
    assert!(body["created_at"].as_str().is_some());
}

#[tokio::test]
async fn create_job_for_unknown_server_is_404() {
    let h = TestHarness::new().await;

    let (status, body) = h
        .post_json(
            "/api/v1/jobs",
            json!({"server_serial": "NOPE", "recipe": minimal_recipe()}),
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn invalid_recipe_is_400_with_field_details() {
    let h = TestHarness::new().await;
    h.upsert_server("SER-1").await;

    let (status, body) = h
        .post_json("/api/v1/jobs", json!({"server_serial": "SER-1", "recipe": {}}))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_recipe");

    let details = body["details"].as_array().expect("details array");
    let required: Vec<&str> = details
        .iter()
        .filter(|d| d["message"].as_str().unwrap_or("").contains("required"))
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert!(required.contains(&"task_target"));
    assert!(required.contains(&"target_disk"));
}

#[tokio::test]
async fn non_object_recipe_reports_root_error() {
    let h = TestHarness::new().await;
    h.upsert_server("SER-1").await;

    let (status, body) = h
        .post_json("/api/v1/jobs", json!({"server_serial": "SER-1", "recipe": [1, 2]}))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["field"], "root");
}

#[tokio::test]
async fn get_job_returns_status_and_events() {
    let h = TestHarness::new().await;
    h.upsert_server("SER-1").await;
    let id = h.create_job("SER-1", minimal_recipe()).await;

    let (status, body) = h.get(&format!("/api/v1/jobs/{id}")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], id.to_string());
    assert_eq!(body["status"], "queued");
    assert_eq!(body["server_serial"], "SER-1");
    assert!(body.get("failed_step").is_none());
    assert!(body["last_update"].as_str().is_some());

    let events = body["events"].as_array().expect("events array");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["message"], "job accepted");
    assert_eq!(events[0]["level"], "info");
}

#[tokio::test]
async fn get_unknown_job_is_404() {
    let h = TestHarness::new().await;
    let (status, _) = h
        .get("/api/v1/jobs/7b4a3a52-54b3-44a7-92f5-3b6f0b3c8a11")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_jobs_filters_by_status() {
    let h = TestHarness::new().await;
    h.upsert_server("SER-1").await;
    h.create_job("SER-1", minimal_recipe()).await;
    h.create_job("SER-1", minimal_recipe()).await;

    let (status, body) = h.get("/api/v1/jobs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);

    let (_, body) = h.get("/api/v1/jobs?status=queued&limit=1").await;
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

    let (_, body) = h.get("/api/v1/jobs?status=failed").await;
    assert_eq!(body["jobs"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn server_upsert_and_get_hide_the_bmc_password() {
    let h = TestHarness::new().await;

    let (status, body) = h
        .put_json(
            "/api/v1/servers/SER-9",
            json!({
                "bmc_address": "https://10.0.0.9",
                "bmc_username": "root",
                "bmc_password": "calvin",
                "vendor": "dell"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["serial"], "SER-9");
    assert!(body.get("bmc_password").is_none());

    let (status, body) = h.get("/api/v1/servers/SER-9").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["vendor"], "dell");
    assert!(body.get("bmc_password").is_none());
}

#[tokio::test]
async fn server_delete_is_refused_while_jobs_reference_it() {
    let h = TestHarness::new().await;
    h.upsert_server("SER-1").await;
    h.create_job("SER-1", minimal_recipe()).await;

    let (status, body) = h.delete("/api/v1/servers/SER-1").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");

    // A server with no jobs deletes fine.
    h.upsert_server("SER-2").await;
    let (status, _) = h.delete("/api/v1/servers/SER-2").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = h.get("/api/v1/servers/SER-2").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_endpoints_answer_ok() {
    let h = TestHarness::new().await;

    let (status, body) = h.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = h.get("/readyz").await;
    assert_eq!(status, StatusCode::OK);
}
