//! Shared test harness: a tempfile-backed store, a scriptable mock BMC, and
//! the full router driven through `tower::ServiceExt::oneshot`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use clap::Parser;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use server_core::kernel::bmc::testing::{MockBmc, MockConnector};
use server_core::kernel::secrets::SecretCipher;
use server_core::kernel::store::{Job, ServerRecord, Store};
use server_core::kernel::ServerDeps;
use server_core::server::build_app;
use server_core::Config;

pub struct TestHarness {
    pub deps: Arc<ServerDeps>,
    pub bmc: Arc<MockBmc>,
    pub app: Router,
    _tempdir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Build a harness with config tweaks applied on top of the fast test
    /// defaults.
    pub async fn with_config(mutate: impl FnOnce(&mut Config)) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();

        let tempdir = tempfile::tempdir().expect("create tempdir");
        let mut config = test_config(tempdir.path());
        mutate(&mut config);

        let secrets = SecretCipher::from_passphrase(config.secrets_passphrase.as_deref());
        let store = Arc::new(
            Store::open(&config.db_path, secrets)
                .await
                .expect("open test store"),
        );

        let bmc = MockBmc::new();
        let connector = MockConnector::new(bmc.clone());
        let deps = ServerDeps::new(config, store, connector);
        let app = build_app(deps.clone());

        Self {
            deps,
            bmc,
            app,
            _tempdir: tempdir,
        }
    }

    pub fn store(&self) -> &Store {
        &self.deps.store
    }

    pub async fn upsert_server(&self, serial: &str) -> ServerRecord {
        let record = ServerRecord::builder()
            .serial(serial)
            .bmc_address("https://10.0.0.9")
            .bmc_username("root")
            .bmc_password("calvin")
            .build();
        record.upsert(self.store()).await.expect("upsert server");
        record
    }

    /// Create a queued job through the public API and return its id.
    pub async fn create_job(&self, serial: &str, recipe: Value) -> Uuid {
        let (status, body) = self
            .post_json(
                "/api/v1/jobs",
                serde_json::json!({"server_serial": serial, "recipe": recipe}),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "create job: {body}");
        body["job_id"]
            .as_str()
            .expect("job_id in response")
            .parse()
            .expect("job_id is a uuid")
    }

    pub async fn get_job(&self, id: Uuid) -> Job {
        Job::find_by_id(id, self.store())
            .await
            .expect("find job")
            .expect("job exists")
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body), &[]).await
    }

    pub async fn post_json_with_headers(
        &self,
        uri: &str,
        body: Value,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body), headers).await
    }

    pub async fn put_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::PUT, uri, Some(body), &[]).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None, &[]).await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::DELETE, uri, None, &[]).await
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let (status, bytes) = self.request_raw(method, uri, body, headers).await;
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn request_raw(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Bytes) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");

        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("router never errors");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        (status, bytes)
    }
}

/// Poll until `predicate` holds, failing the test after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, what: &str, predicate: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn minimal_recipe() -> Value {
    serde_json::json!({
        "task_target": "install-linux.target",
        "target_disk": "/dev/sda"
    })
}

fn test_config(dir: &Path) -> Config {
    let db = dir.join("test.db");
    let storage = dir.join("data");
    Config::parse_from([
        "server",
        "--db-path",
        db.to_str().expect("utf-8 tempdir"),
        "--storage-root",
        storage.to_str().expect("utf-8 tempdir"),
        "--media-base-url",
        "http://ctl.test",
        "--maintenance-iso-url",
        "http://ctl.test/media/maintenance.iso",
        "--workers",
        "1",
        "--poll-interval-ms",
        "25",
        "--bmc-retries",
        "2",
        "--lease-ttl-secs",
        "60",
        "--job-stuck-timeout-secs",
        "60",
    ])
}
