use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use leadflow_crm::store::FileCredentialStore;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    store: Arc<FileCredentialStore>,
    started_at: Instant,
}

impl HealthState {
    pub fn new(store: Arc<FileCredentialStore>) -> Self {
        Self { store, started_at: Instant::now() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub service: HealthCheck,
    pub credentials: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/", get(ping)).route("/health", get(health)).with_state(state)
}

/// One-line liveness answer for load balancers and uptime probes.
pub async fn ping() -> &'static str {
    "leadflow-server: lead conversation orchestrator is running"
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let credentials = credential_check(&state.store).await;
    let ready = credentials.status != "error";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        service: HealthCheck {
            status: "ready",
            detail: "leadflow-server runtime initialized".to_string(),
        },
        credentials,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

/// A missing file is a valid pre-bootstrap state, not a failure; only an
/// unreadable or corrupt file degrades the service.
async fn credential_check(store: &FileCredentialStore) -> HealthCheck {
    match store.load().await {
        Ok(Some(credentials)) => HealthCheck {
            status: "ready",
            detail: format!(
                "credentials on disk, access token expires {}",
                credentials.expires_at.to_rfc3339()
            ),
        },
        Ok(None) => HealthCheck {
            status: "bootstrap_required",
            detail: "no stored credentials; first token exchange pending".to_string(),
        },
        Err(error) => HealthCheck {
            status: "error",
            detail: format!("credential file unreadable: {error}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use chrono::{Duration, Utc};
    use leadflow_crm::store::{FileCredentialStore, StoredCredentials};
    use tempfile::TempDir;

    use crate::health::{health, ping, HealthState};

    fn state(store: FileCredentialStore) -> State<HealthState> {
        State(HealthState::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn health_reports_ready_with_stored_credentials() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileCredentialStore::new(dir.path().join("tokens.json"));
        store
            .persist(&StoredCredentials {
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: Utc::now() + Duration::hours(2),
            })
            .await
            .expect("persist");

        let (status, Json(payload)) = health(state(store)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.service.status, "ready");
        assert_eq!(payload.credentials.status, "ready");
    }

    #[tokio::test]
    async fn health_flags_missing_credentials_as_bootstrap_required() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileCredentialStore::new(dir.path().join("tokens.json"));

        let (status, Json(payload)) = health(state(store)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.credentials.status, "bootstrap_required");
    }

    #[tokio::test]
    async fn health_degrades_when_the_credential_file_is_unreadable() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("tokens.json");
        std::fs::create_dir(&path).expect("block the path with a directory");
        let store = FileCredentialStore::new(path);

        let (status, Json(payload)) = health(state(store)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.credentials.status, "error");
    }

    #[tokio::test]
    async fn ping_stays_one_line() {
        let answer = ping().await;
        assert!(!answer.contains('\n'));
        assert!(answer.contains("running"));
    }
}
