//! HTTP surface of the lease coordinator.

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::auth::{AuthDecision, AuthPolicy};
use super::store::LeaseStore;
use crate::app::reaper_loop::LeaseReaper;
use crate::domain::{ClaimOutcome, HiveError, Lease, LeaseId};

#[derive(Clone)]
pub struct CoordinatorState {
    pub store: LeaseStore,
    pub auth: AuthPolicy,
    started_at: Instant,
}

impl CoordinatorState {
    pub fn new(store: LeaseStore, auth: AuthPolicy) -> Self {
        Self {
            store,
            auth,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: CoordinatorState) -> Router {
    let protected = Router::new()
        .route("/claim", post(claim))
        .route("/release/{resource_id}", delete(release))
        .route("/release/claim/{lease_id}", delete(release_by_lease))
        .route("/extend/{resource_id}", post(extend))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .route("/status/{resource_id}", get(status))
        .route("/reservations", get(reservations))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind, serve until `shutdown` resolves, and run the expiry sweeper alongside.
pub async fn serve<F>(
    addr: SocketAddr,
    state: CoordinatorState,
    sweep_interval: Duration,
    shutdown: F,
) -> Result<(), HiveError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| HiveError::Config(format!("cannot bind {addr}: {e}")))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let reaper = tokio::spawn(LeaseReaper::new(state.store.clone(), sweep_interval).run(stop_rx));

    if !state.auth.is_enforced() {
        warn!("coordinator running without authentication");
    }
    info!(%addr, "lease coordinator listening");

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;

    let _ = stop_tx.send(true);
    if let Err(e) = reaper.await {
        warn!(error = %e, "lease reaper did not shut down cleanly");
    }
    info!("lease coordinator stopped");

    served.map_err(|e| HiveError::CoordinatorUnavailable(format!("server error: {e}")))
}

async fn require_bearer(
    State(state): State<CoordinatorState>,
    request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match state.auth.authorize(authorization) {
        AuthDecision::Allow => next.run(request).await,
        AuthDecision::Unauthorized(message) => {
            let mut response =
                (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response();
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            response
        }
        AuthDecision::Misconfigured => {
            warn!("authentication required but no API key configured; rejecting request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "server misconfiguration: API key not set but authentication is required"
                })),
            )
                .into_response()
        }
    }
}

/// HiveError rendered as `{error}` with a matching status code.
struct ApiError(HiveError);

impl From<HiveError> for ApiError {
    fn from(err: HiveError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HiveError::Validation(_) => StatusCode::BAD_REQUEST,
            HiveError::NotFound(_) => StatusCode::NOT_FOUND,
            HiveError::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    #[serde(alias = "project_id")]
    resource_id: String,
    #[serde(alias = "agent_name")]
    holder: String,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ClaimQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct ClaimResponse {
    success: bool,
    lease_id: LeaseId,
    resource_id: String,
    holder: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ConflictResponse {
    success: bool,
    error: String,
    current_owner: String,
    claimed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

async fn claim(
    State(state): State<CoordinatorState>,
    Query(query): Query<ClaimQuery>,
    Json(request): Json<ClaimRequest>,
) -> Result<Response, ApiError> {
    let ttl = request.ttl_seconds.map(Duration::from_secs);
    let outcome = state
        .store
        .claim(&request.resource_id, &request.holder, ttl, query.force)
        .await?;

    Ok(match outcome {
        ClaimOutcome::Granted(lease) => Json(ClaimResponse {
            success: true,
            lease_id: lease.lease_id,
            resource_id: lease.resource_id,
            holder: lease.holder,
            created_at: lease.created_at,
            expires_at: lease.expires_at,
        })
        .into_response(),
        ClaimOutcome::Conflict {
            current_holder,
            claimed_at,
            expires_at,
        } => (
            StatusCode::CONFLICT,
            Json(ConflictResponse {
                success: false,
                error: "resource already claimed".to_string(),
                current_owner: current_holder,
                claimed_at,
                expires_at,
            }),
        )
            .into_response(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub message: String,
}

async fn release(
    State(state): State<CoordinatorState>,
    Path(resource_id): Path<String>,
) -> Json<ReleaseResponse> {
    let released = state.store.release_resource(&resource_id).await.is_some();
    let message = if released {
        format!("resource '{resource_id}' released")
    } else {
        format!("no active claim found for '{resource_id}'")
    };
    Json(ReleaseResponse {
        success: released,
        resource_id: Some(resource_id),
        message,
    })
}

async fn release_by_lease(
    State(state): State<CoordinatorState>,
    Path(lease_id): Path<String>,
) -> Json<ReleaseResponse> {
    let released = match lease_id.parse::<LeaseId>() {
        Ok(id) => state.store.release_by_id(id).await,
        Err(_) => None,
    };
    Json(match released {
        Some(lease) => ReleaseResponse {
            success: true,
            resource_id: Some(lease.resource_id),
            message: format!("lease '{lease_id}' released"),
        },
        None => ReleaseResponse {
            success: false,
            resource_id: None,
            message: format!("no lease found with id '{lease_id}'"),
        },
    })
}

#[derive(Debug, Default, Deserialize)]
struct ExtendQuery {
    ttl_seconds: Option<u64>,
}

async fn extend(
    State(state): State<CoordinatorState>,
    Path(resource_id): Path<String>,
    Query(query): Query<ExtendQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let lease = state
        .store
        .extend(&resource_id, query.ttl_seconds.map(Duration::from_secs))
        .await?;
    Ok(Json(json!({
        "success": true,
        "resource_id": resource_id,
        "new_expires_at": lease.expires_at,
    })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub resource_id: String,
    pub is_claimed: bool,
    #[serde(default)]
    pub lease: Option<Lease>,
}

async fn status(
    State(state): State<CoordinatorState>,
    Path(resource_id): Path<String>,
) -> Json<StatusResponse> {
    let lease = state.store.status(&resource_id).await;
    Json(StatusResponse {
        resource_id,
        is_claimed: lease.is_some(),
        lease,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReservationsResponse {
    pub count: usize,
    pub reservations: Vec<Lease>,
}

async fn reservations(State(state): State<CoordinatorState>) -> Json<ReservationsResponse> {
    let reservations = state.store.list().await;
    Json(ReservationsResponse {
        count: reservations.len(),
        reservations,
    })
}

async fn health(State(state): State<CoordinatorState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "active_claims": state.store.active_count().await,
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::store::LeaseSettings;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(auth: AuthPolicy) -> Router {
        router(CoordinatorState::new(
            LeaseStore::new(LeaseSettings::default()),
            auth,
        ))
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Option<HeaderValue>, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let challenge = response.headers().get(header::WWW_AUTHENTICATE).cloned();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, challenge, value)
    }

    fn claim_body(resource: &str, holder: &str) -> Option<Value> {
        Some(json!({ "resource_id": resource, "holder": holder }))
    }

    #[tokio::test]
    async fn claim_then_conflict_reports_current_owner() {
        let app = app(AuthPolicy::open());

        let (status, _, body) =
            send(&app, Method::POST, "/claim", claim_body("t1", "w1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["holder"], "w1");
        assert!(body["lease_id"].as_str().unwrap().starts_with("lease-"));

        let (status, _, body) =
            send(&app, Method::POST, "/claim", claim_body("t1", "w2"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["current_owner"], "w1");
        assert!(body["expires_at"].is_string());
    }

    #[tokio::test]
    async fn forced_claim_takes_over() {
        let app = app(AuthPolicy::open());
        send(&app, Method::POST, "/claim", claim_body("t1", "w1"), None).await;

        let (status, _, body) = send(
            &app,
            Method::POST,
            "/claim?force=true",
            claim_body("t1", "w2"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["holder"], "w2");
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_bad_request() {
        let app = app(AuthPolicy::open());
        let (status, _, body) = send(
            &app,
            Method::POST,
            "/claim",
            Some(json!({ "resource_id": "t1", "holder": "w1", "ttl_seconds": 0 })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("ttl_seconds"));
    }

    #[tokio::test]
    async fn release_status_and_reservations() {
        let app = app(AuthPolicy::open());
        send(&app, Method::POST, "/claim", claim_body("t1", "w1"), None).await;
        send(&app, Method::POST, "/claim", claim_body("t2", "w1"), None).await;

        let (_, _, body) = send(&app, Method::GET, "/reservations", None, None).await;
        assert_eq!(body["count"], 2);

        let (status, _, body) = send(&app, Method::DELETE, "/release/t1", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (_, _, body) = send(&app, Method::GET, "/status/t1", None, None).await;
        assert_eq!(body["is_claimed"], false);
        assert!(body["lease"].is_null());

        let (_, _, body) = send(&app, Method::DELETE, "/release/t1", None, None).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn release_by_lease_id() {
        let app = app(AuthPolicy::open());
        let (_, _, body) = send(&app, Method::POST, "/claim", claim_body("t1", "w1"), None).await;
        let lease_id = body["lease_id"].as_str().unwrap().to_string();

        let (_, _, body) = send(
            &app,
            Method::DELETE,
            &format!("/release/claim/{lease_id}"),
            None,
            None,
        )
        .await;
        assert_eq!(body["success"], true);
        assert_eq!(body["resource_id"], "t1");

        let (_, _, body) =
            send(&app, Method::DELETE, "/release/claim/not-a-lease", None, None).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn extend_unknown_resource_is_not_found() {
        let app = app(AuthPolicy::open());
        let (status, _, body) =
            send(&app, Method::POST, "/extend/nope?ttl_seconds=60", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        send(&app, Method::POST, "/claim", claim_body("t1", "w1"), None).await;
        let (status, _, body) =
            send(&app, Method::POST, "/extend/t1?ttl_seconds=60", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["new_expires_at"].is_string());
    }

    #[tokio::test]
    async fn mutating_calls_need_bearer_when_secret_set() {
        let app = app(AuthPolicy::new(true, Some("s3cret")));

        let (status, challenge, _) =
            send(&app, Method::POST, "/claim", claim_body("t1", "w1"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(challenge.unwrap(), "Bearer");

        let (status, _, _) = send(
            &app,
            Method::POST,
            "/claim",
            claim_body("t1", "w1"),
            Some("wrong"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = send(
            &app,
            Method::POST,
            "/claim",
            claim_body("t1", "w1"),
            Some("s3cret"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = send(&app, Method::DELETE, "/release/t1", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn read_endpoints_stay_open() {
        let app = app(AuthPolicy::new(true, Some("s3cret")));
        for uri in ["/health", "/status/t1", "/reservations"] {
            let (status, _, _) = send(&app, Method::GET, uri, None, None).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
        }
        let (_, _, body) = send(&app, Method::GET, "/health", None, None).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["active_claims"], 0);
    }

    #[tokio::test]
    async fn required_auth_without_secret_fails_closed() {
        let app = app(AuthPolicy::new(true, None));
        let (status, _, body) = send(
            &app,
            Method::POST,
            "/claim",
            claim_body("t1", "w1"),
            Some("anything"),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("misconfiguration"));
    }

    #[tokio::test]
    async fn legacy_field_names_are_accepted() {
        let app = app(AuthPolicy::open());
        let (status, _, body) = send(
            &app,
            Method::POST,
            "/claim",
            Some(json!({ "project_id": "t1", "agent_name": "w1", "ttl_seconds": 60 })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resource_id"], "t1");
    }
}
