//! HTTP client for a remote lease coordinator.
//!
//! Transport failures are retried `retry_count` times and then surface as
//! `HiveError::CoordinatorUnavailable`, which callers treat as "fall back to
//! the owner field".

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::server::{ReleaseResponse, ReservationsResponse, StatusResponse};
use crate::domain::{ClaimOutcome, HiveError, Lease, LeaseId};
use crate::ports::LeaseBackend;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    retry_count: u32,
}

#[derive(Debug, Deserialize)]
struct GrantedBody {
    lease_id: LeaseId,
    resource_id: String,
    holder: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
    current_owner: String,
    claimed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ExtendBody {
    new_expires_at: DateTime<Utc>,
}

impl CoordinatorClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        retry_count: u32,
    ) -> Result<Self, HiveError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| HiveError::Config(format!("invalid coordinator url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(HiveError::Config(format!(
                "coordinator url {base_url} cannot carry a path"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HiveError::Config(format!("cannot build http client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            retry_count,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, HiveError> {
        let mut attempt = 0;
        loop {
            let mut request = self.http.request(method.clone(), url.clone());
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.retry_count => {
                    attempt += 1;
                    debug!(%url, attempt, error = %e, "coordinator request failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    warn!(%url, error = %e, "coordinator unreachable");
                    return Err(HiveError::CoordinatorUnavailable(format!(
                        "coordinator unavailable at {}: {e}",
                        self.base_url
                    )));
                }
            }
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, HiveError> {
        response
            .json::<T>()
            .await
            .map_err(|e| HiveError::CoordinatorUnavailable(format!("malformed response: {e}")))
    }

    async fn status_error(response: reqwest::Response) -> HiveError {
        let status = response.status();
        let message = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {status}"));
        match status {
            StatusCode::BAD_REQUEST => HiveError::Validation(message),
            StatusCode::NOT_FOUND => HiveError::NotFound(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                HiveError::Config(format!("coordinator rejected credentials: {message}"))
            }
            _ => HiveError::CoordinatorUnavailable(message),
        }
    }

    /// `true` if `/health` answers with a success status.
    pub async fn is_available(&self) -> bool {
        matches!(
            self.send(Method::GET, self.url(&["health"]), None).await,
            Ok(response) if response.status().is_success()
        )
    }

    pub async fn claim(
        &self,
        resource_id: &str,
        holder: &str,
        ttl: Duration,
        force: bool,
    ) -> Result<ClaimOutcome, HiveError> {
        let mut url = self.url(&["claim"]);
        if force {
            url.query_pairs_mut().append_pair("force", "true");
        }
        let body = json!({
            "resource_id": resource_id,
            "holder": holder,
            "ttl_seconds": ttl.as_secs(),
        });
        let response = self.send(Method::POST, url, Some(&body)).await?;
        match response.status() {
            StatusCode::OK => {
                let granted: GrantedBody = Self::decode(response).await?;
                Ok(ClaimOutcome::Granted(Lease {
                    lease_id: granted.lease_id,
                    resource_id: granted.resource_id,
                    holder: granted.holder,
                    created_at: granted.created_at,
                    expires_at: granted.expires_at,
                }))
            }
            StatusCode::CONFLICT => {
                let conflict: ConflictBody = Self::decode(response).await?;
                Ok(ClaimOutcome::Conflict {
                    current_holder: conflict.current_owner,
                    claimed_at: conflict.claimed_at,
                    expires_at: conflict.expires_at,
                })
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    pub async fn release(&self, resource_id: &str) -> Result<bool, HiveError> {
        let response = self
            .send(Method::DELETE, self.url(&["release", resource_id]), None)
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(Self::decode::<ReleaseResponse>(response).await?.success)
    }

    pub async fn release_lease(&self, lease_id: LeaseId) -> Result<bool, HiveError> {
        let id = lease_id.to_string();
        let response = self
            .send(Method::DELETE, self.url(&["release", "claim", &id]), None)
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(Self::decode::<ReleaseResponse>(response).await?.success)
    }

    /// New expiry of the extended lease.
    pub async fn extend(
        &self,
        resource_id: &str,
        ttl: Duration,
    ) -> Result<DateTime<Utc>, HiveError> {
        let mut url = self.url(&["extend", resource_id]);
        url.query_pairs_mut()
            .append_pair("ttl_seconds", &ttl.as_secs().to_string());
        let response = self.send(Method::POST, url, None).await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(Self::decode::<ExtendBody>(response).await?.new_expires_at)
    }

    pub async fn status(&self, resource_id: &str) -> Result<StatusResponse, HiveError> {
        let response = self
            .send(Method::GET, self.url(&["status", resource_id]), None)
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Self::decode(response).await
    }

    pub async fn reservations(&self) -> Result<ReservationsResponse, HiveError> {
        let response = self
            .send(Method::GET, self.url(&["reservations"]), None)
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Self::decode(response).await
    }
}

#[async_trait]
impl LeaseBackend for CoordinatorClient {
    async fn claim(
        &self,
        resource_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, HiveError> {
        CoordinatorClient::claim(self, resource_id, holder, ttl, false).await
    }

    async fn release(&self, resource_id: &str) -> Result<bool, HiveError> {
        CoordinatorClient::release(self, resource_id).await
    }

    async fn release_lease(&self, lease_id: LeaseId) -> Result<bool, HiveError> {
        CoordinatorClient::release_lease(self, lease_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::auth::AuthPolicy;
    use crate::lease::server::{CoordinatorState, router};
    use crate::lease::store::{LeaseSettings, LeaseStore};
    use std::net::SocketAddr;

    async fn spawn_coordinator(auth: AuthPolicy) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = CoordinatorState::new(LeaseStore::new(LeaseSettings::default()), auth);
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr
    }

    fn client(addr: SocketAddr, key: Option<&str>) -> CoordinatorClient {
        CoordinatorClient::new(
            &format!("http://{addr}"),
            key.map(str::to_string),
            Duration::from_secs(5),
            0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn claim_conflict_release_round_trip() {
        let addr = spawn_coordinator(AuthPolicy::open()).await;
        let a = client(addr, None);
        assert!(a.is_available().await);

        let lease = a
            .claim("t1", "w1", Duration::from_secs(60), false)
            .await
            .unwrap()
            .into_result("t1")
            .unwrap();
        assert_eq!(lease.holder, "w1");

        match a.claim("t1", "w2", Duration::from_secs(60), false).await.unwrap() {
            ClaimOutcome::Conflict { current_holder, .. } => assert_eq!(current_holder, "w1"),
            other => panic!("expected conflict, got {other:?}"),
        }

        let status = a.status("t1").await.unwrap();
        assert!(status.is_claimed);
        assert_eq!(a.reservations().await.unwrap().count, 1);

        assert!(a.extend("t1", Duration::from_secs(120)).await.unwrap() > lease.expires_at);
        assert!(a.release_lease(lease.lease_id).await.unwrap());
        assert!(!a.release("t1").await.unwrap());
    }

    #[tokio::test]
    async fn bad_ttl_maps_to_validation() {
        let addr = spawn_coordinator(AuthPolicy::open()).await;
        let err = client(addr, None)
            .claim("t1", "w1", Duration::ZERO, false)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Validation(_)));
    }

    #[tokio::test]
    async fn sends_bearer_key() {
        let addr = spawn_coordinator(AuthPolicy::new(true, Some("k"))).await;
        let err = client(addr, None)
            .claim("t1", "w1", Duration::from_secs(60), false)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Config(_)));

        let outcome = client(addr, Some("k"))
            .claim("t1", "w1", Duration::from_secs(60), false)
            .await
            .unwrap();
        assert!(outcome.is_granted());
    }

    #[tokio::test]
    async fn unreachable_coordinator_is_unavailable() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let c = CoordinatorClient::new(
            &format!("http://{addr}"),
            None,
            Duration::from_millis(500),
            1,
        )
        .unwrap();
        assert!(!c.is_available().await);
        let err = c
            .claim("t1", "w1", Duration::from_secs(60), false)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = CoordinatorClient::new("not a url", None, Duration::from_secs(1), 0).unwrap_err();
        assert!(matches!(err, HiveError::Config(_)));
    }
}
