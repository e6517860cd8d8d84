//! Bearer-token policy for the coordinator's mutating endpoints.

use sha2::{Digest, Sha256};

/// Outcome of checking one request's `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    /// 401 with `WWW-Authenticate: Bearer`.
    Unauthorized(&'static str),
    /// Auth is required but no secret is configured: 500, fail closed.
    Misconfigured,
}

#[derive(Clone)]
pub struct AuthPolicy {
    require_auth: bool,
    secret_digest: Option<[u8; 32]>,
}

impl std::fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("require_auth", &self.require_auth)
            .field("secret_configured", &self.secret_digest.is_some())
            .finish()
    }
}

impl AuthPolicy {
    /// An empty secret counts as not configured.
    pub fn new(require_auth: bool, secret: Option<&str>) -> Self {
        Self {
            require_auth,
            secret_digest: secret.filter(|s| !s.is_empty()).map(digest),
        }
    }

    pub fn open() -> Self {
        Self::new(false, None)
    }

    /// Checks are skipped only when auth is not required and no secret is set.
    pub fn is_enforced(&self) -> bool {
        self.require_auth || self.secret_digest.is_some()
    }

    pub fn authorize(&self, authorization: Option<&str>) -> AuthDecision {
        if !self.is_enforced() {
            return AuthDecision::Allow;
        }
        let Some(expected) = self.secret_digest.as_ref() else {
            return AuthDecision::Misconfigured;
        };
        let Some(token) = authorization.and_then(bearer_token) else {
            return AuthDecision::Unauthorized(
                "authentication required: provide a Bearer token in the Authorization header",
            );
        };
        if constant_time_eq(&digest(token), expected) {
            AuthDecision::Allow
        } else {
            AuthDecision::Unauthorized("invalid API key")
        }
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

// Fixed-length digests, so the loop always runs 32 times.
fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
