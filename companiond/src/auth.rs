//! Request admission: loopback-only origin, a sliding-window limiter on
//! authentication failures, and a constant-time bearer-token check.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

use crate::state::AppState;

const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const MAX_FAILURES: usize = 20;

#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    Unauthorized,
    RateLimited,
}

pub struct AuthGuard {
    token: String,
    failures: Mutex<VecDeque<Instant>>,
}

impl AuthGuard {
    pub fn new(token: String) -> Self {
        Self {
            token,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Evaluate an `Authorization` header value. The limiter is consulted
    /// first: once saturated, even a correct token is refused until the
    /// window clears.
    pub async fn check(&self, authorization: Option<&str>) -> AuthOutcome {
        if self.is_rate_limited().await {
            return AuthOutcome::RateLimited;
        }
        let provided = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);
        match provided {
            Some(provided) if self.verify(provided) => AuthOutcome::Ok,
            _ => {
                self.record_failure().await;
                AuthOutcome::Unauthorized
            }
        }
    }

    /// Equal-length constant-time comparison; a length mismatch can fail
    /// fast because length is not secret.
    fn verify(&self, provided: &str) -> bool {
        provided.len() == self.token.len()
            && bool::from(provided.as_bytes().ct_eq(self.token.as_bytes()))
    }

    async fn is_rate_limited(&self) -> bool {
        let mut failures = self.failures.lock().await;
        let cutoff = Instant::now() - FAILURE_WINDOW;
        while failures.front().is_some_and(|at| *at < cutoff) {
            failures.pop_front();
        }
        failures.len() >= MAX_FAILURES
    }

    async fn record_failure(&self) {
        self.failures.lock().await.push_back(Instant::now());
    }
}

pub fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => {
            v6 == Ipv6Addr::LOCALHOST
                || v6.to_ipv4_mapped().is_some_and(|v4| v4 == Ipv4Addr::LOCALHOST)
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Middleware applied to every route: origin, limiter, bearer token.
pub async fn require_auth(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !is_loopback(addr.ip()) {
        return unauthorized("unauthorized");
    }
    let authorization = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    match state.auth.check(authorization).await {
        AuthOutcome::Ok => next.run(request).await,
        AuthOutcome::Unauthorized => unauthorized("unauthorized"),
        AuthOutcome::RateLimited => {
            unauthorized("too many failed authentication attempts, try again later")
        }
    }
}
