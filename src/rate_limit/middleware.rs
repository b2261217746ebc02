use crate::errors::{AppError, Result};
use crate::rate_limit::key::RequestContext;
use crate::rate_limit::limiter::{RateLimitResult, SlidingWindowLimiter};
use crate::rate_limit::policy::PolicyRegistry;
use crate::rate_limit::store::{now_millis, WindowStore};
use axum::{
    extract::{ConnectInfo, Request},
    http::{header::HeaderName, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Outcome of one admission decision. `Continue(None)` is the fail-open
/// path: the request proceeds without quota headers.
#[derive(Debug)]
pub enum AdmissionResult {
    Continue(Option<RateLimitResult>),
    Reject(RateLimitResult),
}

/// Diagnostic counters for operational tooling
#[derive(Debug, Clone)]
pub struct AdmissionStats {
    pub live_key_count: usize,
}

/// The process-wide admission-control unit: policy table, window store and
/// limiter composed behind one call. Constructed once at startup and
/// injected wherever requests are handled; tests build their own.
pub struct AdmissionControl {
    store: Arc<WindowStore>,
    limiter: SlidingWindowLimiter,
    registry: PolicyRegistry,
}

impl AdmissionControl {
    pub fn new(registry: PolicyRegistry, max_tracked_keys: usize) -> Self {
        let store = Arc::new(WindowStore::new(max_tracked_keys));
        Self {
            limiter: SlidingWindowLimiter::new(store.clone()),
            store,
            registry,
        }
    }

    /// Shared handle to the store, for the background sweeper
    pub fn store_handle(&self) -> Arc<WindowStore> {
        self.store.clone()
    }

    /// Decide admission for one request under the named policy.
    ///
    /// Never fails: any error from key resolution, the store or the limiter
    /// degrades to `Continue(None)` so a broken rate limiter cannot take
    /// the protected endpoint down with it.
    pub async fn handle(&self, context: &RequestContext, policy_name: &str) -> AdmissionResult {
        match self.try_check(context, policy_name).await {
            Ok(result) if result.allowed => AdmissionResult::Continue(Some(result)),
            Ok(result) => AdmissionResult::Reject(result),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    policy = %policy_name,
                    path = %context.path,
                    "Admission check failed, failing open"
                );
                AdmissionResult::Continue(None)
            }
        }
    }

    async fn try_check(&self, context: &RequestContext, policy_name: &str) -> Result<RateLimitResult> {
        let policy = self.registry.get(policy_name).ok_or_else(|| {
            AppError::Internal(format!("Unknown rate limit policy '{}'", policy_name))
        })?;

        // Prefix with the policy name so route classes sharing a path
        // never share a ledger.
        let key = format!(
            "{}:{}",
            policy_name,
            policy.key_generator.generate(context).await
        );

        self.limiter.check(&key, &policy, now_millis())
    }

    /// Drop one key's history (diagnostics and test teardown)
    pub fn reset_key(&self, key: &str) -> bool {
        self.store.remove(key)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            live_key_count: self.store.size(),
        }
    }
}

/// Admission middleware: wire per route class with
/// `middleware::from_fn(move |req, next| admission_middleware(admission.clone(), "auth", req, next))`.
pub async fn admission_middleware(
    admission: Arc<AdmissionControl>,
    policy_name: &'static str,
    request: Request,
    next: Next,
) -> Response {
    let context = request_context(&request);

    match admission.handle(&context, policy_name).await {
        AdmissionResult::Continue(quota) => {
            let mut response = next.run(request).await;
            if let Some(result) = quota {
                add_quota_headers(response.headers_mut(), &result);
            }
            response
        }
        AdmissionResult::Reject(result) => {
            let retry_after_seconds = result.retry_after_seconds(now_millis());

            tracing::warn!(
                policy = %policy_name,
                path = %context.path,
                limit = %result.limit,
                total_in_window = %result.total_in_window,
                "Rate limit exceeded"
            );

            let mut response = AppError::RateLimitExceeded {
                retry_after_seconds,
            }
            .into_response();
            add_quota_headers(response.headers_mut(), &result);
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("retry-after"), value);
            }
            response
        }
    }
}

fn request_context(request: &Request) -> RequestContext {
    let peer_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());

    RequestContext {
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        headers: request.headers().clone(),
        peer_addr,
    }
}

/// Attach quota headers to a response, allowed or not
fn add_quota_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    if let Ok(value) = HeaderValue::from_str(&result.limit.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), value);
    }

    if let Ok(value) = HeaderValue::from_str(&result.remaining.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), value);
    }

    if let Ok(value) = HeaderValue::from_str(&result.reset_unix_seconds().to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), value);
    }
}
