use crate::errors::Result;
use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The slice of an incoming request that admission control is allowed to see.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Raw peer address, when the transport layer provides one
    pub peer_addr: Option<String>,
}

impl RequestContext {
    /// Extract the client address from forwarded headers, falling back to
    /// the raw peer address and finally to "unknown".
    pub fn client_address(&self) -> String {
        if let Some(forwarded_for) = self.headers.get("x-forwarded-for") {
            if let Ok(value) = forwarded_for.to_str() {
                if let Some(first) = value.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return first.to_string();
                    }
                }
            }
        }

        if let Some(real_ip) = self.headers.get("x-real-ip") {
            if let Ok(value) = real_ip.to_str() {
                let value = value.trim();
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }

        if let Some(peer) = &self.peer_addr {
            return peer.clone();
        }

        "unknown".to_string()
    }
}

/// Resolves an authenticated principal (user id, API key owner, ...) from a
/// request, e.g. via a session or token lookup. May suspend; the caller
/// bounds it with a timeout.
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn resolve(&self, context: &RequestContext) -> Result<Option<String>>;
}

/// Strategy for deriving the identity a quota is tracked under.
///
/// Modeled as a closed set of variants rather than an untyped callback so
/// policies can be validated at startup. `generate` never fails: every
/// resolution problem degrades to the IP-based key.
#[derive(Clone)]
pub enum KeyGenerator {
    /// `"{address}:{path}"` from forwarded headers / peer address
    AddressBased,
    /// `"user:{principal}:{path}"` when the resolver finds a principal,
    /// `"ip:{address}:{path}"` otherwise
    PrincipalBased {
        resolver: Arc<dyn PrincipalResolver>,
        timeout: Duration,
    },
}

impl KeyGenerator {
    pub async fn generate(&self, context: &RequestContext) -> String {
        match self {
            KeyGenerator::AddressBased => {
                format!("{}:{}", context.client_address(), context.path)
            }
            KeyGenerator::PrincipalBased { resolver, timeout } => {
                match tokio::time::timeout(*timeout, resolver.resolve(context)).await {
                    Ok(Ok(Some(principal))) => {
                        format!("user:{}:{}", principal, context.path)
                    }
                    Ok(Ok(None)) => {
                        format!("ip:{}:{}", context.client_address(), context.path)
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(
                            error = %e,
                            path = %context.path,
                            "Principal resolution failed, falling back to IP key"
                        );
                        format!("ip:{}:{}", context.client_address(), context.path)
                    }
                    Err(_) => {
                        tracing::warn!(
                            path = %context.path,
                            "Principal resolution timed out, falling back to IP key"
                        );
                        format!("ip:{}:{}", context.client_address(), context.path)
                    }
                }
            }
        }
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyGenerator::AddressBased => write!(f, "AddressBased"),
            KeyGenerator::PrincipalBased { timeout, .. } => f
                .debug_struct("PrincipalBased")
                .field("timeout", timeout)
                .finish_non_exhaustive(),
        }
    }
}
