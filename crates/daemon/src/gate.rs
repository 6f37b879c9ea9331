//! Authorization gate consulted once per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::config::SecurityConfig;

/// What is known about a connection at handshake time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    pub remote_addr: Option<SocketAddr>,
    /// `Origin` header, sent by browsers.
    pub origin: Option<String>,
    /// `token` query parameter.
    pub token: Option<String>,
}

/// Decides whether a connection may use the multiplexer.
pub trait AuthorizationGate: Send + Sync {
    fn allowed(&self, ctx: &ConnectionContext) -> bool;
}

/// Permits every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorizationGate for AllowAll {
    fn allowed(&self, _ctx: &ConnectionContext) -> bool {
        true
    }
}

/// Requires the `token` query parameter to match a shared secret.
#[derive(Debug, Clone)]
pub struct TokenGate {
    token: String,
}

impl TokenGate {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthorizationGate for TokenGate {
    fn allowed(&self, ctx: &ConnectionContext) -> bool {
        match &ctx.token {
            Some(presented) => presented.as_bytes().ct_eq(self.token.as_bytes()).into(),
            None => false,
        }
    }
}

/// Requires the `Origin` header to be on an allow-list.
///
/// Connections without an `Origin` header (non-browser clients) pass.
#[derive(Debug, Clone)]
pub struct OriginGate {
    allowed: Vec<String>,
}

impl OriginGate {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            allowed: allowed
                .into_iter()
                .map(|o| o.trim_end_matches('/').to_ascii_lowercase())
                .collect(),
        }
    }
}

impl AuthorizationGate for OriginGate {
    fn allowed(&self, ctx: &ConnectionContext) -> bool {
        match &ctx.origin {
            Some(origin) => {
                let origin = origin.trim_end_matches('/').to_ascii_lowercase();
                self.allowed.iter().any(|a| a == "*" || *a == origin)
            }
            None => true,
        }
    }
}

/// Permits a connection only if every inner gate does.
#[derive(Default)]
pub struct AllOf {
    gates: Vec<Box<dyn AuthorizationGate>>,
}

impl AllOf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, gate: impl AuthorizationGate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

impl AuthorizationGate for AllOf {
    fn allowed(&self, ctx: &ConnectionContext) -> bool {
        self.gates.iter().all(|gate| gate.allowed(ctx))
    }
}

/// Build the gate described by the security configuration.
pub fn from_config(security: &SecurityConfig) -> Arc<dyn AuthorizationGate> {
    let mut gate = AllOf::new();
    if let Some(token) = security.access_token.as_deref().filter(|t| !t.is_empty()) {
        gate = gate.with(TokenGate::new(token));
    }
    if !security.allowed_origins.is_empty() {
        gate = gate.with(OriginGate::new(security.allowed_origins.clone()));
    }

    if gate.is_empty() {
        tracing::warn!("No access token or origin allow-list configured, accepting all connections");
        Arc::new(AllowAll)
    } else {
        Arc::new(gate)
    }
}
