//! Authorization seam.
//!
//! No real authorization is implemented yet -- every request is allowed.
//! The trait and extractor exist so role/policy enforcement can be added
//! behind a single seam later without touching every handler's body:
//! swapping `NoopAuthz` for a real `AuthzLayer` impl in [`AppState`] is the
//! entire migration.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use kv_core::error::CResult;

use crate::http::error::ApiError;
use crate::state::AppState;

/// Decides whether a request is allowed to proceed. Implementations see
/// only the request path; a real implementation would also take the
/// caller's identity once authentication exists.
pub trait AuthzLayer: Send + Sync {
    fn check(&self, path: &str) -> CResult<()>;
}

/// Allows everything. The only implementation that exists today.
pub struct NoopAuthz;

impl AuthzLayer for NoopAuthz {
    fn check(&self, _path: &str) -> CResult<()> {
        Ok(())
    }
}

/// Extractor that gates a handler behind `state.authz`. Extracting it
/// successfully means the request passed; handlers that don't need a
/// role check at all simply don't take it as a parameter.
pub struct RoleGate;

#[axum::async_trait]
impl FromRequestParts<AppState> for RoleGate {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let path = parts.uri.path().to_string();
        state
            .authz
            .check(&path)
            .map_err(|e| ApiError::new(e, path))?;
        Ok(RoleGate)
    }
}

pub fn default_layer() -> Arc<dyn AuthzLayer> {
    Arc::new(NoopAuthz)
}
