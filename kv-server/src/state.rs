//! Process-wide state: the subscription registry and shared pool, modeled
//! as a single service object owned by the process. Handed to every axum
//! route as `State<AppState>`; cheap to clone since every field is
//! already reference-counted internally.

use std::sync::Arc;

use kv_core::watch::WatchRegistry;
use sqlx::PgPool;

use crate::config::ServerConfig;
use crate::http::authz::AuthzLayer;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub watch: WatchRegistry,
    pub config: Arc<ServerConfig>,
    pub authz: Arc<dyn AuthzLayer>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        watch: WatchRegistry,
        config: Arc<ServerConfig>,
        authz: Arc<dyn AuthzLayer>,
    ) -> Self {
        AppState { pool, watch, config, authz }
    }
}
