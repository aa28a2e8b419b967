pub mod kv;
pub mod objects;

use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().merge(kv::router()).merge(objects::router())
}
