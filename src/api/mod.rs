/// HTTP API surface
pub mod firehose;
pub mod health;
pub mod sync;

use crate::context::AppContext;
use axum::Router;

/// Build all API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(sync::routes())
        .merge(firehose::routes())
        .merge(health::routes())
}
