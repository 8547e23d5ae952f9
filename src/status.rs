//! A4 Status Server: read-only operator-facing HTTP surface exposing
//! current counters and denied hosts.
//!
//! Grounded on the Router/CORS shape of `vamsi200-Drashta/backend/src/
//! events.rs` and its `render_app` counterpart, trimmed from a live SSE
//! stream down to one polled JSON route since the spec names no live
//! dashboard requirement.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::host::Host;

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub tracked_hosts: usize,
    pub denied_hosts: Vec<Host>,
    pub blocked_hosts: Vec<Host>,
    pub last_tick: Option<chrono::DateTime<chrono::Utc>>,
}

pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

async fn status_handler(State(state): State<SharedStatus>) -> Json<StatusSnapshot> {
    Json(state.read().unwrap().clone())
}

pub fn router(state: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

pub async fn serve(bind_addr: SocketAddr, state: SharedStatus) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_route_reports_snapshot() {
        let state: SharedStatus = Arc::new(RwLock::new(StatusSnapshot {
            tracked_hosts: 2,
            denied_hosts: vec!["192.0.2.10".parse().unwrap()],
            blocked_hosts: vec![],
            last_tick: None,
        }));
        let app = router(state);
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
