//! Optional admin HTTP endpoint.
//!
//! `GET /health` for liveness checks, `GET /roster` for this node's view of
//! the group and `GET /metrics` for Prometheus scraping.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::member::Member;
use crate::metrics;
use crate::monitor::Role;
use crate::node::NodeContext;

#[derive(Debug, Serialize)]
struct RosterView {
    me: Member,
    role: Role,
    members: Vec<Member>,
}

pub fn router(ctx: Arc<NodeContext>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/roster", get(roster_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Serve the admin router on `listener` until `shutdown` flips.
pub async fn serve(listener: TcpListener, ctx: Arc<NodeContext>, mut shutdown: watch::Receiver<bool>) {
    let app = router(ctx);
    let stop = async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
        warn!("admin endpoint failed: {}", e);
    }
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

async fn roster_handler(State(ctx): State<Arc<NodeContext>>) -> Json<RosterView> {
    let (me, members) = ctx.roster.view();
    let role = Role::evaluate(&me, &members);
    Json(RosterView { me, role, members })
}

async fn metrics_handler() -> Response {
    match metrics::render() {
        Some(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::join::AutoApprove;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn context() -> Arc<NodeContext> {
        let me = Member::new("alice", "127.0.0.1", 7000).unwrap();
        let (ctx, _s, _e) = NodeContext::new(Config::default(), me, Arc::new(AutoApprove));
        ctx.roster.found();
        ctx.roster.add(Member::with_id("bob", 1, "127.0.0.1", 7001));
        ctx
    }

    async fn get_body(ctx: Arc<NodeContext>, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router(ctx)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_body(context(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_roster_view() {
        let (status, body) = get_body(context(), "/roster").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["me"]["username"], "alice");
        assert_eq!(json["role"], "coordinator");
        assert_eq!(json["members"][0]["username"], "bob");
        assert_eq!(json["members"][0]["id"], 1);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (status, _) = get_body(context(), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
