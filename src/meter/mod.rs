//! Energy-meter ingest endpoint
//!
//! The facility meter POSTs its native packet to `/api/insert.php`; the only
//! field the gateway cares about is `pt`, the site-wide active power in
//! watts (sent as a number or a numeric string).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::GatewayResult;
use crate::shutdown::ShutdownSignal;
use crate::state::SitePowerFeed;

pub fn router(feed: Arc<SitePowerFeed>) -> Router {
    Router::new()
        .route("/api/insert.php", post(ingest))
        .with_state(feed)
}

/// Serve the meter endpoint on a pre-bound listener.
pub async fn serve(
    listener: TcpListener,
    feed: Arc<SitePowerFeed>,
    shutdown: ShutdownSignal,
) -> GatewayResult<()> {
    info!(addr = %listener.local_addr()?, "Meter server listening");
    axum::serve(listener, router(feed))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

async fn ingest(
    State(feed): State<Arc<SitePowerFeed>>,
    body: String,
) -> (StatusCode, &'static str) {
    let doc: Value = match serde_json::from_str(&body) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(error = %e, body = body.as_str(), "Meter packet is not valid JSON");
            return (StatusCode::BAD_REQUEST, "Bad Request: Invalid JSON");
        }
    };

    match doc.get("pt") {
        None => {
            warn!("Meter packet carries no 'pt' field");
            (StatusCode::OK, "OK")
        }
        Some(value) => match parse_watts(value) {
            Some(watts) => {
                feed.update(watts);
                info!(site_power_w = watts, "Site power updated");
                (StatusCode::OK, "OK")
            }
            None => {
                error!(value = %value, "Meter packet 'pt' is not numeric");
                (StatusCode::BAD_REQUEST, "Bad Request: Invalid pt")
            }
        },
    }
}

fn parse_watts(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn post_packet(feed: Arc<SitePowerFeed>, body: &str) -> StatusCode {
        router(feed)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/insert.php")
                    .body(Body::from(body.to_owned()))
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn numeric_string_pt_updates_site_power() {
        let feed = Arc::new(SitePowerFeed::new());
        let status = post_packet(feed.clone(), r#"{"pt": "32500.5", "v1": "231.2"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(feed.current().current_total_w, 32_500.5);
    }

    #[tokio::test]
    async fn plain_number_pt_updates_site_power() {
        let feed = Arc::new(SitePowerFeed::new());
        let status = post_packet(feed.clone(), r#"{"pt": 18000}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(feed.current().current_total_w, 18_000.0);
    }

    #[tokio::test]
    async fn invalid_json_is_rejected_without_update() {
        let feed = Arc::new(SitePowerFeed::new());
        let status = post_packet(feed.clone(), "pt=123&not=json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(feed.current().current_total_w, 0.0);
    }

    #[tokio::test]
    async fn missing_pt_is_accepted_without_update() {
        let feed = Arc::new(SitePowerFeed::new());
        let status = post_packet(feed.clone(), r#"{"v1": "231.2"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert!(feed.current().last_updated.is_none());
    }

    #[tokio::test]
    async fn non_numeric_pt_is_rejected_without_update() {
        let feed = Arc::new(SitePowerFeed::new());
        let status = post_packet(feed.clone(), r#"{"pt": "lots"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(feed.current().last_updated.is_none());
    }
}
