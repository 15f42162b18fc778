//! Charger-facing WebSocket server
//!
//! Accepts one connection per charger at `ws://<host>:<port>/{charger_id}`.
//! Every charger frame is digested for state updates, then forwarded to the
//! CSMS verbatim (or buffered while the CSMS is unreachable). Responses to
//! gateway-originated requests are consumed here and never leave the site.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::config::AppConfig;
use crate::control::commands::send_charging_profile;
use crate::error::GatewayResult;
use crate::ocpp::OcppFrame;
use crate::persistence::LearnedPowerStore;
use crate::shutdown::ShutdownSignal;
use crate::state::{Peer, PendingRequests, SharedChargerRegistry, StateEffect};

use super::links::LinkRegistry;
use super::upstream::{UpstreamClient, UpstreamTasks};

const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// The charger-facing half of the bridge.
pub struct GatewayServer {
    config: AppConfig,
    registry: SharedChargerRegistry,
    store: Arc<dyn LearnedPowerStore>,
    downstream: Arc<LinkRegistry>,
    upstream: Arc<LinkRegistry>,
    upstream_tasks: Arc<UpstreamTasks>,
    pending: Arc<PendingRequests>,
    shutdown_signal: Option<ShutdownSignal>,
}

impl GatewayServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        registry: SharedChargerRegistry,
        store: Arc<dyn LearnedPowerStore>,
        downstream: Arc<LinkRegistry>,
        upstream: Arc<LinkRegistry>,
        upstream_tasks: Arc<UpstreamTasks>,
        pending: Arc<PendingRequests>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            downstream,
            upstream,
            upstream_tasks,
            pending,
            shutdown_signal: None,
        }
    }

    /// Set the shutdown signal that stops the accept loop.
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown_signal = Some(signal);
        self
    }

    /// Run the accept loop on a pre-bound listener. Existing connections
    /// outlive the loop so the shutdown cap-release can still reach them.
    pub async fn run(&self, listener: TcpListener) -> GatewayResult<()> {
        info!(
            "OCPP gateway listening on ws://{}",
            self.config.server.address()
        );

        match self.shutdown_signal.clone() {
            Some(shutdown) => loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr),
                        Err(e) => error!("Failed to accept charger connection: {}", e),
                    },
                    _ = shutdown.notified().wait() => {
                        info!("Gateway server stopped accepting connections");
                        return Ok(());
                    }
                }
            },
            None => loop {
                match listener.accept().await {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => error!("Failed to accept charger connection: {}", e),
                }
            },
        }
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let config = self.config.clone();
        let registry = self.registry.clone();
        let store = self.store.clone();
        let downstream = self.downstream.clone();
        let upstream = self.upstream.clone();
        let upstream_tasks = self.upstream_tasks.clone();
        let pending = self.pending.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(
                stream,
                addr,
                config,
                registry,
                store,
                downstream,
                upstream,
                upstream_tasks,
                pending,
            )
            .await
            {
                error!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: AppConfig,
    registry: SharedChargerRegistry,
    store: Arc<dyn LearnedPowerStore>,
    downstream: Arc<LinkRegistry>,
    upstream: Arc<LinkRegistry>,
    upstream_tasks: Arc<UpstreamTasks>,
    pending: Arc<PendingRequests>,
) -> GatewayResult<()> {
    info!("New charger connection from {}", addr);

    // The handshake callback sees the request path; the connection handler
    // needs it afterwards, so it is captured here.
    let mut request_path = String::new();
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut response: Response| {
        request_path = req.uri().path().to_string();

        let offered = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if offered.split(',').map(str::trim).any(|p| p == OCPP_SUBPROTOCOL) {
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(OCPP_SUBPROTOCOL),
            );
        } else if !offered.is_empty() {
            warn!(
                "Charger at {} does not offer {} (offered: {})",
                addr, OCPP_SUBPROTOCOL, offered
            );
        }
        Ok(response)
    })
    .await?;

    let charger_id = request_path.trim_matches('/').to_string();
    if charger_id.is_empty() {
        warn!("Connection from {} carries no charge point ID in the path", addr);
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Error,
                reason: "Charge Point ID not specified".into(),
            }))
            .await;
        return Ok(());
    }

    // Seed the record from the learned-powers file; first contact writes the
    // default seed so the installer file always lists every charger.
    let seed = match store.get(&charger_id).await {
        Some(watts) => watts,
        None => {
            let seed = config.control.default_max_power_seed_w;
            store.record(&charger_id, seed).await;
            seed
        }
    };
    registry.mark_connected(&charger_id, seed);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (link_tx, mut link_rx) = mpsc::unbounded_channel::<String>();
    downstream.register(&charger_id, link_tx.clone());

    // Frames the CSMS addressed to this charger while it was offline;
    // priority insertion already put stop commands first.
    let held = registry.take_buffered(&charger_id, Peer::Downstream);
    if !held.is_empty() {
        info!(
            "[{}] Delivering {} frames buffered while the charger was offline",
            charger_id,
            held.len()
        );
        for frame in held {
            let _ = link_tx.send(frame);
        }
    }
    drop(link_tx);

    // Pump link frames into the socket until every sender is gone.
    let pump_id = charger_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = link_rx.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(frame)).await {
                error!("[{}] Send to charger failed: {}", pump_id, e);
                break;
            }
        }
    });

    upstream_tasks.ensure_started(UpstreamClient::new(
        charger_id.clone(),
        config.upstream.clone(),
        registry.clone(),
        downstream.clone(),
        upstream.clone(),
    ));

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                registry.touch(&charger_id);

                match OcppFrame::parse(&text) {
                    Ok(frame) => {
                        if frame.is_call_result() && pending.consume(frame.unique_id()) {
                            info!(
                                "[{}] Response '{}' consumed (gateway-originated request)",
                                charger_id,
                                frame.unique_id()
                            );
                            continue;
                        }
                        for effect in registry.apply_frame(&charger_id, &frame) {
                            match effect {
                                StateEffect::RestoreCap { limit_w } => {
                                    if let Err(e) = send_charging_profile(
                                        &downstream,
                                        &registry,
                                        &pending,
                                        &charger_id,
                                        limit_w,
                                    ) {
                                        warn!("[{}] Cap restore not sent: {}", charger_id, e);
                                    }
                                }
                                StateEffect::LearnedNew { max_w } => {
                                    store.record(&charger_id, max_w).await;
                                }
                            }
                        }
                    }
                    Err(e) => warn!(
                        "[{}] Unparseable frame forwarded untouched ({}): {}",
                        charger_id, e, text
                    ),
                }

                if let Err(frame) = upstream.send_to(&charger_id, text) {
                    warn!("[{}] CSMS link down; frame buffered", charger_id);
                    registry.buffer_frame(&charger_id, Peer::Upstream, frame);
                }
            }
            Ok(Message::Close(frame)) => {
                info!("[{}] Charger closed the connection: {:?}", charger_id, frame);
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Binary(data)) => {
                warn!("[{}] Binary message ({} bytes) ignored", charger_id, data.len());
            }
            Ok(_) => {}
            Err(e) => {
                error!("[{}] WebSocket error: {}", charger_id, e);
                break;
            }
        }
    }

    downstream.unregister(&charger_id);
    registry.mark_offline(&charger_id);
    upstream_tasks.cancel(&charger_id);
    send_task.abort();
    info!("[{}] Charger disconnected", charger_id);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::state::ChargerRegistry;

    struct NullStore;

    #[async_trait]
    impl LearnedPowerStore for NullStore {
        async fn get(&self, _charger_id: &str) -> Option<f64> {
            None
        }
        async fn record(&self, _charger_id: &str, _watts: f64) {}
        async fn all(&self) -> HashMap<String, f64> {
            HashMap::new()
        }
    }

    #[tokio::test]
    async fn gateway_responses_are_consumed_and_charger_frames_buffer_for_csms() {
        let registry: SharedChargerRegistry = Arc::new(ChargerRegistry::new(100));
        let store: Arc<dyn LearnedPowerStore> = Arc::new(NullStore);
        let downstream = Arc::new(LinkRegistry::new("downstream"));
        let upstream = Arc::new(LinkRegistry::new("upstream"));
        let upstream_tasks = Arc::new(UpstreamTasks::new());
        let pending = Arc::new(PendingRequests::new());
        pending.track("X".to_string());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = AppConfig::default();
        // point the CSMS dial at a closed port so the upstream stays down
        config.upstream.url = "ws://127.0.0.1:9/ocpp".to_string();
        let server = GatewayServer::new(
            config,
            registry.clone(),
            store,
            downstream,
            upstream,
            upstream_tasks,
            pending.clone(),
        );
        tokio::spawn(async move {
            let _ = server.run(listener).await;
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/CP-9", addr))
            .await
            .unwrap();
        ws.send(Message::Text(r#"[3,"X",{"status":"Accepted"}]"#.to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(r#"[2,"77","Heartbeat",{}]"#.to_string()))
            .await
            .unwrap();

        // The handler digests frames concurrently; the heartbeat must end up
        // buffered for the (unreachable) CSMS, the response must not.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let buffered = registry.take_buffered("CP-9", Peer::Upstream);
            if !buffered.is_empty() {
                assert_eq!(buffered, vec![r#"[2,"77","Heartbeat",{}]"#.to_string()]);
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "charger frame never buffered"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!pending.contains("X"));
    }
}
