//! CSMS-facing client task
//!
//! One long-lived task per charger, started when its downstream connection
//! is accepted and cancelled when that connection goes away. On transport
//! errors the task redials indefinitely; on cancellation it closes its
//! socket and exits without reconnecting.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{SEC_WEBSOCKET_PROTOCOL, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use crate::config::{UpstreamConfig, UPSTREAM_USER_AGENT};
use crate::error::GatewayResult;
use crate::ocpp::OcppFrame;
use crate::state::{Peer, SharedChargerRegistry};

use super::links::LinkRegistry;

const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

enum SessionEnd {
    Cancelled,
    Transport,
}

struct UpstreamHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks the per-charger upstream tasks so the downstream side can start
/// and cancel them. At most one live task per charger.
#[derive(Default)]
pub struct UpstreamTasks {
    tasks: DashMap<String, UpstreamHandle>,
}

impl UpstreamTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the task for this client's charger unless one is still live.
    pub fn ensure_started(&self, client: UpstreamClient) {
        let charger_id = client.charger_id.clone();
        if let Some(existing) = self.tasks.get(&charger_id) {
            if !existing.handle.is_finished() {
                info!("[{}] Upstream task already active", charger_id);
                return;
            }
            warn!("[{}] Previous upstream task had ended; restarting", charger_id);
        }
        info!("[{}] Starting upstream connection", charger_id);
        let token = CancellationToken::new();
        let handle = tokio::spawn(client.run(token.clone()));
        self.tasks.insert(charger_id, UpstreamHandle { token, handle });
    }

    /// Cancel the task when its downstream connection goes away.
    pub fn cancel(&self, charger_id: &str) {
        if let Some((_, entry)) = self.tasks.remove(charger_id) {
            entry.token.cancel();
            info!("[{}] Upstream task cancelled", charger_id);
        }
    }
}

/// Dial-and-bridge loop for one charger's CSMS connection.
pub struct UpstreamClient {
    pub charger_id: String,
    config: UpstreamConfig,
    registry: SharedChargerRegistry,
    downstream: Arc<LinkRegistry>,
    upstream: Arc<LinkRegistry>,
}

impl UpstreamClient {
    pub fn new(
        charger_id: String,
        config: UpstreamConfig,
        registry: SharedChargerRegistry,
        downstream: Arc<LinkRegistry>,
        upstream: Arc<LinkRegistry>,
    ) -> Self {
        Self {
            charger_id,
            config,
            registry,
            downstream,
            upstream,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        let url = format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            self.charger_id
        );

        loop {
            let attempt = timeout(
                Duration::from_secs(self.config.connect_timeout_secs),
                self.connect(&url),
            );
            tokio::select! {
                _ = token.cancelled() => break,
                result = attempt => match result {
                    Ok(Ok(ws)) => {
                        info!("[{}] Connected to CSMS at {}", self.charger_id, url);
                        if matches!(self.bridge_session(ws, &token).await, SessionEnd::Cancelled) {
                            break;
                        }
                    }
                    Ok(Err(e)) => error!("[{}] CSMS connection failed: {}", self.charger_id, e),
                    Err(_) => error!(
                        "[{}] CSMS connection timed out after {}s",
                        self.charger_id, self.config.connect_timeout_secs
                    ),
                }
            }

            if token.is_cancelled() {
                break;
            }
            info!(
                "[{}] Reconnecting to CSMS in {}s",
                self.charger_id, self.config.reconnect_delay_secs
            );
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(self.config.reconnect_delay_secs)) => {}
            }
        }
        info!("[{}] Upstream task finished", self.charger_id);
    }

    async fn connect(&self, url: &str) -> GatewayResult<WsStream> {
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static(UPSTREAM_USER_AGENT));

        let connector = if url.starts_with("wss://") && self.config.tls_insecure_skip_verify {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (ws, response) = connect_async_tls_with_config(request, None, false, connector).await?;

        let accepted = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "[{}] CSMS did not accept the {} subprotocol (got {:?})",
                self.charger_id, OCPP_SUBPROTOCOL, accepted
            );
        }
        Ok(ws)
    }

    /// Bridge one established CSMS connection until it dies or the task is
    /// cancelled.
    async fn bridge_session(&self, ws: WsStream, token: &CancellationToken) -> SessionEnd {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        self.upstream.register(&self.charger_id, link_tx);

        // Frames the charger produced while the CSMS was unreachable go out
        // first, in arrival order.
        let buffered = self.registry.take_buffered(&self.charger_id, Peer::Upstream);
        if !buffered.is_empty() {
            info!(
                "[{}] Flushing {} buffered frames to the CSMS",
                self.charger_id,
                buffered.len()
            );
            let total = buffered.len();
            for (i, frame) in buffered.into_iter().enumerate() {
                if let Err(e) = ws_tx.send(Message::Text(frame)).await {
                    error!(
                        "[{}] Buffer flush aborted after {} of {} frames; the rest are lost: {}",
                        self.charger_id, i, total, e
                    );
                    break;
                }
            }
        }

        let end = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break SessionEnd::Cancelled;
                }
                outbound = link_rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(e) = ws_tx.send(Message::Text(frame)).await {
                            error!("[{}] Send to CSMS failed: {}", self.charger_id, e);
                            break SessionEnd::Transport;
                        }
                    }
                    // link replaced by a newer session
                    None => break SessionEnd::Transport,
                },
                inbound = ws_rx.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.deliver_to_charger(text),
                    Some(Ok(Message::Close(_))) | None => {
                        info!("[{}] CSMS closed the connection", self.charger_id);
                        break SessionEnd::Transport;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("[{}] CSMS read failed: {}", self.charger_id, e);
                        break SessionEnd::Transport;
                    }
                },
            }
        };

        self.upstream.unregister(&self.charger_id);
        end
    }

    /// Forward a CSMS frame to the charger, or buffer it while the charger
    /// is offline. Stop commands jump the queue.
    fn deliver_to_charger(&self, text: String) {
        let frame = match self.downstream.send_to(&self.charger_id, text) {
            Ok(()) => return,
            Err(frame) => frame,
        };

        let is_stop = OcppFrame::parse(&frame)
            .map(|f| f.is_call_for("RemoteStopTransaction"))
            .unwrap_or(false);
        if is_stop {
            warn!(
                "[{}] Charger offline; RemoteStopTransaction buffered with priority",
                self.charger_id
            );
            self.registry
                .buffer_frame_priority(&self.charger_id, Peer::Downstream, frame);
        } else {
            warn!("[{}] Charger offline; frame buffered", self.charger_id);
            self.registry
                .buffer_frame(&self.charger_id, Peer::Downstream, frame);
        }
    }
}
