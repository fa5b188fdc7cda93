//! WebSocket bridge: serve a hub to other processes and attach to one.
//!
//! Each WebSocket connection is one attachment. Frames are JSON-encoded
//! [`HubEnvelope`]s in text messages, in both directions.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};

use conclave_core::{ConclaveError, Result};

use crate::protocol::{HubEnvelope, HubLink};
use crate::server::HubProcess;
use crate::spawn::HubSpawner;

fn encode(envelope: &HubEnvelope) -> Option<Message> {
    match serde_json::to_string(envelope) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to encode hub envelope: {e}");
            None
        }
    }
}

fn decode(text: &str, from: &str) -> Option<HubEnvelope> {
    match serde_json::from_str(text) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!("Bad hub envelope from {from}: {e}");
            None
        }
    }
}

/// Bind `addr` and serve `hub` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    hub: Arc<HubProcess>,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, hub, shutdown).await
}

/// Serve `hub` on an already-bound listener until `shutdown` fires.
pub async fn serve_listener(
    listener: TcpListener,
    hub: Arc<HubProcess>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    info!("Hub listening on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let hub = Arc::clone(&hub);
                    tokio::spawn(async move {
                        bridge_connection(stream, peer_addr, hub).await;
                    });
                }
                Err(e) => warn!("Accept failed: {e}"),
            },
            _ = shutdown.recv() => {
                info!("Hub listener shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn bridge_connection(stream: TcpStream, peer_addr: SocketAddr, hub: Arc<HubProcess>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket accept failed for {peer_addr}: {e}");
            return;
        }
    };
    debug!("Client connected from {peer_addr}");
    let (mut sink, mut stream) = ws.split();
    let HubLink {
        outbound,
        mut inbound,
    } = hub.attach();

    // Hub → socket.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            let Some(msg) = encode(&envelope) else {
                continue;
            };
            if let Err(e) = sink.send(msg).await {
                debug!("Write to {peer_addr} failed: {e}");
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // Socket → hub.
    let from = peer_addr.to_string();
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Some(envelope) = decode(&text, &from) {
                    if outbound.send(envelope).is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Client {peer_addr} sent close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Read error from {peer_addr}: {e}");
                break;
            }
        }
    }
    drop(outbound);
    writer.abort();
}

/// Attaches to a `conclave-hub` process listening at `endpoint`.
#[derive(Debug, Clone)]
pub struct WsHubConnector {
    url: String,
}

impl WsHubConnector {
    /// `endpoint` is a `ws://` URL or a bare `host:port`.
    pub fn new(endpoint: &str) -> Self {
        let url = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("ws://{endpoint}")
        };
        Self { url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HubSpawner for WsHubConnector {
    async fn acquire(&self) -> Result<HubLink> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConclaveError::Transport(format!("Connect to {} failed: {e}", self.url)))?;
        info!("Attached to hub at {}", self.url);
        let (mut sink, mut stream) = ws.split();

        let (outbound, mut to_hub) = mpsc::unbounded_channel::<HubEnvelope>();
        let (from_hub, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(envelope) = to_hub.recv().await {
                let Some(msg) = encode(&envelope) else {
                    continue;
                };
                if let Err(e) = sink.send(msg).await {
                    debug!("Write to hub failed: {e}");
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let from = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(envelope) = decode(&text, &from) {
                            if from_hub.send(envelope).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Read error from hub: {e}");
                        break;
                    }
                }
            }
            debug!("Hub connection {from} closed");
        });

        Ok(HubLink { outbound, inbound })
    }
}
