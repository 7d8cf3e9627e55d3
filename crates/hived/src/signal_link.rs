//! WebSocket link to the rendezvous server.
//!
//! Inbound frames are parsed into envelopes and handed to the mesh loop;
//! outbound envelopes are written as JSON text frames. A dropped connection
//! ends the task; there is no reconnect.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use hive_core::SignalEnvelope;

use crate::driver::MeshInput;

pub struct SignalLink {
    url: String,
    outbound: mpsc::UnboundedReceiver<SignalEnvelope>,
    inputs: mpsc::UnboundedSender<MeshInput>,
    shutdown: broadcast::Receiver<()>,
}

impl SignalLink {
    pub fn new(
        url: String,
        outbound: mpsc::UnboundedReceiver<SignalEnvelope>,
        inputs: mpsc::UnboundedSender<MeshInput>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            url,
            outbound,
            inputs,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(url = %self.url, "connecting to signaling server");
        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect to signaling server at {}", self.url))?;
        tracing::info!("signaling connected");

        let (mut sink, mut stream) = ws_stream.split();

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    tracing::info!("signaling link shutting down");
                    return Ok(());
                }

                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.deliver(text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => self.deliver(&data),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::warn!(?frame, "signaling server closed the connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(e).context("signaling receive failed");
                    }
                    None => {
                        tracing::warn!("signaling stream ended");
                        return Ok(());
                    }
                },

                envelope = self.outbound.recv() => {
                    let Some(envelope) = envelope else {
                        tracing::info!("mesh loop gone, signaling link exiting");
                        return Ok(());
                    };
                    let json = match envelope.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(kind = envelope.body.name(), error = %e, "unencodable signaling envelope dropped");
                            continue;
                        }
                    };
                    tracing::trace!(kind = envelope.body.name(), "signaling send");
                    sink.send(Message::Text(json))
                        .await
                        .context("signaling send failed")?;
                }
            }
        }
    }

    fn deliver(&self, data: &[u8]) {
        match SignalEnvelope::from_json(data) {
            Ok(envelope) => {
                let _ = self.inputs.send(MeshInput::Signal(envelope));
            }
            Err(e) => tracing::warn!(error = %e, bytes = data.len(), "malformed signaling frame dropped"),
        }
    }
}
