//! WebRTC peer links.
//!
//! The connection manager decides *what* happens to a link; this module does
//! it against the real stack. Each peer gets one task that applies link
//! commands strictly in order, and one writer task that owns the data
//! channel's pacing queue. Callbacks from the stack only ever send
//! `MeshInput::Link` into the mesh loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use hive_core::config::NetworkConfig;
use hive_core::wire::Blob;
use hive_core::NodeId;
use hive_services::{LinkCommand, LinkEvent, Pace, SendPacer};

use crate::driver::MeshInput;

const CHANNEL_LABEL: &str = "hive";

/// Re-check interval while stalled, in case the buffer-low callback never
/// fires because the channel died.
const STALL_RECHECK: Duration = Duration::from_millis(250);

struct LinkHandle {
    id: u64,
    commands: mpsc::UnboundedSender<LinkCommand>,
    frames: mpsc::UnboundedSender<Vec<Bytes>>,
}

/// Identity and event path shared by every callback of one link.
#[derive(Clone)]
struct LinkContext {
    peer: NodeId,
    id: u64,
    inputs: mpsc::UnboundedSender<MeshInput>,
}

impl LinkContext {
    fn report(&self, event: LinkEvent) {
        let _ = self.inputs.send(MeshInput::Link {
            peer: self.peer.clone(),
            link: self.id,
            event,
        });
    }
}

pub struct LinkDriver {
    api: Arc<API>,
    config: RTCConfiguration,
    low_water: usize,
    inputs: mpsc::UnboundedSender<MeshInput>,
    links: HashMap<NodeId, LinkHandle>,
    next_id: u64,
}

impl LinkDriver {
    pub fn new(
        network: &NetworkConfig,
        low_water: usize,
        inputs: mpsc::UnboundedSender<MeshInput>,
    ) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .context("failed to register WebRTC interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: network.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self {
            api: Arc::new(api),
            config,
            low_water,
            inputs,
            links: HashMap::new(),
            next_id: 0,
        })
    }

    /// Whether an event from link `id` belongs to the peer's current link.
    pub fn is_current(&self, peer: &NodeId, id: u64) -> bool {
        self.links.get(peer).is_some_and(|link| link.id == id)
    }

    pub fn command(&mut self, peer: NodeId, command: LinkCommand) {
        if matches!(command, LinkCommand::Close) {
            if let Some(link) = self.links.remove(&peer) {
                let _ = link.commands.send(LinkCommand::Close);
            }
            return;
        }

        if !self.links.contains_key(&peer) {
            let handle = self.spawn(peer.clone());
            self.links.insert(peer.clone(), handle);
        }
        if let Some(link) = self.links.get(&peer) {
            if link.commands.send(command).is_err() {
                tracing::debug!(peer = %peer.short(), "link task gone, command dropped");
            }
        }
    }

    /// Queue frames on the peer's channel.
    pub fn send(&self, peer: &NodeId, frames: Vec<Bytes>) {
        match self.links.get(peer) {
            Some(link) => {
                if link.frames.send(frames).is_err() {
                    tracing::debug!(peer = %peer.short(), "writer gone, frames dropped");
                }
            }
            None => tracing::debug!(peer = %peer.short(), "no link, frames dropped"),
        }
    }

    pub fn close_all(&mut self) {
        for (_, link) in self.links.drain() {
            let _ = link.commands.send(LinkCommand::Close);
        }
    }

    fn spawn(&mut self, peer: NodeId) -> LinkHandle {
        self.next_id += 1;
        let ctx = LinkContext {
            peer,
            id: self.next_id,
            inputs: self.inputs.clone(),
        };
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (frames, frame_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_link(
            self.api.clone(),
            self.config.clone(),
            ctx.clone(),
            self.low_water,
            command_rx,
            frame_rx,
        ));

        LinkHandle {
            id: ctx.id,
            commands,
            frames,
        }
    }
}

async fn run_link(
    api: Arc<API>,
    config: RTCConfiguration,
    ctx: LinkContext,
    low_water: usize,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    frames: mpsc::UnboundedReceiver<Vec<Bytes>>,
) {
    let pc = match api.new_peer_connection(config).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            tracing::warn!(peer = %ctx.peer.short(), error = %e, "failed to create peer connection");
            ctx.report(LinkEvent::Failed(e.to_string()));
            return;
        }
    };

    let (channel_tx, channel_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(ctx.clone(), channel_rx, frames, low_water));
    watch_connection(&pc, &ctx, &channel_tx);

    while let Some(command) = commands.recv().await {
        if matches!(command, LinkCommand::Close) {
            break;
        }
        if let Err(e) = apply(&pc, &ctx, &channel_tx, command).await {
            tracing::warn!(peer = %ctx.peer.short(), error = %e, "link command failed");
            ctx.report(LinkEvent::Failed(format!("{e:#}")));
        }
    }

    if let Err(e) = pc.close().await {
        tracing::debug!(peer = %ctx.peer.short(), error = %e, "peer connection close failed");
    }
    tracing::info!(peer = %ctx.peer.short(), "link closed");
}

async fn apply(
    pc: &RTCPeerConnection,
    ctx: &LinkContext,
    channel_tx: &mpsc::UnboundedSender<Arc<RTCDataChannel>>,
    command: LinkCommand,
) -> Result<()> {
    match command {
        LinkCommand::CreateOffer => {
            let dc = pc
                .create_data_channel(CHANNEL_LABEL, None)
                .await
                .context("failed to create data channel")?;
            watch_channel(&dc, ctx, channel_tx);

            let offer = pc.create_offer(None).await.context("failed to create offer")?;
            pc.set_local_description(offer.clone())
                .await
                .context("failed to apply local offer")?;
            ctx.report(LinkEvent::LocalDescription(Blob(serde_json::to_value(&offer)?)));
        }
        LinkCommand::AcceptOffer(blob) => {
            let offer: RTCSessionDescription =
                serde_json::from_value(blob.0).context("malformed offer")?;
            pc.set_remote_description(offer)
                .await
                .context("failed to apply remote offer")?;
            let answer = pc.create_answer(None).await.context("failed to create answer")?;
            pc.set_local_description(answer.clone())
                .await
                .context("failed to apply local answer")?;
            ctx.report(LinkEvent::LocalDescription(Blob(serde_json::to_value(&answer)?)));
        }
        LinkCommand::ApplyAnswer(blob) => {
            let answer: RTCSessionDescription =
                serde_json::from_value(blob.0).context("malformed answer")?;
            pc.set_remote_description(answer)
                .await
                .context("failed to apply remote answer")?;
        }
        LinkCommand::AddCandidate(blob) => {
            let candidate: RTCIceCandidateInit =
                serde_json::from_value(blob.0).context("malformed candidate")?;
            pc.add_ice_candidate(candidate)
                .await
                .context("failed to add candidate")?;
        }
        LinkCommand::Close => {}
    }
    Ok(())
}

fn watch_connection(
    pc: &RTCPeerConnection,
    ctx: &LinkContext,
    channel_tx: &mpsc::UnboundedSender<Arc<RTCDataChannel>>,
) {
    {
        let ctx = ctx.clone();
        let channel_tx = channel_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let ctx = ctx.clone();
            let channel_tx = channel_tx.clone();
            Box::pin(async move {
                tracing::debug!(peer = %ctx.peer.short(), label = dc.label(), "remote data channel");
                watch_channel(&dc, &ctx, &channel_tx);
            })
        }));
    }

    {
        let ctx = ctx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ctx = ctx.clone();
            Box::pin(async move {
                // None marks the end of gathering.
                let Some(candidate) = candidate else { return };
                let blob = candidate
                    .to_json()
                    .map_err(anyhow::Error::from)
                    .and_then(|init| serde_json::to_value(init).map_err(anyhow::Error::from));
                match blob {
                    Ok(value) => ctx.report(LinkEvent::LocalCandidate(Blob(value))),
                    Err(e) => tracing::warn!(peer = %ctx.peer.short(), error = %e, "unencodable local candidate"),
                }
            })
        }));
    }

    {
        let ctx = ctx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let ctx = ctx.clone();
            Box::pin(async move {
                tracing::debug!(peer = %ctx.peer.short(), %state, "peer connection state");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected
                ) {
                    ctx.report(LinkEvent::Failed(format!("peer connection {state}")));
                }
            })
        }));
    }
}

fn watch_channel(
    dc: &Arc<RTCDataChannel>,
    ctx: &LinkContext,
    channel_tx: &mpsc::UnboundedSender<Arc<RTCDataChannel>>,
) {
    let _ = channel_tx.send(dc.clone());

    {
        let ctx = ctx.clone();
        dc.on_open(Box::new(move || {
            let ctx = ctx.clone();
            Box::pin(async move {
                tracing::info!(peer = %ctx.peer.short(), "data channel open");
                ctx.report(LinkEvent::ChannelOpen);
            })
        }));
    }

    {
        let ctx = ctx.clone();
        dc.on_close(Box::new(move || {
            let ctx = ctx.clone();
            Box::pin(async move {
                tracing::info!(peer = %ctx.peer.short(), "data channel closed");
                ctx.report(LinkEvent::ChannelClosed);
            })
        }));
    }

    {
        let ctx = ctx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let ctx = ctx.clone();
            Box::pin(async move {
                ctx.report(LinkEvent::Frame(msg.data));
            })
        }));
    }
}

/// Drain queued frames onto the channel, stalling while its send buffer is
/// above the low-water mark. A writer that gives up reports the link dead so
/// the mesh stops routing work to it.
async fn write_loop(
    ctx: LinkContext,
    mut channel_rx: mpsc::UnboundedReceiver<Arc<RTCDataChannel>>,
    mut frames: mpsc::UnboundedReceiver<Vec<Bytes>>,
    low_water: usize,
) {
    let Some(dc) = channel_rx.recv().await else {
        return;
    };

    let low = Arc::new(Notify::new());
    dc.set_buffered_amount_low_threshold(low_water).await;
    {
        let low = low.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let low = low.clone();
            Box::pin(async move {
                low.notify_one();
            })
        }))
        .await;
    }

    let mut pacer = SendPacer::new(low_water);
    loop {
        let buffered = dc.buffered_amount().await;
        match pacer.next(buffered) {
            Pace::Send(frame) => {
                if let Err(e) = dc.send(&frame).await {
                    tracing::warn!(
                        peer = %ctx.peer.short(),
                        error = %e,
                        bytes = frame.len(),
                        queued = pacer.len(),
                        "channel send failed"
                    );
                    ctx.report(LinkEvent::Failed(format!("send failed: {e}")));
                    return;
                }
            }
            Pace::Stall => {
                tokio::select! {
                    _ = low.notified() => {}
                    _ = tokio::time::sleep(STALL_RECHECK) => {}
                }
                if dc.ready_state() != RTCDataChannelState::Open {
                    tracing::debug!(peer = %ctx.peer.short(), queued = pacer.len(), "channel closed while stalled");
                    ctx.report(LinkEvent::ChannelClosed);
                    return;
                }
                pacer.resume();
            }
            Pace::Idle => match frames.recv().await {
                Some(batch) => pacer.extend(batch),
                None => return,
            },
        }
    }
}
