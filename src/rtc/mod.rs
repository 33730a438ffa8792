//! WebRTC signaling service and audio loopback
//!
//! One `RtcService` owns the WebRTC API object (Opus-only media engine)
//! and drives a `PeerSession` per accepted signaling socket:
//!
//! - offer/answer/candidate frames arrive as JSON text on the WebSocket
//! - remote audio is read packet-by-packet and written straight back on
//!   the outbound track
//! - a data channel labelled `cmd` carries small JSON command envelopes

pub mod peer;

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use axum::extract::ws::{Message, WebSocket};
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::session::{SessionError, SessionManager, SessionState};
use crate::signal::{CommandEnvelope, SignalMessage};
use crate::storage::FrameStore;
use peer::{Outbound, PeerSession};

const OPUS_PAYLOAD_TYPE: u8 = 111;

pub struct RtcService {
    api: API,
    config: Config,
    metrics: Arc<Metrics>,
    sessions: Arc<SessionManager>,
    store: Arc<FrameStore>,
    started: Instant,
}

impl RtcService {
    pub fn new(
        config: Config,
        metrics: Arc<Metrics>,
        sessions: Arc<SessionManager>,
        store: Arc<FrameStore>,
    ) -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: String::new(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: OPUS_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .context("register opus codec")?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media).context("interceptors")?;
        let mut setting = SettingEngine::default();
        // Loopback candidates let a client on the same host connect.
        setting.set_include_loopback_candidate(true);

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_setting_engine(setting)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            config,
            metrics,
            sessions,
            store,
            started: Instant::now(),
        })
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut out = Vec::with_capacity(2);
        if !self.config.webrtc_stun_urls.is_empty() {
            out.push(RTCIceServer {
                urls: self.config.webrtc_stun_urls.clone(),
                ..Default::default()
            });
        }
        if !self.config.webrtc_turn_urls.is_empty() {
            out.push(RTCIceServer {
                urls: self.config.webrtc_turn_urls.clone(),
                username: self.config.webrtc_turn_user.clone(),
                credential: self.config.webrtc_turn_pass.clone(),
            });
        }
        out
    }

    /// Run one signaling session over an upgraded WebSocket until the peer
    /// says bye, the transport fails, or the session is kicked.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        self.metrics.ws_connections_total.inc();

        let (sink, stream) = socket.split();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_loop(sink, signal_rx));

        let id = format!("sess-{}", unix_nanos());
        let peer = PeerSession::new(id, signal_tx.clone(), self.sessions.clone());

        if let Err(SessionError::AlreadyActive) = self.sessions.acquire(peer.clone()) {
            self.metrics.ws_reject_total.inc();
            info!(session = peer.id(), "second session rejected");
            let _ = signal_tx.send(Outbound::Signal(SignalMessage::error(
                "session already active",
            )));
            let _ = signal_tx.send(Outbound::Shutdown);
            let _ = writer.await;
            return;
        }

        info!(session = peer.id(), "signaling session started");
        if let Err(e) = self.init_peer(&peer).await {
            warn!(session = peer.id(), error = %e, "init peer failed");
            peer.close("init_failed");
        } else {
            self.read_loop(&peer, stream).await;
        }

        peer.close("session_ended");
        let _ = writer.await;
        info!(session = peer.id(), "signaling session ended");
    }

    async fn read_loop(&self, peer: &Arc<PeerSession>, mut stream: SplitStream<WebSocket>) {
        loop {
            tokio::select! {
                _ = peer.cancelled() => return,
                msg = stream.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(session = peer.id(), error = %e, "signaling read error");
                            return;
                        }
                    };
                    self.sessions.touch();
                    let parsed: SignalMessage = match serde_json::from_str(&text) {
                        Ok(parsed) => parsed,
                        Err(_) => {
                            peer.send_signal(SignalMessage::error("invalid json"));
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_signal(peer, parsed).await {
                        warn!(session = peer.id(), error = %e, "signal error");
                        peer.send_signal(SignalMessage::error(e.to_string()));
                    }
                }
            }
        }
    }

    /// Wire a fresh peer connection to the session: loopback track,
    /// state/candidate callbacks, and the `cmd` data channel.
    async fn init_peer(self: &Arc<Self>, peer: &Arc<PeerSession>) -> Result<()> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: self.ice_servers(),
                    ..Default::default()
                })
                .await
                .context("new peer connection")?,
        );
        peer.set_peer_connection(pc.clone());

        let out_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "ermete".to_owned(),
        ));
        pc.add_track(Arc::clone(&out_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("add loopback track")?;

        {
            let peer = peer.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let peer = peer.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => peer.send_signal(SignalMessage::candidate(init)),
                        Err(e) => warn!(error = %e, "ice candidate to json failed"),
                    }
                })
            }));
        }

        {
            let sessions = self.sessions.clone();
            let session_id = peer.id().to_string();
            pc.on_ice_connection_state_change(Box::new(move |state| {
                let sessions = sessions.clone();
                let session_id = session_id.clone();
                Box::pin(async move {
                    info!(session = %session_id, state = %state, "ice state");
                    match state {
                        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                            sessions.set_state(SessionState::Connected)
                        }
                        RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => {
                            sessions.set_state(SessionState::Connecting)
                        }
                        _ => {}
                    }
                })
            }));
        }

        {
            let peer = peer.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let peer = peer.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        peer.close("peer_connection_closed");
                    }
                })
            }));
        }

        {
            let svc = self.clone();
            let peer = peer.clone();
            pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
                let svc = svc.clone();
                let peer = peer.clone();
                let out_track = out_track.clone();
                Box::pin(async move {
                    if remote.kind() != RTPCodecType::Audio {
                        return;
                    }
                    debug!(session = peer.id(), "remote audio track, loopback starting");
                    tokio::spawn(async move {
                        loop {
                            let pkt = match remote.read_rtp().await {
                                Ok((pkt, _)) => pkt,
                                Err(_) => break,
                            };
                            svc.metrics.webrtc_packets_in.inc();
                            svc.sessions.touch();
                            if out_track.write_rtp(&pkt).await.is_err() {
                                break;
                            }
                            svc.metrics.webrtc_packets_out.inc();
                        }
                        debug!(session = peer.id(), "loopback ended");
                    });
                })
            }));
        }

        {
            let svc = self.clone();
            let peer = peer.clone();
            pc.on_data_channel(Box::new(move |dc| {
                let svc = svc.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    if dc.label() != "cmd" {
                        return;
                    }
                    peer.set_cmd_channel(dc.clone());
                    let svc = svc.clone();
                    let peer = peer.clone();
                    dc.on_message(Box::new(move |msg| {
                        let svc = svc.clone();
                        let peer = peer.clone();
                        Box::pin(async move {
                            let reply = svc.dispatch_command(&msg);
                            peer.send_cmd(reply).await;
                        })
                    }));
                })
            }));
        }

        // Server-originated channel so commands work even if the peer
        // never opens one. Failure is non-fatal.
        if let Err(e) = pc.create_data_channel("cmd", None).await {
            warn!(session = peer.id(), error = %e, "server cmd channel create failed");
        }
        Ok(())
    }

    async fn handle_signal(&self, peer: &Arc<PeerSession>, msg: SignalMessage) -> Result<()> {
        match msg.kind.as_str() {
            "offer" => {
                let sdp = match msg.sdp {
                    Some(sdp) if !sdp.is_empty() => sdp,
                    _ => bail!("missing offer sdp"),
                };
                let pc = peer
                    .peer_connection()
                    .context("peer connection not ready")?;
                let offer = RTCSessionDescription::offer(sdp).context("parse offer")?;
                pc.set_remote_description(offer)
                    .await
                    .context("set remote description")?;
                let answer = pc.create_answer(None).await.context("create answer")?;
                pc.set_local_description(answer.clone())
                    .await
                    .context("set local description")?;
                peer.send_signal(SignalMessage::answer(answer.sdp));
                Ok(())
            }
            "candidate" => {
                let init = msg.candidate.context("missing candidate")?;
                let pc = peer
                    .peer_connection()
                    .context("peer connection not ready")?;
                pc.add_ice_candidate(init)
                    .await
                    .context("add ice candidate")?;
                Ok(())
            }
            "bye" => {
                peer.close("remote_bye");
                Ok(())
            }
            other => bail!("unknown signal type: {}", other),
        }
    }

    /// Build the reply for one `cmd` channel message.
    fn dispatch_command(&self, msg: &DataChannelMessage) -> CommandEnvelope {
        if !msg.is_string {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&msg.data);
            return CommandEnvelope::bin("pong", encoded);
        }
        let env: CommandEnvelope = match serde_json::from_slice(&msg.data) {
            Ok(env) => env,
            Err(_) => return CommandEnvelope::text("error", "invalid command envelope"),
        };
        match env.kind.as_str() {
            "ping" => CommandEnvelope::text("pong", "ok"),
            "server_status" => {
                let (last, count) = self.store.last_meta();
                let payload = serde_json::json!({
                    "session": self.sessions.snapshot(),
                    "last_frame": last,
                    "frames_count": count,
                    "uptime_seconds": self.started.elapsed().as_secs(),
                });
                CommandEnvelope::text("server_status", payload.to_string())
            }
            "say" => CommandEnvelope::text("say", "audio loopback active"),
            _ => CommandEnvelope::text("error", "unknown command"),
        }
    }
}

async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Signal(msg) => {
                let Ok(text) = serde_json::to_string(&msg) else {
                    continue;
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Shutdown => break,
        }
    }
    let _ = sink.close().await;
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
