//! `PeerConnection` over webrtc-rs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use vdstream_core::{
    ConnectionState, ControlChannel, IceCandidate, IceServer, LocalTrack, MediaKind,
    PeerConnection, PeerConnectionFactory, SenderId, StatsReport, StreamError,
    TransceiverDirection, TransportEvent, TransportEvents,
};

use crate::error::RtcError;
use crate::stats::map_report;
use crate::track::SampleTrack;

/// Called for every remote track the peer starts receiving.
pub type RemoteTrackHandler = Arc<dyn Fn(Arc<TrackRemote>) + Send + Sync>;

/// Creates [`RtcPeer`]s.
#[derive(Default, Clone)]
pub struct RtcPeerFactory {
    on_remote_track: Option<RemoteTrackHandler>,
}

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand remote tracks to a renderer.
    pub fn with_remote_track_handler(mut self, handler: RemoteTrackHandler) -> Self {
        self.on_remote_track = Some(handler);
        self
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerConnection>, StreamError> {
        let peer = RtcPeer::new(ice_servers, events, self.on_remote_track.clone()).await?;
        Ok(Arc::new(peer))
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: TransportEvents,
    senders: Mutex<HashMap<u32, Arc<RTCRtpSender>>>,
    next_sender: AtomicU32,
    remote_described: AtomicBool,
    /// Remote candidates received before the answer.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    control_writer: Mutex<Option<JoinHandle<()>>>,
    created_at: Instant,
}

/// How long closing the peer waits for queued control frames.
const CONTROL_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

impl RtcPeer {
    pub async fn new(
        ice_servers: &[IceServer],
        events: TransportEvents,
        on_remote_track: Option<RemoteTrackHandler>,
    ) -> Result<Self, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        info!("peer connection created with {} ice servers", ice_servers.len());

        let peer = Self {
            pc,
            events,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU32::new(1),
            remote_described: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            control_writer: Mutex::new(None),
            created_at: Instant::now(),
        };
        peer.setup_event_handlers(on_remote_track);
        Ok(peer)
    }

    fn setup_event_handlers(&self, on_remote_track: Option<RemoteTrackHandler>) {
        let events = self.events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                debug!("ice connection state: {}", s);
                if let Some(state) = connection_state(s) {
                    events.emit(TransportEvent::ConnectionStateChanged(state));
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` marks the end of gathering.
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            debug!("local ice candidate: {}", init.candidate);
                            events.emit(TransportEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }));
                        }
                        Err(e) => warn!("failed to serialise local candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                info!("remote {} track: {}", track.kind(), track.id());
                if let Some(handler) = &on_remote_track {
                    handler(track);
                }
                Box::pin(async {})
            },
        ));
    }

    fn rtc_track(track: &Arc<dyn LocalTrack>) -> Result<Arc<dyn TrackLocal + Send + Sync>, RtcError> {
        let sample = track
            .as_any()
            .downcast_ref::<SampleTrack>()
            .ok_or_else(|| RtcError::ForeignTrack(track.id().to_string()))?;
        let rtc: Arc<dyn TrackLocal + Send + Sync> = sample.rtc_track();
        Ok(rtc)
    }

    fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>, RtcError> {
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id.0)
            .cloned()
            .ok_or(RtcError::UnknownSender(id.0))
    }

    async fn apply_candidate(&self, init: RTCIceCandidateInit) {
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            warn!("remote candidate rejected: {}", e);
        }
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
        track: Option<Arc<dyn LocalTrack>>,
    ) -> Result<Option<SenderId>, StreamError> {
        let init = RTCRtpTransceiverInit {
            direction: rtc_direction(direction),
            send_encodings: vec![],
        };
        let transceiver = match &track {
            Some(track) => {
                let rtc = Self::rtc_track(track)?;
                self.pc
                    .add_transceiver_from_track(rtc, Some(init))
                    .await
                    .map_err(RtcError::from)?
            }
            None => self
                .pc
                .add_transceiver_from_kind(codec_type(kind), Some(init))
                .await
                .map_err(RtcError::from)?,
        };
        debug!("{} transceiver added ({:?})", kind, direction);

        if !direction.sends() {
            return Ok(None);
        }
        let id = self.next_sender.fetch_add(1, Ordering::Relaxed);
        let sender = transceiver.sender().await;
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, sender);
        Ok(Some(SenderId(id)))
    }

    async fn create_control_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn ControlChannel>, StreamError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(RtcError::from)?;
        info!("data channel '{}' created", label);
        let (channel, writer) = RtcControlChannel::new(dc, self.events.clone());
        if let Some(previous) = self
            .control_writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(writer)
        {
            previous.abort();
        }
        Ok(Arc::new(channel))
    }

    async fn create_offer(&self) -> Result<String, StreamError> {
        let offer = self.pc.create_offer(None).await.map_err(RtcError::from)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(RtcError::from)?;
        Ok(offer.sdp)
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), StreamError> {
        let answer = RTCSessionDescription::answer(sdp.to_string()).map_err(RtcError::from)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(RtcError::from)?;
        self.remote_described.store(true, Ordering::SeqCst);

        let pending = std::mem::take(
            &mut *self
                .pending_candidates
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        if !pending.is_empty() {
            debug!("applying {} early remote candidates", pending.len());
        }
        for init in pending {
            self.apply_candidate(init).await;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), StreamError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        if !self.remote_described.load(Ordering::SeqCst) {
            self.pending_candidates
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(init);
            return Ok(());
        }
        self.pc.add_ice_candidate(init).await.map_err(RtcError::from)?;
        Ok(())
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), StreamError> {
        let rtc_sender = self.sender(sender)?;
        let rtc = Self::rtc_track(&track)?;
        rtc_sender
            .replace_track(Some(rtc))
            .await
            .map_err(RtcError::from)?;
        debug!("sender {} now sends {}", sender.0, track.id());
        Ok(())
    }

    async fn stats(&self) -> Result<StatsReport, StreamError> {
        let report = self.pc.get_stats().await;
        let now_ms = self.created_at.elapsed().as_secs_f64() * 1000.0;
        Ok(map_report(&report, now_ms))
    }

    async fn close(&self) {
        let writer = self
            .control_writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(writer) = writer {
            if tokio::time::timeout(CONTROL_FLUSH_TIMEOUT, writer).await.is_err() {
                debug!("control writer still busy, closing anyway");
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!("peer connection close failed: {}", e);
        }
        self.senders.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Control channel over an `RTCDataChannel`.
///
/// Sends are queued to a writer task so `send_text` never blocks the caller.
/// Closing goes through the same queue, after every frame sent before it.
pub struct RtcControlChannel {
    dc: Arc<RTCDataChannel>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

#[async_trait]
trait FrameWriter: Send + Sync {
    async fn write_text(&self, text: String) -> Result<(), String>;
    async fn shut(&self) -> Result<(), String>;
}

#[async_trait]
impl FrameWriter for RTCDataChannel {
    async fn write_text(&self, text: String) -> Result<(), String> {
        self.send_text(text).await.map(|_| ()).map_err(|e| e.to_string())
    }

    async fn shut(&self) -> Result<(), String> {
        self.close().await.map_err(|e| e.to_string())
    }
}

/// Drains the queue in order. Frames queued after `Close` are dropped.
async fn run_control_writer<W: FrameWriter>(
    writer: Arc<W>,
    label: String,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Text(text) => {
                if let Err(e) = writer.write_text(text).await {
                    warn!("data channel '{}' send failed: {}", label, e);
                }
            }
            Outgoing::Close => {
                if let Err(e) = writer.shut().await {
                    debug!("data channel '{}' close: {}", label, e);
                }
                return;
            }
        }
    }
}

impl RtcControlChannel {
    fn new(dc: Arc<RTCDataChannel>, events: TransportEvents) -> (Self, JoinHandle<()>) {
        let label = dc.label().to_string();

        let on_open = events.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            info!("data channel '{}' open", open_label);
            on_open.emit(TransportEvent::ControlOpened);
            Box::pin(async {})
        }));

        let on_close = events.clone();
        dc.on_close(Box::new(move || {
            on_close.emit(TransportEvent::ControlClosed);
            Box::pin(async {})
        }));

        let on_message = events;
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            if msg.is_string {
                let text = String::from_utf8_lossy(&msg.data).into_owned();
                on_message.emit(TransportEvent::ControlMessage(text));
            } else {
                debug!("ignoring {} byte binary control frame", msg.data.len());
            }
            Box::pin(async {})
        }));

        let (outgoing, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_control_writer(dc.clone(), label, rx));

        (Self { dc, outgoing }, writer)
    }
}

impl ControlChannel for RtcControlChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn send_text(&self, text: String) -> Result<(), StreamError> {
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| StreamError::Transport("control channel writer stopped".to_string()))
    }

    fn close(&self) {
        if self.outgoing.send(Outgoing::Close).is_err() {
            debug!("data channel '{}' already closed", self.dc.label());
        }
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn rtc_direction(direction: TransceiverDirection) -> RTCRtpTransceiverDirection {
    match direction {
        TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
        TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn connection_state(state: RTCIceConnectionState) -> Option<ConnectionState> {
    let state = match state {
        RTCIceConnectionState::New => ConnectionState::New,
        RTCIceConnectionState::Checking => ConnectionState::Checking,
        RTCIceConnectionState::Connected => ConnectionState::Connected,
        RTCIceConnectionState::Completed => ConnectionState::Completed,
        RTCIceConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCIceConnectionState::Failed => ConnectionState::Failed,
        RTCIceConnectionState::Closed => ConnectionState::Closed,
        _ => return None,
    };
    Some(state)
}
