//! In-memory capabilities for driving sessions in tests.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::connector::{Connector, IceServer, SessionInfo};
use crate::control::ControlChannel;
use crate::errors::StreamError;
use crate::events::{StreamEvent, StreamEventListener};
use crate::media::{CaptureConstraints, DevicePermission, LocalTrack, MediaDevices};
use crate::peer::{
    MediaKind, PeerConnection, PeerConnectionFactory, SenderId, TransceiverDirection,
};
use crate::signaling::{IceCandidate, SignalingChannel, SignalingMessage, SignalingTransport};
use crate::stats::StatsReport;
use crate::transport::{TransportEvent, TransportEvents};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn session_info() -> SessionInfo {
    SessionInfo {
        id: "session-1".into(),
        signaling_url: "wss://gateway.test/1.0/sessions/session-1/sockets/client".into(),
        ice_servers: vec![IceServer {
            urls: vec!["stun:stun.test:3478".into()],
            username: None,
            credential: None,
        }],
    }
}

// --- signaling ---

#[derive(Default)]
pub struct SignalingLog {
    pub urls: Vec<String>,
    pub sent: Vec<SignalingMessage>,
    pub closed: bool,
}

pub struct MockSignaling {
    auto_open: bool,
    fail_open: bool,
    log: Arc<Mutex<SignalingLog>>,
    events: Mutex<Option<TransportEvents>>,
}

impl MockSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            auto_open: true,
            fail_open: false,
            log: Arc::default(),
            events: Mutex::new(None),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            auto_open: false,
            fail_open: true,
            log: Arc::default(),
            events: Mutex::new(None),
        })
    }

    pub fn log(&self) -> MutexGuard<'_, SignalingLog> {
        lock(&self.log)
    }

    /// Deliver a raw text frame as if the remote side sent it.
    pub fn receive(&self, text: &str) {
        self.emit(TransportEvent::SignalingMessage(text.to_string()));
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            events.emit(event);
        }
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.log().sent.iter().map(|m| m.kind()).collect()
    }
}

struct MockSignalingChannel {
    log: Arc<Mutex<SignalingLog>>,
}

impl SignalingChannel for MockSignalingChannel {
    fn send(&self, message: &SignalingMessage) -> Result<(), StreamError> {
        let mut log = lock(&self.log);
        if log.closed {
            return Err(StreamError::Signaling("channel closed".into()));
        }
        log.sent.push(message.clone());
        Ok(())
    }

    fn close(&self) {
        lock(&self.log).closed = true;
    }
}

impl SignalingTransport for MockSignaling {
    fn open(
        &self,
        url: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn SignalingChannel>, StreamError> {
        if self.fail_open {
            return Err(StreamError::Signaling("connection refused".into()));
        }
        lock(&self.log).urls.push(url.to_string());
        if self.auto_open {
            events.emit(TransportEvent::SignalingOpened);
        }
        *lock(&self.events) = Some(events);
        Ok(Box::new(MockSignalingChannel {
            log: self.log.clone(),
        }))
    }
}

// --- control channel ---

#[derive(Default)]
pub struct MockControl {
    pub closed: AtomicBool,
    pub sent: Mutex<Vec<String>>,
}

impl MockControl {
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }
}

impl ControlChannel for MockControl {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: String) -> Result<(), StreamError> {
        lock(&self.sent).push(text);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// --- peer connection ---

#[derive(Debug, Clone, PartialEq)]
pub struct Transceiver {
    pub kind: MediaKind,
    pub direction: TransceiverDirection,
    pub track: Option<String>,
    pub sender: Option<SenderId>,
}

#[derive(Default)]
pub struct PeerState {
    pub ice_servers: Vec<IceServer>,
    pub transceivers: Vec<Transceiver>,
    pub replaced: Vec<(SenderId, String)>,
    pub answers: Vec<String>,
    pub candidates: Vec<IceCandidate>,
    pub offers: usize,
    pub stats: StatsReport,
    pub fail_replace: bool,
    pub fail_offer: bool,
    pub closed: bool,
}

pub struct MockPeer {
    state: Mutex<PeerState>,
    next_sender: AtomicU32,
    pub control: Arc<MockControl>,
}

impl MockPeer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PeerState::default()),
            next_sender: AtomicU32::new(1),
            control: Arc::new(MockControl::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, PeerState> {
        lock(&self.state)
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
        track: Option<Arc<dyn LocalTrack>>,
    ) -> Result<Option<SenderId>, StreamError> {
        let sender = direction
            .sends()
            .then(|| SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst)));
        self.state().transceivers.push(Transceiver {
            kind,
            direction,
            track: track.map(|t| t.id().to_string()),
            sender,
        });
        Ok(sender)
    }

    async fn create_control_channel(
        &self,
        _label: &str,
    ) -> Result<Arc<dyn ControlChannel>, StreamError> {
        Ok(self.control.clone())
    }

    async fn create_offer(&self) -> Result<String, StreamError> {
        let mut state = self.state();
        if state.fail_offer {
            return Err(StreamError::Transport("offer rejected".into()));
        }
        state.offers += 1;
        Ok("v=0\r\n".into())
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), StreamError> {
        self.state().answers.push(sdp.to_string());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), StreamError> {
        self.state().candidates.push(candidate.clone());
        Ok(())
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), StreamError> {
        let mut state = self.state();
        if state.fail_replace {
            return Err(StreamError::Transport("sender gone".into()));
        }
        state.replaced.push((sender, track.id().to_string()));
        Ok(())
    }

    async fn stats(&self) -> Result<StatsReport, StreamError> {
        Ok(self.state().stats.clone())
    }

    async fn close(&self) {
        self.state().closed = true;
    }
}

#[derive(Default)]
pub struct MockPeerFactory {
    pub fail: AtomicBool,
    peers: Mutex<Vec<Arc<MockPeer>>>,
    events: Mutex<Option<TransportEvents>>,
    pub configure: Mutex<Option<Box<dyn Fn(&MockPeer) + Send + Sync>>>,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peer(&self) -> Option<Arc<MockPeer>> {
        lock(&self.peers).last().cloned()
    }

    pub fn created(&self) -> usize {
        lock(&self.peers).len()
    }

    /// Report a peer-side event (connectivity, control traffic, candidates).
    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            events.emit(event);
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerConnection>, StreamError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StreamError::Transport("no peer".into()));
        }
        let peer = Arc::new(MockPeer::new());
        peer.state().ice_servers = ice_servers.to_vec();
        if let Some(configure) = lock(&self.configure).as_ref() {
            configure(&peer);
        }
        lock(&self.peers).push(peer.clone());
        *lock(&self.events) = Some(events);
        Ok(peer)
    }
}

// --- media ---

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    kind: MediaKind,
    placeholder: bool,
    stopped: Arc<Mutex<HashSet<String>>>,
}

impl LocalTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    fn stop(&self) {
        lock(&self.stopped).insert(self.id.clone());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct MockDevices {
    next: AtomicUsize,
    stopped: Arc<Mutex<HashSet<String>>>,
    captured: Mutex<Vec<String>>,
    capture_delay: Option<Duration>,
    fail_capture: bool,
}

impl MockDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capture_delay(delay: Duration) -> Self {
        Self {
            capture_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_capture: true,
            ..Self::default()
        }
    }

    pub fn is_stopped(&self, id: &str) -> bool {
        lock(&self.stopped).contains(id)
    }

    pub fn captured(&self) -> Vec<String> {
        lock(&self.captured).clone()
    }

    fn track(&self, kind: MediaKind, placeholder: bool) -> Arc<dyn LocalTrack> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let prefix = if placeholder { "placeholder" } else { "capture" };
        Arc::new(MockTrack {
            id: format!("{prefix}-{kind}-{n}"),
            kind,
            placeholder,
            stopped: self.stopped.clone(),
        })
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    fn placeholder(&self, kind: MediaKind) -> Result<Arc<dyn LocalTrack>, StreamError> {
        Ok(self.track(kind, true))
    }

    async fn capture(
        &self,
        kind: MediaKind,
        _constraints: &CaptureConstraints,
    ) -> Result<Arc<dyn LocalTrack>, StreamError> {
        if let Some(delay) = self.capture_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_capture {
            return Err(StreamError::DeviceAccess(format!("no {kind} device")));
        }
        let track = self.track(kind, false);
        lock(&self.captured).push(track.id().to_string());
        Ok(track)
    }
}

pub struct MockPermission {
    grant: bool,
    pub requests: AtomicUsize,
}

impl MockPermission {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            grant: true,
            requests: AtomicUsize::new(0),
        })
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(Self {
            grant: false,
            requests: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DevicePermission for MockPermission {
    async fn request_camera(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.grant
    }

    async fn request_microphone(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.grant
    }
}

// --- connector ---

pub struct MockConnector {
    result: Result<SessionInfo, StreamError>,
    pub disconnects: AtomicUsize,
}

impl MockConnector {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            result: Ok(session_info()),
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Err(StreamError::Connector(message.to_string())),
            disconnects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<SessionInfo, StreamError> {
        self.result.clone()
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

// --- listener ---

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<StreamEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, pred: impl Fn(&StreamEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| pred(e)).count()
    }

    pub fn errors(&self) -> Vec<StreamError> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Error(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }
}

impl StreamEventListener for Recorder {
    fn on_event(&self, event: StreamEvent) {
        lock(&self.events).push(event);
    }
}
