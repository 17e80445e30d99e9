//! Session handle and its driver task.
//!
//! [`StreamSession`] is a thin handle: every call either enqueues a command
//! for the driver or goes straight to the shared control channel. The driver
//! owns all other session state and processes one event at a time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::config::SessionConfig;
use crate::connector::{Connector, SessionInfo};
use crate::control::{ControlCommand, ControlLink, ControlMessage, STREAM_DISCONNECT};
use crate::errors::StreamError;
use crate::events::{EventEmitter, SessionState, StreamEvent, StreamEventListener};
use crate::input::InputEvent;
use crate::machine::{Effect, Input, SessionStateMachine};
use crate::media::{CaptureConstraints, DevicePermission, LocalTrack, MediaDevices, MediaTrackManager};
use crate::orientation::{DisplayOrientation, OrientationTracker};
use crate::peer::{MediaKind, PeerConnection, PeerConnectionFactory, TransceiverDirection};
use crate::signaling::{SignalingChannel, SignalingMessage, SignalingTransport};
use crate::stats::{StatsCollector, StatsReport, StatsSnapshot};
use crate::timers::{TimerFired, TimerKind, Timers};
use crate::transport::{TransportEvent, TransportEvents};

/// Platform capabilities a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub signaling: Arc<dyn SignalingTransport>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub permissions: Arc<dyn DevicePermission>,
}

enum Command {
    Start(SessionInfo),
    Connect(Arc<dyn Connector>),
    Stop,
}

/// Completions of work the driver spawned.
enum Internal {
    Resolved(Result<SessionInfo, StreamError>),
    Permission {
        kind: MediaKind,
        ticket: u64,
        constraints: CaptureConstraints,
        granted: bool,
    },
    Captured {
        kind: MediaKind,
        ticket: u64,
        result: Result<Arc<dyn LocalTrack>, StreamError>,
    },
    Stats(Result<StatsReport, StreamError>),
}

/// A single-use streaming session with one remote instance.
pub struct StreamSession {
    commands: mpsc::UnboundedSender<Command>,
    emitter: EventEmitter,
    control: ControlLink,
    state: watch::Receiver<SessionState>,
    stats: watch::Receiver<Option<StatsSnapshot>>,
    finished: watch::Receiver<bool>,
    orientation: Mutex<OrientationTracker>,
}

impl StreamSession {
    /// Create the session and spawn its driver. Must be called within a
    /// Tokio runtime. Nothing happens until [`start`](Self::start) or
    /// [`connect`](Self::connect).
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Self {
        let emitter = EventEmitter::new();
        let control = ControlLink::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (stats_tx, stats_rx) = watch::channel(None);
        let (finished_tx, finished_rx) = watch::channel(false);

        let driver = Driver::new(config, deps, emitter.clone(), control.clone(), state_tx, stats_tx);
        tokio::spawn(async move {
            driver.run(commands_rx).await;
            let _ = finished_tx.send(true);
        });

        Self {
            commands: commands_tx,
            emitter,
            control,
            state: state_rx,
            stats: stats_rx,
            finished: finished_rx,
            orientation: Mutex::new(OrientationTracker::default()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StreamEventListener>) {
        self.emitter.add_listener(listener);
    }

    /// Begin the session against already resolved session info.
    pub fn start(&self, info: SessionInfo) {
        self.command(Command::Start(info));
    }

    /// Resolve session info through `connector`, then start. The connector
    /// is released again on teardown.
    pub fn connect(&self, connector: Arc<dyn Connector>) {
        self.command(Command::Connect(connector));
    }

    /// End the session. Idempotent, and safe to call from a listener.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    /// Send `{type, data}` over the control channel.
    ///
    /// Returns `false` when the channel is not open.
    pub fn send_control_message(&self, kind: &str, data: Value) -> bool {
        self.control.send(kind, data)
    }

    pub fn send_input(&self, event: &InputEvent) -> bool {
        match event.to_message() {
            Ok(msg) => self.control.send_message(&msg),
            Err(e) => {
                tracing::warn!("input event dropped: {e}");
                false
            }
        }
    }

    /// Tell the remote instance about a local display rotation.
    pub fn rotate(&self, orientation: DisplayOrientation) -> bool {
        let rotation = self
            .orientation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rotate_to(orientation);
        match rotation {
            Some(rotation) => self.control.send_message(&rotation.message),
            None => false,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn latest_stats(&self) -> Option<StatsSnapshot> {
        self.stats.borrow().clone()
    }

    /// Resolves once the driver has torn the session down.
    pub async fn wait_finished(&self) {
        let mut finished = self.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("session already finished, command ignored");
        }
    }
}

struct Driver {
    config: SessionConfig,
    deps: SessionDeps,
    machine: SessionStateMachine,
    emitter: EventEmitter,
    control: ControlLink,
    state_tx: watch::Sender<SessionState>,
    stats_tx: watch::Sender<Option<StatsSnapshot>>,

    info: Option<SessionInfo>,
    connector: Option<Arc<dyn Connector>>,
    signaling: Option<Box<dyn SignalingChannel>>,
    peer: Option<Arc<dyn PeerConnection>>,
    media: MediaTrackManager,
    stats: StatsCollector,
    timers: Timers,

    transport: TransportEvents,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    pending: VecDeque<Input>,
}

impl Driver {
    fn new(
        config: SessionConfig,
        deps: SessionDeps,
        emitter: EventEmitter,
        control: ControlLink,
        state_tx: watch::Sender<SessionState>,
        stats_tx: watch::Sender<Option<StatsSnapshot>>,
    ) -> Self {
        let (transport, transport_rx) = TransportEvents::channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            config,
            deps,
            machine: SessionStateMachine::new(),
            emitter,
            control,
            state_tx,
            stats_tx,
            info: None,
            connector: None,
            signaling: None,
            peer: None,
            media: MediaTrackManager::new(),
            stats: StatsCollector::new(),
            timers: Timers::new(timer_tx),
            transport,
            transport_rx,
            internal_tx,
            internal_rx,
            timer_rx,
            pending: VecDeque::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let input = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        tracing::debug!("session handle dropped");
                        if self.machine.is_started() {
                            self.process(Input::Stop).await;
                        }
                        break;
                    }
                },
                Some(fired) = self.timer_rx.recv() => self.on_timer(fired),
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal).await,
                Some(event) = self.transport_rx.recv() => self.on_transport(event).await,
            };

            if let Some(input) = input {
                self.process(input).await;
            }
            if self.machine.is_finished() {
                break;
            }
        }
        tracing::info!("session driver exited in state {}", self.machine.state().as_str());
    }

    /// Run `input` and every follow-up input it produces through the
    /// state machine.
    async fn process(&mut self, input: Input) {
        self.pending.push_back(input);
        while let Some(input) = self.pending.pop_front() {
            for effect in self.machine.handle(input) {
                self.apply(effect).await;
            }
        }
    }

    fn on_command(&mut self, command: Command) -> Option<Input> {
        match command {
            Command::Start(info) => {
                if !self.machine.is_started() {
                    tracing::info!("starting session {}", info.id);
                    self.info = Some(info);
                }
                Some(Input::Start)
            }
            Command::Connect(connector) => {
                if !self.machine.is_started() {
                    self.connector = Some(connector);
                }
                Some(Input::Connect)
            }
            Command::Stop => Some(Input::Stop),
        }
    }

    fn on_timer(&mut self, fired: TimerFired) -> Option<Input> {
        if !self.timers.accept(fired) {
            tracing::trace!("stale {:?} timer ignored", fired.kind);
            return None;
        }
        match fired.kind {
            TimerKind::Signaling => Some(Input::SignalingTimeout),
            TimerKind::Grace => Some(Input::GraceTimeout),
            TimerKind::Stats => {
                self.poll_stats();
                None
            }
        }
    }

    async fn on_internal(&mut self, internal: Internal) -> Option<Input> {
        match internal {
            Internal::Resolved(Ok(info)) => {
                tracing::info!("session {} resolved", info.id);
                self.info = Some(info);
                Some(Input::Resolved)
            }
            Internal::Resolved(Err(e)) => {
                let e = match e {
                    StreamError::Connector(_) => e,
                    other => StreamError::Connector(other.to_string()),
                };
                Some(Input::ConnectorFailed(e))
            }
            Internal::Permission {
                kind,
                ticket,
                constraints,
                granted,
            } => {
                if !self.media.is_current(kind, ticket) {
                    tracing::debug!("{kind} permission answer superseded");
                } else if !granted {
                    tracing::info!("{kind} access denied by user");
                } else {
                    self.media.grant(kind);
                    self.spawn_capture(kind, ticket, constraints);
                }
                None
            }
            Internal::Captured {
                kind,
                ticket,
                result,
            } => {
                self.on_captured(kind, ticket, result).await;
                None
            }
            Internal::Stats(Ok(report)) => {
                if self.machine.state() == SessionState::Connected {
                    let snapshot = self.stats.fold(&report);
                    self.stats_tx.send_replace(Some(snapshot.clone()));
                    self.emitter.emit(StreamEvent::StatsUpdated(snapshot));
                }
                None
            }
            Internal::Stats(Err(e)) => {
                tracing::debug!("stats poll failed: {e}");
                None
            }
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) -> Option<Input> {
        match event {
            TransportEvent::SignalingOpened => Some(Input::SignalingOpened),
            TransportEvent::SignalingMessage(text) => Some(Input::SignalingText(text)),
            TransportEvent::SignalingError(message) => Some(Input::SignalingError(message)),
            TransportEvent::SignalingClosed => Some(Input::SignalingClosed),
            TransportEvent::LocalCandidate(candidate) => Some(Input::LocalCandidate(candidate)),
            TransportEvent::ConnectionStateChanged(state) => Some(Input::Connectivity(state)),
            TransportEvent::ControlOpened => {
                tracing::info!("control channel open");
                None
            }
            TransportEvent::ControlClosed => {
                tracing::info!("control channel closed");
                None
            }
            TransportEvent::ControlMessage(text) => {
                self.on_control_message(&text).await;
                None
            }
        }
    }

    async fn on_control_message(&mut self, text: &str) {
        let command = match ControlMessage::parse(text).and_then(ControlCommand::from_message) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("{e}");
                self.emitter.emit(StreamEvent::Error(e));
                return;
            }
        };
        tracing::debug!("control <- {command:?}");

        match command {
            ControlCommand::OpenCamera(constraints) => self.open_device(MediaKind::Video, constraints),
            ControlCommand::EnableMicrophone(constraints) => {
                self.open_device(MediaKind::Audio, constraints)
            }
            ControlCommand::CloseCamera => self.close_device(MediaKind::Video).await,
            ControlCommand::DisableMicrophone => self.close_device(MediaKind::Audio).await,
            ControlCommand::ShowIme => self.emitter.emit(StreamEvent::ImeVisibilityChanged(true)),
            ControlCommand::HideIme => self.emitter.emit(StreamEvent::ImeVisibilityChanged(false)),
            ControlCommand::Other(msg) => self.emitter.emit(StreamEvent::MessageReceived {
                kind: msg.kind,
                data: msg.data,
            }),
        }
    }

    fn open_device(&mut self, kind: MediaKind, constraints: CaptureConstraints) {
        let Some(ticket) = self.media.begin_open(kind) else {
            tracing::warn!("{kind} requested but not enabled for this session");
            return;
        };
        if self.media.is_allowed(kind) {
            self.spawn_capture(kind, ticket, constraints);
            return;
        }

        let permissions = self.deps.permissions.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let granted = permissions.request(kind).await;
            let _ = tx.send(Internal::Permission {
                kind,
                ticket,
                constraints,
                granted,
            });
        });
    }

    fn spawn_capture(&self, kind: MediaKind, ticket: u64, constraints: CaptureConstraints) {
        let devices = self.deps.devices.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = devices.capture(kind, &constraints).await;
            if let Err(mpsc::error::SendError(Internal::Captured {
                result: Ok(track), ..
            })) = tx.send(Internal::Captured {
                kind,
                ticket,
                result,
            }) {
                tracing::debug!("session gone, releasing {kind} capture");
                track.stop();
            }
        });
    }

    async fn on_captured(
        &mut self,
        kind: MediaKind,
        ticket: u64,
        result: Result<Arc<dyn LocalTrack>, StreamError>,
    ) {
        let track = match result {
            Ok(track) => track,
            Err(e) => {
                if self.media.is_current(kind, ticket) {
                    let e = match e {
                        StreamError::DeviceAccess(_) => e,
                        other => StreamError::DeviceAccess(other.to_string()),
                    };
                    self.emitter.emit(StreamEvent::Error(e));
                }
                return;
            }
        };
        let Some(peer) = self.peer.clone() else {
            track.stop();
            return;
        };
        if !self.media.is_current(kind, ticket) {
            tracing::debug!("{kind} capture superseded, stopping it");
            track.stop();
            return;
        }
        if let Err(e) = self.media.swap_in(peer.as_ref(), kind, track).await {
            self.emitter.emit(StreamEvent::Error(e));
        }
    }

    async fn close_device(&mut self, kind: MediaKind) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        match self.media.swap_out(peer.as_ref(), kind).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("{kind} close ignored, not capturing"),
            Err(e) => self.emitter.emit(StreamEvent::Error(e)),
        }
    }

    /// Stats are sampled only while media is flowing.
    fn poll_stats(&self) {
        if self.machine.state() != SessionState::Connected {
            tracing::trace!("stats poll skipped in {}", self.machine.state().as_str());
            return;
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Internal::Stats(peer.stats().await));
        });
    }

    async fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::ResolveSession => {
                let Some(connector) = self.connector.clone() else {
                    self.pending.push_back(Input::ConnectorFailed(StreamError::Connector(
                        "no connector".into(),
                    )));
                    return;
                };
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(Internal::Resolved(connector.connect().await));
                });
            }
            Effect::OpenSignaling => self.open_signaling(),
            Effect::ArmSignalingTimeout => {
                self.timers.arm(TimerKind::Signaling, self.config.signaling_timeout())
            }
            Effect::CancelSignalingTimeout => self.timers.cancel(TimerKind::Signaling),
            Effect::ArmGraceTimer => self.timers.arm(TimerKind::Grace, self.config.grace_period()),
            Effect::CancelGraceTimer => self.timers.cancel(TimerKind::Grace),
            Effect::Negotiate => {
                if let Err(e) = self.negotiate().await {
                    let e = if e.is_fatal() {
                        e
                    } else {
                        StreamError::Transport(e.to_string())
                    };
                    self.pending.push_back(Input::NegotiationFailed(e));
                }
            }
            Effect::ApplyAnswer(sdp) => {
                let Some(peer) = self.peer.clone() else {
                    tracing::warn!("answer before peer connection, ignored");
                    return;
                };
                if let Err(e) = peer.set_remote_answer(&sdp).await {
                    self.pending.push_back(Input::NegotiationFailed(StreamError::Transport(
                        format!("remote answer rejected: {e}"),
                    )));
                }
            }
            Effect::ApplyCandidate(candidate) => {
                let Some(peer) = self.peer.clone() else {
                    tracing::warn!("candidate before peer connection, ignored");
                    return;
                };
                if let Err(e) = peer.add_ice_candidate(&candidate).await {
                    tracing::warn!("remote candidate rejected: {e}");
                }
            }
            Effect::SendSignaling(message) => self.send_signaling(&message),
            Effect::CloseSignaling => {
                if let Some(channel) = self.signaling.take() {
                    tracing::info!("handing off from signaling to control channel");
                    channel.close();
                }
            }
            Effect::StartStats => self.timers.every(TimerKind::Stats, self.config.stats_interval()),
            Effect::State(state) => {
                self.state_tx.send_replace(state);
                self.emitter.emit(StreamEvent::StateChanged(state));
            }
            Effect::Teardown { farewell } => self.teardown(farewell).await,
            Effect::Notify(event) => self.emitter.emit(event),
        }
    }

    fn open_signaling(&mut self) {
        let Some(url) = self.info.as_ref().map(|i| i.signaling_url.clone()) else {
            self.pending
                .push_back(Input::SignalingError("no session info".into()));
            return;
        };
        tracing::info!("opening signaling channel: {url}");
        match self.deps.signaling.open(&url, self.transport.clone()) {
            Ok(channel) => self.signaling = Some(channel),
            Err(e) => self.pending.push_back(Input::SignalingError(e.to_string())),
        }
    }

    fn send_signaling(&self, message: &SignalingMessage) {
        let Some(channel) = self.signaling.as_ref() else {
            tracing::debug!("signaling closed, '{}' not sent", message.kind());
            return;
        };
        match channel.send(message) {
            Ok(()) => tracing::debug!("signaling -> {}", message.kind()),
            Err(e) => tracing::warn!("signaling send failed: {e}"),
        }
    }

    /// Build the peer connection, its transceivers and control channel, and
    /// send the local offer.
    async fn negotiate(&mut self) -> Result<(), StreamError> {
        let ice_servers = self
            .info
            .as_ref()
            .map(|i| i.ice_servers.clone())
            .unwrap_or_default();
        let peer = self
            .deps
            .peers
            .create(&ice_servers, self.transport.clone())
            .await?;
        self.peer = Some(peer.clone());

        let mut capture_kinds = Vec::new();
        if self.config.enable_microphone {
            capture_kinds.push(MediaKind::Audio);
        }
        if self.config.enable_camera {
            capture_kinds.push(MediaKind::Video);
        }
        self.media = MediaTrackManager::with_placeholders(self.deps.devices.as_ref(), &capture_kinds)?;

        let audio = TransceiverDirection::for_audio(
            self.config.enable_speaker,
            self.config.enable_microphone,
        );
        let audio_track = if audio.sends() {
            self.media.placeholder(MediaKind::Audio)
        } else {
            None
        };
        if let Some(sender) = peer.add_transceiver(MediaKind::Audio, audio, audio_track).await? {
            self.media.bind_sender(MediaKind::Audio, sender);
        }

        peer.add_transceiver(MediaKind::Video, TransceiverDirection::RecvOnly, None)
            .await?;
        if self.config.enable_camera {
            let placeholder = self.media.placeholder(MediaKind::Video);
            if let Some(sender) = peer
                .add_transceiver(MediaKind::Video, TransceiverDirection::SendOnly, placeholder)
                .await?
            {
                self.media.bind_sender(MediaKind::Video, sender);
            }
        }

        let channel = peer
            .create_control_channel(&self.config.control_channel_label)
            .await?;
        self.control.attach(channel);

        let sdp = peer.create_offer().await?;
        self.send_signaling(&SignalingMessage::offer(&sdp));
        Ok(())
    }

    async fn teardown(&mut self, farewell: bool) {
        if farewell && self.control.send(STREAM_DISCONNECT, Value::Null) {
            tracing::debug!("farewell sent");
        }
        self.timers.cancel_all();
        self.media.release_all();
        self.control.detach();
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        if let Some(channel) = self.signaling.take() {
            channel.close();
        }
        if let Some(connector) = self.connector.take() {
            connector.disconnect().await;
        }
        tracing::info!("session torn down");
    }
}
