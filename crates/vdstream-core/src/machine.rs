//! Session lifecycle as a pure state machine.
//!
//! The driver feeds every lifecycle-relevant input through
//! [`SessionStateMachine::handle`] and executes the returned effects in
//! order. Nothing in here performs I/O.

use crate::errors::StreamError;
use crate::events::{SessionState, StreamEvent};
use crate::peer::ConnectionState;
use crate::signaling::{IceCandidate, SignalingMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Session info is known; open signaling right away.
    Start,
    /// Session info is being resolved by a connector.
    Connect,
    /// The connector produced session info.
    Resolved,
    ConnectorFailed(StreamError),
    SignalingOpened,
    SignalingError(String),
    SignalingClosed,
    SignalingText(String),
    LocalCandidate(IceCandidate),
    Connectivity(ConnectionState),
    /// Building the peer connection or the offer failed.
    NegotiationFailed(StreamError),
    SignalingTimeout,
    GraceTimeout,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ResolveSession,
    OpenSignaling,
    ArmSignalingTimeout,
    CancelSignalingTimeout,
    ArmGraceTimer,
    CancelGraceTimer,
    Negotiate,
    ApplyAnswer(String),
    ApplyCandidate(IceCandidate),
    SendSignaling(SignalingMessage),
    CloseSignaling,
    StartStats,
    State(SessionState),
    /// Release every session resource. `farewell` asks for a best-effort
    /// `stream::disconnect` first.
    Teardown { farewell: bool },
    Notify(StreamEvent),
}

#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    started: bool,
    finished: bool,
    ready: bool,
    signaling_open: bool,
    protocol_strikes: u8,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            started: false,
            finished: false,
            ready: false,
            signaling_open: false,
            protocol_strikes: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        if self.finished {
            tracing::trace!("session finished, ignoring {input:?}");
            return Vec::new();
        }

        match input {
            Input::Start | Input::Connect if self.started => {
                tracing::warn!("session already started; sessions are single-use");
                Vec::new()
            }
            Input::Start => {
                self.started = true;
                let mut fx = vec![Effect::ArmSignalingTimeout, Effect::OpenSignaling];
                self.transition(SessionState::SignalingOpen, &mut fx);
                fx
            }
            Input::Connect => {
                self.started = true;
                vec![Effect::ArmSignalingTimeout, Effect::ResolveSession]
            }
            Input::Resolved => {
                if self.state != SessionState::Idle {
                    return Vec::new();
                }
                let mut fx = vec![Effect::OpenSignaling];
                self.transition(SessionState::SignalingOpen, &mut fx);
                fx
            }
            Input::ConnectorFailed(e) => self.fail(e, SessionState::Failed),

            Input::SignalingOpened => {
                if self.state != SessionState::SignalingOpen {
                    return Vec::new();
                }
                self.signaling_open = true;
                let mut fx = Vec::new();
                self.transition(SessionState::Negotiating, &mut fx);
                fx.push(Effect::Negotiate);
                fx
            }
            Input::SignalingError(message) => {
                if self.in_signaling_phase() {
                    self.fail(StreamError::Signaling(message), SessionState::Failed)
                } else {
                    tracing::debug!("signaling error after handoff ignored: {message}");
                    Vec::new()
                }
            }
            Input::SignalingClosed => {
                let was_open = std::mem::take(&mut self.signaling_open);
                if self.in_signaling_phase() {
                    let reason = if was_open {
                        "signaling channel closed"
                    } else {
                        "signaling channel could not be opened"
                    };
                    self.fail(StreamError::Signaling(reason.into()), SessionState::Failed)
                } else {
                    Vec::new()
                }
            }
            Input::SignalingText(text) => self.on_signaling_text(&text),
            Input::LocalCandidate(candidate) => {
                if self.signaling_open {
                    vec![Effect::SendSignaling(SignalingMessage::candidate(&candidate))]
                } else {
                    tracing::debug!("local candidate dropped, signaling closed");
                    Vec::new()
                }
            }

            Input::Connectivity(connectivity) => self.on_connectivity(connectivity),
            Input::NegotiationFailed(e) => self.fail(e, SessionState::Failed),

            Input::SignalingTimeout => {
                if self.ready {
                    return Vec::new();
                }
                self.fail(StreamError::NegotiationTimeout, SessionState::TimedOut)
            }
            Input::GraceTimeout => {
                if self.state != SessionState::Disconnected {
                    return Vec::new();
                }
                self.fail(StreamError::ConnectionLost, SessionState::Failed)
            }

            Input::Stop => {
                if !self.started {
                    tracing::debug!("stop on a session that never started");
                    return Vec::new();
                }
                self.finished = true;
                tracing::info!("session stopped from {}", self.state.as_str());
                let mut fx = vec![Effect::Teardown { farewell: true }];
                self.transition(SessionState::Disconnected, &mut fx);
                fx.push(Effect::Notify(StreamEvent::Closed));
                fx
            }
        }
    }

    fn on_signaling_text(&mut self, text: &str) -> Vec<Effect> {
        if !self.in_signaling_phase() {
            tracing::debug!("signaling message after handoff ignored");
            return Vec::new();
        }
        let message = match SignalingMessage::parse(text) {
            Ok(message) => message,
            Err(e) => return self.strike(e),
        };
        tracing::debug!("signaling <- {}", message.kind());

        match message {
            SignalingMessage::Answer { .. } => match message.sdp() {
                Ok(sdp) => vec![Effect::ApplyAnswer(sdp)],
                Err(e) => self.strike(e),
            },
            SignalingMessage::Candidate { .. } => match message.ice_candidate() {
                Ok(candidate) => vec![Effect::ApplyCandidate(candidate)],
                Err(e) => self.strike(e),
            },
            SignalingMessage::Error { message } => {
                self.fail(StreamError::Signaling(message), SessionState::Failed)
            }
            SignalingMessage::Settings {
                device_type,
                foreground_activity,
            } => vec![Effect::Notify(StreamEvent::RemoteSettings {
                device_type,
                foreground_activity,
            })],
            SignalingMessage::Offer { .. } => self.strike(StreamError::Protocol(
                "unexpected offer from remote".into(),
            )),
        }
    }

    fn on_connectivity(&mut self, connectivity: ConnectionState) -> Vec<Effect> {
        tracing::info!("connectivity: {connectivity}");
        let mut fx = Vec::new();
        match connectivity {
            c if c.is_connected() => match self.state {
                SessionState::SignalingOpen | SessionState::Negotiating => {
                    fx.push(Effect::CancelSignalingTimeout);
                    if std::mem::take(&mut self.signaling_open) {
                        fx.push(Effect::CloseSignaling);
                    }
                    self.transition(SessionState::Connected, &mut fx);
                    if !self.ready {
                        self.ready = true;
                        fx.push(Effect::Notify(StreamEvent::Ready));
                        fx.push(Effect::StartStats);
                    }
                }
                SessionState::Disconnected => {
                    fx.push(Effect::CancelGraceTimer);
                    self.transition(SessionState::Connected, &mut fx);
                }
                _ => {}
            },
            ConnectionState::Disconnected => {
                if self.state == SessionState::Connected {
                    self.transition(SessionState::Disconnected, &mut fx);
                    fx.push(Effect::ArmGraceTimer);
                }
            }
            ConnectionState::Failed => {
                return self.fail(StreamError::ConnectionFailed, SessionState::Failed);
            }
            ConnectionState::Closed => {
                self.finished = true;
                fx.push(Effect::Teardown { farewell: false });
                self.transition(SessionState::Disconnected, &mut fx);
                fx.push(Effect::Notify(StreamEvent::Closed));
            }
            _ => {}
        }
        fx
    }

    fn in_signaling_phase(&self) -> bool {
        matches!(
            self.state,
            SessionState::SignalingOpen | SessionState::Negotiating
        )
    }

    /// First malformed message is reported, the second one ends the session.
    fn strike(&mut self, error: StreamError) -> Vec<Effect> {
        self.protocol_strikes += 1;
        tracing::warn!("malformed signaling message: {error}");
        if self.protocol_strikes >= 2 {
            return self.fail(
                StreamError::Signaling(format!("repeated malformed messages: {error}")),
                SessionState::Failed,
            );
        }
        vec![Effect::Notify(StreamEvent::Error(error))]
    }

    fn transition(&mut self, next: SessionState, fx: &mut Vec<Effect>) {
        if self.state != next {
            tracing::info!("session {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
            fx.push(Effect::State(next));
        }
    }

    /// Teardown always precedes the error notification.
    fn fail(&mut self, error: StreamError, state: SessionState) -> Vec<Effect> {
        tracing::error!("session failed: {error}");
        self.finished = true;
        let mut fx = vec![Effect::Teardown { farewell: false }];
        self.transition(state, &mut fx);
        fx.push(Effect::Notify(StreamEvent::Error(error)));
        fx
    }
}
