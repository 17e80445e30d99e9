//! WebSocket signaling transport.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use vdstream_core::{
    SignalingChannel, SignalingMessage, SignalingTransport, StreamError, TransportEvent,
    TransportEvents,
};

enum Outgoing {
    Text(String),
    Close,
}

/// Opens one WebSocket per session with tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsSignalingTransport;

impl WsSignalingTransport {
    pub fn new() -> Self {
        Self
    }
}

impl SignalingTransport for WsSignalingTransport {
    fn open(
        &self,
        url: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn SignalingChannel>, StreamError> {
        let (outgoing, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url.to_string(), events, rx));
        Ok(Box::new(WsSignalingChannel { outgoing }))
    }
}

struct WsSignalingChannel {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl SignalingChannel for WsSignalingChannel {
    fn send(&self, message: &SignalingMessage) -> Result<(), StreamError> {
        let text = message.to_json()?;
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| StreamError::Signaling("websocket is closed".to_string()))
    }

    fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

/// Owns the socket. Outgoing frames queued before the handshake completes
/// are flushed once it does.
async fn run_socket(
    url: String,
    events: TransportEvents,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    let (ws, _) = match connect_async(url.as_str()).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("signaling connect to {} failed: {}", url, e);
            events.emit(TransportEvent::SignalingError(e.to_string()));
            return;
        }
    };
    info!("signaling connected: {}", url);
    events.emit(TransportEvent::SignalingOpened);

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        events.emit(TransportEvent::SignalingError(e.to_string()));
                        return;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    debug!("signaling closed locally");
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    events.emit(TransportEvent::SignalingMessage(text.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("signaling closed by peer: {:?}", frame);
                    events.emit(TransportEvent::SignalingClosed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.emit(TransportEvent::SignalingError(e.to_string()));
                    return;
                }
                None => {
                    events.emit(TransportEvent::SignalingClosed);
                    return;
                }
            },
        }
    }
}
