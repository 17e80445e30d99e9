use thiserror::Error;
use vdstream_core::StreamError;

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("unknown sender {0}")]
    UnknownSender(u32),
    #[error("track {0} does not belong to this peer adapter")]
    ForeignTrack(String),
    #[error("track {0} is stopped")]
    TrackStopped(String),
    #[error("no capture backend for {0}")]
    NoBackend(String),
    #[error("capture failed: {0}")]
    Capture(String),
}

impl From<RtcError> for StreamError {
    fn from(e: RtcError) -> Self {
        match e {
            RtcError::NoBackend(_) | RtcError::Capture(_) | RtcError::TrackStopped(_) => {
                StreamError::DeviceAccess(e.to_string())
            }
            _ => StreamError::Transport(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_errors_map_to_device_access() {
        let err: StreamError = RtcError::NoBackend("video".into()).into();
        assert!(matches!(err, StreamError::DeviceAccess(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn peer_errors_map_to_transport() {
        let err: StreamError = RtcError::UnknownSender(7).into();
        assert_eq!(err, StreamError::Transport("unknown sender 7".into()));
    }
}
