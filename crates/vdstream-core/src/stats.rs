//! Connection statistics.
//!
//! Peer adapters translate their native report into a [`StatsReport`]; the
//! [`StatsCollector`] folds consecutive reports into a [`StatsSnapshot`] with
//! per-second rates.

use std::collections::HashMap;

use serde::Serialize;

use crate::peer::MediaKind;

/// Platform-neutral statistics report, one poll's worth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsReport {
    pub entries: Vec<StatsEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatsEntry {
    InboundRtp(RtpStreamStats),
    OutboundRtp(RtpStreamStats),
    CandidatePair(CandidatePairStats),
    LocalCandidate(CandidateStats),
    RemoteCandidate(CandidateStats),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtpStreamStats {
    pub id: String,
    pub kind: Option<MediaKind>,
    /// Report timestamp in milliseconds.
    pub timestamp_ms: f64,
    pub bytes: u64,
    pub packets: u64,
    pub packets_lost: i64,
    /// Seconds.
    pub jitter: Option<f64>,
    pub frames: Option<u64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub frames_per_second: Option<f64>,
    pub total_samples: Option<u64>,
    pub audio_level: Option<f64>,
    pub codec: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidatePairStats {
    pub id: String,
    pub timestamp_ms: f64,
    pub local_candidate_id: String,
    pub remote_candidate_id: String,
    pub nominated: bool,
    pub succeeded: bool,
    /// Seconds.
    pub current_round_trip_time: Option<f64>,
    /// Bits per second.
    pub available_outgoing_bitrate: Option<f64>,
    pub available_incoming_bitrate: Option<f64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateStats {
    pub id: String,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub protocol: String,
    pub candidate_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VideoStats {
    pub bandwidth_kbps: f64,
    pub packets_per_sec: f64,
    pub packets_lost: i64,
    pub jitter_ms: f64,
    pub frames_decoded: u64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub codec: Option<String>,
}

/// Local microphone, as sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioInputStats {
    pub bandwidth_kbps: f64,
    pub packets_per_sec: f64,
    pub audio_level: f64,
}

/// Remote audio, as played.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioOutputStats {
    pub bandwidth_kbps: f64,
    pub packets_per_sec: f64,
    pub packets_lost: i64,
    pub jitter_ms: f64,
    pub total_samples: u64,
    pub samples_per_sec: f64,
    pub audio_level: f64,
    pub codec: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    pub rtt_ms: f64,
    pub available_outgoing_kbps: f64,
    pub available_incoming_kbps: f64,
    pub receive_kbps: f64,
    pub send_kbps: f64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportConfig {
    pub relayed: bool,
    pub protocol: Option<String>,
    pub local_candidate_type: Option<String>,
    pub remote_candidate_type: Option<String>,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub video: VideoStats,
    pub audio_input: AudioInputStats,
    pub audio_output: AudioOutputStats,
    pub network: NetworkStats,
    pub config: TransportConfig,
    /// RFC 3339, millisecond precision.
    pub captured_at: String,
}

/// Delta of a monotonic counter. A counter that went backwards was reset,
/// so the current value is the delta.
pub fn counter_delta(previous: u64, current: u64) -> u64 {
    if previous > current {
        current
    } else {
        current - previous
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp_ms: f64,
    bytes: u64,
    packets: u64,
    samples: u64,
}

impl Sample {
    fn of_rtp(rtp: &RtpStreamStats) -> Self {
        Self {
            timestamp_ms: rtp.timestamp_ms,
            bytes: rtp.bytes,
            packets: rtp.packets,
            samples: rtp.total_samples.unwrap_or_default(),
        }
    }

    fn of_bytes(timestamp_ms: f64, bytes: u64) -> Self {
        Self {
            timestamp_ms,
            bytes,
            packets: 0,
            samples: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Rate {
    kbps: f64,
    per_sec: f64,
    samples_per_sec: f64,
}

/// Folds successive reports into snapshots.
#[derive(Debug, Default)]
pub struct StatsCollector {
    previous: HashMap<String, Sample>,
    latest: StatsSnapshot,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> &StatsSnapshot {
        &self.latest
    }

    pub fn reset(&mut self) {
        self.previous.clear();
        self.latest = StatsSnapshot::default();
    }

    pub fn fold(&mut self, report: &StatsReport) -> StatsSnapshot {
        let mut next = StatsSnapshot::default();
        let mut seen = HashMap::new();

        for entry in &report.entries {
            match entry {
                StatsEntry::InboundRtp(rtp) => {
                    let rate = self.rate(&mut seen, &rtp.id, Sample::of_rtp(rtp));
                    match rtp.kind {
                        Some(MediaKind::Video) => next.video = video_stats(rtp, rate),
                        Some(MediaKind::Audio) => next.audio_output = audio_output_stats(rtp, rate),
                        None => {}
                    }
                }
                StatsEntry::OutboundRtp(rtp) => {
                    let rate = self.rate(&mut seen, &rtp.id, Sample::of_rtp(rtp));
                    if rtp.kind == Some(MediaKind::Audio) {
                        next.audio_input = AudioInputStats {
                            bandwidth_kbps: rate.kbps,
                            packets_per_sec: rate.per_sec,
                            audio_level: rtp.audio_level.unwrap_or_default(),
                        };
                    }
                }
                StatsEntry::CandidatePair(pair) if pair.nominated && pair.succeeded => {
                    let recv = self.rate(
                        &mut seen,
                        &format!("{}/recv", pair.id),
                        Sample::of_bytes(pair.timestamp_ms, pair.bytes_received),
                    );
                    let send = self.rate(
                        &mut seen,
                        &format!("{}/send", pair.id),
                        Sample::of_bytes(pair.timestamp_ms, pair.bytes_sent),
                    );
                    next.network = NetworkStats {
                        rtt_ms: pair.current_round_trip_time.unwrap_or_default() * 1000.0,
                        available_outgoing_kbps: pair.available_outgoing_bitrate.unwrap_or_default()
                            / 1000.0,
                        available_incoming_kbps: pair.available_incoming_bitrate.unwrap_or_default()
                            / 1000.0,
                        receive_kbps: recv.kbps,
                        send_kbps: send.kbps,
                        bytes_received: pair.bytes_received,
                        bytes_sent: pair.bytes_sent,
                    };
                    next.config = transport_config(report, pair);
                }
                _ => {}
            }
        }

        // Streams that disappeared from the report no longer hold history.
        self.previous = seen;
        next.captured_at =
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        self.latest = next.clone();
        next
    }

    fn rate(&self, seen: &mut HashMap<String, Sample>, key: &str, current: Sample) -> Rate {
        seen.insert(key.to_string(), current);

        let Some(prev) = self.previous.get(key) else {
            return Rate::default();
        };
        let elapsed_secs = (current.timestamp_ms - prev.timestamp_ms) / 1000.0;
        if elapsed_secs <= 0.0 {
            return Rate::default();
        }
        let bytes = counter_delta(prev.bytes, current.bytes) as f64;
        let packets = counter_delta(prev.packets, current.packets) as f64;
        let samples = counter_delta(prev.samples, current.samples) as f64;
        Rate {
            kbps: bytes * 8.0 / elapsed_secs / 1000.0,
            per_sec: packets / elapsed_secs,
            samples_per_sec: samples / elapsed_secs,
        }
    }
}

fn video_stats(rtp: &RtpStreamStats, rate: Rate) -> VideoStats {
    VideoStats {
        bandwidth_kbps: rate.kbps,
        packets_per_sec: rate.per_sec,
        packets_lost: rtp.packets_lost,
        jitter_ms: rtp.jitter.unwrap_or_default() * 1000.0,
        frames_decoded: rtp.frames.unwrap_or_default(),
        fps: rtp.frames_per_second.unwrap_or_default(),
        width: rtp.frame_width.unwrap_or_default(),
        height: rtp.frame_height.unwrap_or_default(),
        codec: rtp.codec.clone(),
    }
}

fn audio_output_stats(rtp: &RtpStreamStats, rate: Rate) -> AudioOutputStats {
    AudioOutputStats {
        bandwidth_kbps: rate.kbps,
        packets_per_sec: rate.per_sec,
        packets_lost: rtp.packets_lost,
        jitter_ms: rtp.jitter.unwrap_or_default() * 1000.0,
        total_samples: rtp.total_samples.unwrap_or_default(),
        samples_per_sec: rate.samples_per_sec,
        audio_level: rtp.audio_level.unwrap_or_default(),
        codec: rtp.codec.clone(),
    }
}

fn transport_config(report: &StatsReport, pair: &CandidatePairStats) -> TransportConfig {
    let local = report.entries.iter().find_map(|e| match e {
        StatsEntry::LocalCandidate(c) if c.id == pair.local_candidate_id => Some(c),
        _ => None,
    });
    let remote = report.entries.iter().find_map(|e| match e {
        StatsEntry::RemoteCandidate(c) if c.id == pair.remote_candidate_id => Some(c),
        _ => None,
    });
    let is_relay = |c: Option<&CandidateStats>| c.is_some_and(|c| c.candidate_type == "relay");

    TransportConfig {
        relayed: is_relay(local) || is_relay(remote),
        protocol: local.map(|c| c.protocol.clone()),
        local_candidate_type: local.map(|c| c.candidate_type.clone()),
        remote_candidate_type: remote.map(|c| c.candidate_type.clone()),
        local_address: local.and_then(endpoint),
        remote_address: remote.and_then(endpoint),
    }
}

fn endpoint(c: &CandidateStats) -> Option<String> {
    let address = c.address.as_ref()?;
    Some(match c.port {
        Some(port) => format!("{address}:{port}"),
        None => address.clone(),
    })
}
