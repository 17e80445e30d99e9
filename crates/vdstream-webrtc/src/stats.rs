//! Translation of webrtc-rs stats into the session's report model.

use webrtc::stats::{StatsReport as RtcStatsReport, StatsReportType};

use vdstream_core::MediaKind;
use vdstream_core::stats::{
    CandidatePairStats, CandidateStats, RtpStreamStats, StatsEntry, StatsReport,
};

/// Map one `get_stats()` result. `timestamp_ms` is the poll time on a
/// monotonic clock and is stamped on every entry.
pub fn map_report(report: &RtcStatsReport, timestamp_ms: f64) -> StatsReport {
    let mut entries = Vec::new();
    for stat in report.reports.values() {
        let entry = match stat {
            StatsReportType::InboundRTP(rtp) => StatsEntry::InboundRtp(RtpStreamStats {
                id: rtp.id.clone(),
                kind: media_kind(&rtp.kind),
                timestamp_ms,
                bytes: rtp.bytes_received as u64,
                packets: rtp.packets_received as u64,
                ..Default::default()
            }),
            StatsReportType::OutboundRTP(rtp) => StatsEntry::OutboundRtp(RtpStreamStats {
                id: rtp.id.clone(),
                kind: media_kind(&rtp.kind),
                timestamp_ms,
                bytes: rtp.bytes_sent as u64,
                packets: rtp.packets_sent as u64,
                ..Default::default()
            }),
            StatsReportType::CandidatePair(pair) => {
                StatsEntry::CandidatePair(CandidatePairStats {
                    id: pair.id.clone(),
                    timestamp_ms,
                    local_candidate_id: pair.local_candidate_id.clone(),
                    remote_candidate_id: pair.remote_candidate_id.clone(),
                    nominated: pair.nominated,
                    succeeded: format!("{:?}", pair.state).eq_ignore_ascii_case("succeeded"),
                    current_round_trip_time: positive(pair.current_round_trip_time),
                    available_outgoing_bitrate: positive(pair.available_outgoing_bitrate),
                    available_incoming_bitrate: positive(pair.available_incoming_bitrate),
                    bytes_sent: pair.bytes_sent as u64,
                    bytes_received: pair.bytes_received as u64,
                })
            }
            StatsReportType::LocalCandidate(c) => StatsEntry::LocalCandidate(candidate(
                c.id.clone(),
                &c.ip,
                u16::try_from(c.port).ok(),
                c.network_type.to_string(),
                c.candidate_type.to_string(),
            )),
            StatsReportType::RemoteCandidate(c) => StatsEntry::RemoteCandidate(candidate(
                c.id.clone(),
                &c.ip,
                u16::try_from(c.port).ok(),
                c.network_type.to_string(),
                c.candidate_type.to_string(),
            )),
            _ => continue,
        };
        entries.push(entry);
    }
    StatsReport { entries }
}

fn media_kind(kind: &str) -> Option<MediaKind> {
    match kind {
        "audio" => Some(MediaKind::Audio),
        "video" => Some(MediaKind::Video),
        _ => None,
    }
}

/// webrtc-rs reports zero for values it has not measured yet.
fn positive(value: f64) -> Option<f64> {
    (value > 0.0).then_some(value)
}

fn candidate(
    id: String,
    ip: &str,
    port: Option<u16>,
    network_type: String,
    candidate_type: String,
) -> CandidateStats {
    CandidateStats {
        id,
        address: (!ip.is_empty()).then(|| ip.to_string()),
        port: port.filter(|p| *p != 0),
        protocol: transport_protocol(&network_type),
        candidate_type: candidate_type.to_ascii_lowercase(),
    }
}

/// "udp4" / "tcp6" style network types reduced to the transport.
fn transport_protocol(network_type: &str) -> String {
    let lower = network_type.to_ascii_lowercase();
    if lower.starts_with("udp") {
        "udp".to_string()
    } else if lower.starts_with("tcp") {
        "tcp".to_string()
    } else {
        lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_by_name() {
        assert_eq!(media_kind("audio"), Some(MediaKind::Audio));
        assert_eq!(media_kind("video"), Some(MediaKind::Video));
        assert_eq!(media_kind("data"), None);
    }

    #[test]
    fn unmeasured_values_are_absent() {
        assert_eq!(positive(0.0), None);
        assert_eq!(positive(0.042), Some(0.042));
    }

    #[test]
    fn candidate_fields_are_normalised() {
        let c = candidate(
            "c1".into(),
            "203.0.113.9",
            Some(3478),
            "udp4".into(),
            "relay".into(),
        );
        assert_eq!(c.protocol, "udp");
        assert_eq!(c.candidate_type, "relay");
        assert_eq!(c.address.as_deref(), Some("203.0.113.9"));

        let empty = candidate("c2".into(), "", Some(0), "tcp6".into(), "Host".into());
        assert_eq!(empty.address, None);
        assert_eq!(empty.port, None);
        assert_eq!(empty.protocol, "tcp");
        assert_eq!(empty.candidate_type, "host");
    }

    #[test]
    fn empty_report_maps_to_no_entries() {
        let report = RtcStatsReport {
            reports: Default::default(),
        };
        assert!(map_report(&report, 0.0).entries.is_empty());
    }
}
