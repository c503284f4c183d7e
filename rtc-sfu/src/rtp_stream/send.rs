use super::rate_calculator::RtpDataCounter;
use super::send_buffer::SendBuffer;
use super::{MAX_SCORE, is_ts_higher_than};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace};
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{SdesType, SourceDescriptionChunk, SourceDescriptionItem};
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use rtp::packet::Packet;
use serde::Serialize;
use shared::error::Result;
use shared::time::SystemInstant;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of receiver report scores averaged into the stream score.
const SCORE_HISTORY_LEN: usize = 24;
/// RTT assumed until the first receiver report carrying LSR/DLSR arrives.
const DEFAULT_RTT: Duration = Duration::from_millis(100);

/// Feedback message kind asking for a key frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyFrameRequestKind {
    Pli,
    Fir,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RtpStreamSendParams {
    pub ssrc: u32,
    pub payload_type: u8,
    pub mime_type: String,
    pub clock_rate: u32,
    pub cname: String,
    pub rtx_ssrc: Option<u32>,
    pub rtx_payload_type: Option<u8>,
    pub use_nack: bool,
    pub use_pli: bool,
    pub use_fir: bool,
    pub use_in_band_fec: bool,
    pub use_dtx: bool,
    pub spatial_layers: u8,
    pub temporal_layers: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpStreamSendStats {
    pub ssrc: u32,
    pub rtx_ssrc: Option<u32>,
    pub mime_type: String,
    pub packet_count: usize,
    pub byte_count: usize,
    pub bitrate: u32,
    pub score: u8,
    pub fraction_lost: u8,
    pub packets_lost: u32,
    pub packets_retransmitted: usize,
    pub packets_repaired: usize,
    pub nack_count: usize,
    pub nack_packet_count: usize,
    pub pli_count: usize,
    pub fir_count: usize,
    pub round_trip_time: Option<f64>,
}

/// Send-side tracker of one consumer output stream.
pub struct RtpStreamSend {
    params: RtpStreamSendParams,
    time_baseline: SystemInstant,

    score: u8,
    scores: VecDeque<u8>,

    started: bool,
    max_packet_ts: u32,
    max_packet_at: Option<Instant>,

    transmission: RtpDataCounter,
    retransmission: RtpDataCounter,

    packets_lost: u32,
    fraction_lost: u8,
    rtt: Option<Duration>,
    packets_retransmitted: usize,
    packets_repaired: usize,
    nack_count: usize,
    nack_packet_count: usize,
    pli_count: usize,
    fir_count: usize,

    sent_prior_score: usize,
    lost_prior_score: u32,
    repaired_prior_score: usize,
    retransmitted_prior_score: usize,

    rtx_seq: u16,
    buffer: Option<SendBuffer>,
    max_retransmission_age: Duration,
}

impl RtpStreamSend {
    /// Creates the tracker. A retransmission buffer of `buffer_size` packets
    /// is kept only when NACK was negotiated.
    pub fn new(
        params: RtpStreamSendParams,
        buffer_size: u16,
        max_retransmission_age: Duration,
    ) -> Result<Self> {
        let buffer = if params.use_nack {
            Some(SendBuffer::new(buffer_size)?)
        } else {
            None
        };

        Ok(Self {
            params,
            time_baseline: SystemInstant::now(),
            score: MAX_SCORE,
            scores: VecDeque::with_capacity(SCORE_HISTORY_LEN),
            started: false,
            max_packet_ts: 0,
            max_packet_at: None,
            transmission: RtpDataCounter::default(),
            retransmission: RtpDataCounter::default(),
            packets_lost: 0,
            fraction_lost: 0,
            rtt: None,
            packets_retransmitted: 0,
            packets_repaired: 0,
            nack_count: 0,
            nack_packet_count: 0,
            pli_count: 0,
            fir_count: 0,
            sent_prior_score: 0,
            lost_prior_score: 0,
            repaired_prior_score: 0,
            retransmitted_prior_score: 0,
            rtx_seq: rand::random::<u16>(),
            buffer,
            max_retransmission_age,
        })
    }

    pub fn params(&self) -> &RtpStreamSendParams {
        &self.params
    }

    pub fn ssrc(&self) -> u32 {
        self.params.ssrc
    }

    pub fn clock_rate(&self) -> u32 {
        self.params.clock_rate
    }

    pub fn temporal_layers(&self) -> u8 {
        self.params.temporal_layers
    }

    pub fn spatial_layers(&self) -> u8 {
        self.params.spatial_layers
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    /// Loss reported by the receiver, in percent.
    pub fn loss_percentage(&self) -> f64 {
        self.fraction_lost as f64 * 100.0 / 256.0
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Whether any packet was sent on this stream yet.
    pub fn has_sent(&self) -> bool {
        self.started
    }

    pub fn max_packet_ts(&self) -> u32 {
        self.max_packet_ts
    }

    pub fn bitrate(&mut self, now: Instant) -> u32 {
        self.transmission.bitrate(now)
    }

    /// Records a packet about to be sent.
    pub fn receive_packet(&mut self, now: Instant, packet: &Packet) -> bool {
        let ts = packet.header.timestamp;
        if !self.started {
            self.started = true;
            self.max_packet_ts = ts;
            self.max_packet_at = Some(now);
        } else if is_ts_higher_than(ts, self.max_packet_ts) {
            self.max_packet_ts = ts;
            self.max_packet_at = Some(now);
        }

        if let Some(buffer) = self.buffer.as_mut() {
            buffer.insert(packet.clone());
        }

        self.transmission.update(packet, now);

        true
    }

    pub fn pause(&mut self) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.clear();
        }
    }

    pub fn resume(&mut self) {}

    /// Resolves a NACK into the packets to retransmit, RTX encapsulated when
    /// an RTX stream is configured.
    pub fn receive_nack(&mut self, now: Instant, nack: &TransportLayerNack) -> Vec<Packet> {
        self.nack_count += 1;

        let mut seqs = vec![];
        for pair in &nack.nacks {
            seqs.push(pair.packet_id);
            for i in 0..16u16 {
                if pair.lost_packets & (1 << i) != 0 {
                    seqs.push(pair.packet_id.wrapping_add(i + 1));
                }
            }
        }
        self.nack_packet_count += seqs.len();

        let mut packets = vec![];
        for seq in seqs {
            if let Some(packet) = self.retransmit(now, seq) {
                packets.push(packet);
            }
        }

        packets
    }

    fn retransmit(&mut self, now: Instant, seq: u16) -> Option<Packet> {
        let rtt = self.rtt.unwrap_or(DEFAULT_RTT);
        let clock_rate = self.params.clock_rate.max(1) as u64;
        let max_packet_ts = self.max_packet_ts;
        let max_age_ms = self.max_retransmission_age.as_millis() as u64;

        let stored = self.buffer.as_mut()?.get_mut(seq)?;

        let diff_ts = max_packet_ts.wrapping_sub(stored.packet.header.timestamp) as u64;
        if diff_ts * 1000 / clock_rate > max_age_ms {
            trace!("ignoring retransmission of too old packet [seq:{seq}]");
            return None;
        }
        if let Some(resent_at) = stored.resent_at {
            if now.saturating_duration_since(resent_at) <= rtt {
                trace!("ignoring retransmission of recently resent packet [seq:{seq}]");
                return None;
            }
        }

        stored.resent_at = Some(now);
        stored.sent_times = stored.sent_times.saturating_add(1);
        let repaired = stored.sent_times == 1;
        let original = stored.packet.clone();

        let packet = self.encode_rtx(original);
        self.retransmission.update(&packet, now);
        self.packets_retransmitted += 1;
        if repaired {
            self.packets_repaired += 1;
        }

        Some(packet)
    }

    /// Copy of a stored packet to be sent as bandwidth probation.
    pub fn probation_packet(&mut self, seq: u16) -> Option<Packet> {
        let original = self.buffer.as_mut()?.get_mut(seq)?.packet.clone();
        Some(self.encode_rtx(original))
    }

    fn encode_rtx(&mut self, mut packet: Packet) -> Packet {
        let (Some(rtx_ssrc), Some(rtx_payload_type)) =
            (self.params.rtx_ssrc, self.params.rtx_payload_type)
        else {
            return packet;
        };

        self.rtx_seq = self.rtx_seq.wrapping_add(1);

        let mut payload = BytesMut::with_capacity(packet.payload.len() + 2);
        payload.put_u16(packet.header.sequence_number);
        payload.extend_from_slice(&packet.payload);

        packet.header.ssrc = rtx_ssrc;
        packet.header.payload_type = rtx_payload_type;
        packet.header.sequence_number = self.rtx_seq;
        packet.header.padding = false;
        packet.payload = payload.freeze();
        packet
    }

    pub fn receive_key_frame_request(&mut self, kind: KeyFrameRequestKind) {
        match kind {
            KeyFrameRequestKind::Pli => self.pli_count += 1,
            KeyFrameRequestKind::Fir => self.fir_count += 1,
        }
    }

    /// Updates RTT, loss and score from a reception report block about this
    /// stream. Returns true if the score changed.
    pub fn receive_rtcp_receiver_report(&mut self, now: Instant, report: &ReceptionReport) -> bool {
        if report.last_sender_report != 0 {
            let compact_now = self.time_baseline.compact_ntp(now);
            let sent = report
                .last_sender_report
                .wrapping_add(report.delay);
            let rtt = compact_now.wrapping_sub(sent);
            if rtt < (1 << 31) {
                self.rtt = Some(SystemInstant::compact_ntp2duration(rtt));
            }
        }

        self.packets_lost = report.total_lost;
        self.fraction_lost = report.fraction_lost;

        self.update_score(report)
    }

    fn update_score(&mut self, report: &ReceptionReport) -> bool {
        let total_sent = self.transmission.packet_count();
        let sent = total_sent.saturating_sub(self.sent_prior_score);
        self.sent_prior_score = total_sent;

        let total_lost = report.total_lost;
        let mut lost = total_lost.saturating_sub(self.lost_prior_score) as f64;
        self.lost_prior_score = total_lost;

        let total_repaired = self.packets_repaired;
        let mut repaired = total_repaired.saturating_sub(self.repaired_prior_score) as f64;
        self.repaired_prior_score = total_repaired;

        let total_retransmitted = self.retransmission.packet_count();
        let retransmitted =
            total_retransmitted.saturating_sub(self.retransmitted_prior_score) as f64;
        self.retransmitted_prior_score = total_retransmitted;

        if sent == 0 {
            return self.push_score(MAX_SCORE);
        }

        let sent = sent as f64;
        if lost > sent {
            lost = sent;
        }
        if repaired > lost {
            repaired = lost;
        }

        let repaired_ratio = repaired / sent;
        let mut repaired_weight = (1.0 / (repaired_ratio + 1.0)).powi(4);
        if retransmitted > 0.0 {
            repaired_weight *= repaired / retransmitted;
        }
        lost -= repaired * repaired_weight;

        let delivered_ratio = (sent - lost) / sent;
        let score = (delivered_ratio.powi(4) * MAX_SCORE as f64).round() as u8;

        self.push_score(score)
    }

    fn push_score(&mut self, score: u8) -> bool {
        self.scores.push_back(score);
        if self.scores.len() > SCORE_HISTORY_LEN {
            self.scores.pop_front();
        }

        let mut weight = 0usize;
        let mut samples = 0usize;
        let mut total = 0usize;
        for &s in &self.scores {
            weight += 1;
            samples += weight;
            total += weight * s as usize;
        }

        let previous = self.score;
        self.score = (total as f64 / samples as f64).round() as u8;
        if self.score != previous {
            debug!(
                "stream score changed [ssrc:{}, score:{}, previous:{}]",
                self.params.ssrc, self.score, previous
            );
            true
        } else {
            false
        }
    }

    /// Resets the score history. Returns true if the score changed and the
    /// caller should notify about it.
    pub fn reset_score(&mut self, score: u8, notify: bool) -> bool {
        self.scores.clear();
        if self.score == score {
            return false;
        }
        self.score = score;
        notify
    }

    pub fn sender_report(&mut self, now: Instant) -> Option<SenderReport> {
        if self.transmission.packet_count() == 0 {
            return None;
        }

        let elapsed = self
            .max_packet_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        let rtp_time = self.max_packet_ts.wrapping_add(
            (elapsed.as_millis() as u64 * self.params.clock_rate as u64 / 1000) as u32,
        );

        Some(SenderReport {
            ssrc: self.params.ssrc,
            ntp_time: self.time_baseline.ntp(now),
            rtp_time,
            packet_count: self.transmission.packet_count() as u32,
            octet_count: self.transmission.bytes() as u32,
            ..Default::default()
        })
    }

    pub fn sdes_chunk(&self) -> SourceDescriptionChunk {
        SourceDescriptionChunk {
            source: self.params.ssrc,
            items: vec![SourceDescriptionItem {
                sdes_type: SdesType::SdesCname,
                text: Bytes::from(self.params.cname.clone()),
            }],
        }
    }

    pub fn stats(&mut self, now: Instant) -> RtpStreamSendStats {
        RtpStreamSendStats {
            ssrc: self.params.ssrc,
            rtx_ssrc: self.params.rtx_ssrc,
            mime_type: self.params.mime_type.clone(),
            packet_count: self.transmission.packet_count(),
            byte_count: self.transmission.bytes(),
            bitrate: self.transmission.bitrate(now),
            score: self.score,
            fraction_lost: self.fraction_lost,
            packets_lost: self.packets_lost,
            packets_retransmitted: self.packets_retransmitted,
            packets_repaired: self.packets_repaired,
            nack_count: self.nack_count,
            nack_packet_count: self.nack_packet_count,
            pli_count: self.pli_count,
            fir_count: self.fir_count,
            round_trip_time: self.rtt.map(|rtt| rtt.as_secs_f64() * 1000.0),
        }
    }
}
