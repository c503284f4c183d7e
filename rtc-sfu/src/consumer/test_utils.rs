use super::{
    ConsumerAction, ConsumerEvent, ConsumerOptions, ConsumerType, ForwardingConsumer, SendKind,
};
use crate::rtp_parameters::{
    MediaKind, RtcpFeedback, RtcpParameters, RtpCodecParameters, RtpEncodingParameters,
    RtpParameters, RtxParameters,
};
use crate::rtp_stream::{MediaPacket, SenderReportInfo, SourceStream};
use bytes::Bytes;
use rtp::header::Header;
use rtp::packet::Packet;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Instant;

pub(crate) const OUTPUT_SSRC: u32 = 5000;
pub(crate) const OUTPUT_RTX_SSRC: u32 = 5001;
pub(crate) const VP8_PT: u8 = 101;

/// Source stream whose health, bitrates and sender report are set by tests.
pub(crate) struct MockSourceStream {
    pub(crate) ssrc: u32,
    pub(crate) score: Cell<u8>,
    pub(crate) spatial_layers: u8,
    pub(crate) temporal_layers: u8,
    /// Bitrate of each (spatial, temporal) layer alone.
    pub(crate) layer_bitrates: RefCell<HashMap<(u8, u8), u32>>,
    pub(crate) sender_report: Cell<Option<SenderReportInfo>>,
}

impl MockSourceStream {
    pub(crate) fn new(ssrc: u32, score: u8) -> Self {
        Self {
            ssrc,
            score: Cell::new(score),
            spatial_layers: 1,
            temporal_layers: 1,
            layer_bitrates: RefCell::new(HashMap::new()),
            sender_report: Cell::new(None),
        }
    }

    pub(crate) fn with_layers(mut self, spatial_layers: u8, temporal_layers: u8) -> Self {
        self.spatial_layers = spatial_layers;
        self.temporal_layers = temporal_layers;
        self
    }

    pub(crate) fn with_layer_bitrate(self, spatial: u8, temporal: u8, bitrate: u32) -> Self {
        self.layer_bitrates
            .borrow_mut()
            .insert((spatial, temporal), bitrate);
        self
    }

    pub(crate) fn with_sender_report(self, ntp_ms: u64, rtp_timestamp: u32) -> Self {
        self.sender_report.set(Some(SenderReportInfo {
            ntp_ms,
            rtp_timestamp,
        }));
        self
    }
}

impl SourceStream for MockSourceStream {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn clock_rate(&self) -> u32 {
        90000
    }

    fn score(&self) -> u8 {
        self.score.get()
    }

    fn spatial_layers(&self) -> u8 {
        self.spatial_layers
    }

    fn temporal_layers(&self) -> u8 {
        self.temporal_layers
    }

    fn bitrate(&self, _now: Instant, spatial_layer: u8, temporal_layer: u8) -> u32 {
        let layer_bitrates = self.layer_bitrates.borrow();
        if layer_bitrates
            .get(&(spatial_layer, temporal_layer))
            .copied()
            .unwrap_or(0)
            == 0
        {
            return 0;
        }
        let mut total = 0;
        for s in 0..=spatial_layer {
            for t in 0..=temporal_layer {
                total += layer_bitrates.get(&(s, t)).copied().unwrap_or(0);
            }
        }
        total
    }

    fn layer_bitrate(&self, _now: Instant, spatial_layer: u8, temporal_layer: u8) -> u32 {
        self.layer_bitrates
            .borrow()
            .get(&(spatial_layer, temporal_layer))
            .copied()
            .unwrap_or(0)
    }

    fn sender_report(&self) -> Option<SenderReportInfo> {
        self.sender_report.get()
    }
}

pub(crate) fn vp8_codec() -> RtpCodecParameters {
    RtpCodecParameters {
        mime_type: "video/VP8".to_owned(),
        payload_type: VP8_PT,
        clock_rate: 90000,
        rtcp_feedback: vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
        ],
        ..Default::default()
    }
}

pub(crate) fn rtx_codec() -> RtpCodecParameters {
    RtpCodecParameters {
        mime_type: "video/rtx".to_owned(),
        payload_type: VP8_PT + 1,
        clock_rate: 90000,
        parameters: [("apt".to_owned(), VP8_PT.to_string())].into_iter().collect(),
        ..Default::default()
    }
}

pub(crate) fn opus_codec() -> RtpCodecParameters {
    RtpCodecParameters {
        mime_type: "audio/opus".to_owned(),
        payload_type: 100,
        clock_rate: 48000,
        channels: Some(2),
        ..Default::default()
    }
}

/// Options of a video consumer forwarding `consumable_ssrcs` with the given
/// scalability mode on the output encoding.
pub(crate) fn video_options(
    consumer_type: ConsumerType,
    consumable_ssrcs: &[u32],
    scalability_mode: &str,
) -> ConsumerOptions {
    ConsumerOptions {
        id: "consumer".to_owned(),
        producer_id: "producer".to_owned(),
        kind: MediaKind::Video,
        consumer_type,
        rtp_parameters: RtpParameters {
            mid: Some("0".to_owned()),
            codecs: vec![vp8_codec(), rtx_codec()],
            encodings: vec![RtpEncodingParameters {
                ssrc: OUTPUT_SSRC,
                rtx: Some(RtxParameters {
                    ssrc: OUTPUT_RTX_SSRC,
                }),
                scalability_mode: Some(scalability_mode.to_owned()),
                ..Default::default()
            }],
            rtcp: RtcpParameters {
                cname: Some("cname".to_owned()),
                reduced_size: true,
            },
            ..Default::default()
        },
        consumable_rtp_encodings: consumable_ssrcs
            .iter()
            .map(|&ssrc| RtpEncodingParameters {
                ssrc,
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

pub(crate) fn audio_options(consumable_ssrc: u32) -> ConsumerOptions {
    ConsumerOptions {
        id: "audio-consumer".to_owned(),
        producer_id: "audio-producer".to_owned(),
        kind: MediaKind::Audio,
        consumer_type: ConsumerType::Simple,
        rtp_parameters: RtpParameters {
            codecs: vec![opus_codec()],
            encodings: vec![RtpEncodingParameters {
                ssrc: OUTPUT_SSRC,
                ..Default::default()
            }],
            ..Default::default()
        },
        consumable_rtp_encodings: vec![RtpEncodingParameters {
            ssrc: consumable_ssrc,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub(crate) fn media_packet(
    ssrc: u32,
    payload_type: u8,
    seq: u16,
    timestamp: u32,
    key_frame: bool,
) -> MediaPacket {
    MediaPacket::new(Packet {
        header: Header {
            version: 2,
            payload_type,
            sequence_number: seq,
            timestamp,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0x90, 0x00, 0x01, 0x02]),
        ..Default::default()
    })
    .with_key_frame(key_frame)
}

/// Splits drained actions into sent media packets and events.
pub(crate) fn split_actions(
    actions: Vec<ConsumerAction>,
) -> (Vec<Packet>, Vec<ConsumerEvent>, Vec<u32>, usize) {
    let mut packets = vec![];
    let mut events = vec![];
    let mut key_frame_requests = vec![];
    let mut bitrate_changes = 0;
    for action in actions {
        match action {
            ConsumerAction::SendRtp {
                packet,
                kind: SendKind::Media,
            } => packets.push(packet),
            ConsumerAction::SendRtp { .. } => {}
            ConsumerAction::Event(event) => events.push(event),
            ConsumerAction::KeyFrameRequest { mapped_ssrc } => key_frame_requests.push(mapped_ssrc),
            ConsumerAction::NeedBitrateChange => bitrate_changes += 1,
        }
    }
    (packets, events, key_frame_requests, bitrate_changes)
}

pub(crate) fn drain(consumer: &mut dyn ForwardingConsumer) -> Vec<ConsumerAction> {
    let mut actions = vec![];
    while let Some(action) = consumer.core_mut().poll_action() {
        actions.push(action);
    }
    actions
}
