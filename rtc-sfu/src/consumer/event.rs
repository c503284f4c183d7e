use super::layers::ConsumerLayers;
use rtp::packet::Packet;
use serde::Serialize;

/// Output stream score together with the score of the source(s) it forwards.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerScore {
    pub score: u8,
    pub producer_score: u8,
    pub producer_scores: Vec<u8>,
}

/// Notification emitted by a consumer to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Score(ConsumerScore),
    /// Current layers changed; `None` when nothing is being forwarded.
    LayersChange(Option<ConsumerLayers>),
    ProducerPause,
    ProducerResume,
    ProducerClose,
}

/// Why a packet is handed to the transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendKind {
    Media,
    Retransmission,
    Probation,
}

/// Decision of a consumer, dispatched by the transport that owns it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConsumerAction {
    Event(ConsumerEvent),
    SendRtp { packet: Packet, kind: SendKind },
    /// Ask the producer for a key frame on the given source ssrc.
    KeyFrameRequest { mapped_ssrc: u32 },
    /// Layer affordability changed; the bandwidth distribution must run again.
    NeedBitrateChange,
}
