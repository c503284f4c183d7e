use bytes::Bytes;
use rtp::packet::Packet;

/// A source RTP packet together with the codec metadata extracted by the
/// producer side. The forwarding engine never mutates it: every consumer
/// derives its own output packet from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaPacket {
    pub packet: Packet,
    pub key_frame: bool,
    pub spatial_layer: u8,
    pub temporal_layer: u8,
}

impl MediaPacket {
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            ..Default::default()
        }
    }

    pub fn with_key_frame(mut self, key_frame: bool) -> Self {
        self.key_frame = key_frame;
        self
    }

    pub fn with_layers(mut self, spatial_layer: u8, temporal_layer: u8) -> Self {
        self.spatial_layer = spatial_layer;
        self.temporal_layer = temporal_layer;
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.packet.header.ssrc
    }

    pub fn sequence_number(&self) -> u16 {
        self.packet.header.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.packet.header.timestamp
    }

    pub fn payload_type(&self) -> u8 {
        self.packet.header.payload_type
    }

    /// Builds the per-send view of this packet with rewritten identifiers.
    pub(crate) fn rewrite(
        &self,
        ssrc: u32,
        sequence_number: u16,
        timestamp: u32,
        payload: Option<Bytes>,
    ) -> Packet {
        let mut packet = self.packet.clone();
        packet.header.ssrc = ssrc;
        packet.header.sequence_number = sequence_number;
        packet.header.timestamp = timestamp;
        if let Some(payload) = payload {
            packet.payload = payload;
        }
        packet
    }
}
