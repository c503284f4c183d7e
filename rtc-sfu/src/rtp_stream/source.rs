use std::time::Instant;

/// Most recent sender report received on a source stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SenderReportInfo {
    /// NTP time of the report in milliseconds.
    pub ntp_ms: u64,
    /// RTP timestamp corresponding to `ntp_ms`.
    pub rtp_timestamp: u32,
}

/// Read-only view of a producer's receive stream.
///
/// Implemented by the component that receives and parses published media;
/// shared between every consumer of the producer.
pub trait SourceStream {
    fn ssrc(&self) -> u32;

    fn clock_rate(&self) -> u32;

    /// Health score in `0..=10`; 0 means the stream is dead.
    fn score(&self) -> u8;

    fn spatial_layers(&self) -> u8 {
        1
    }

    fn temporal_layers(&self) -> u8 {
        1
    }

    /// Bitrate needed to forward every layer up to and including the given
    /// spatial and temporal layer. 0 when the layer is inactive.
    fn bitrate(&self, now: Instant, spatial_layer: u8, temporal_layer: u8) -> u32;

    /// Bitrate of the given layer alone. 0 when the layer is inactive.
    fn layer_bitrate(&self, now: Instant, spatial_layer: u8, temporal_layer: u8) -> u32;

    fn sender_report(&self) -> Option<SenderReportInfo>;
}
