//! RTP stream bookkeeping.
//!
//! * [`MediaPacket`]: a parsed source packet plus the codec metadata the
//!   forwarding engine needs (key frame, spatial and temporal layer).
//! * [`SourceStream`]: the read-only view of a producer stream consumed by
//!   layer selection (health score, bitrates, sender reports).
//! * [`RtpStreamSend`]: the send-side tracker owned by each consumer.

pub(crate) mod media_packet;
pub(crate) mod rate_calculator;
pub(crate) mod send;
pub(crate) mod send_buffer;
pub(crate) mod source;

pub use media_packet::MediaPacket;
pub use rate_calculator::{RateCalculator, RtpDataCounter};
pub use send::{KeyFrameRequestKind, RtpStreamSend, RtpStreamSendParams, RtpStreamSendStats};
pub use source::{SenderReportInfo, SourceStream};

/// Maximum health score of a stream.
pub const MAX_SCORE: u8 = 10;

/// Returns true if `lhs` is newer than `rhs` in 16-bit sequence space.
pub(crate) fn is_seq_higher_than(lhs: u16, rhs: u16) -> bool {
    let diff = lhs.wrapping_sub(rhs);
    diff != 0 && diff < (1 << 15)
}

/// Returns true if `lhs` is later than `rhs` in 32-bit timestamp space.
pub(crate) fn is_ts_higher_than(lhs: u32, rhs: u32) -> bool {
    let diff = lhs.wrapping_sub(rhs);
    diff != 0 && diff < (1 << 31)
}
