//! Messages crossing the [`sansio::Protocol`] surface of a transport.

pub(crate) mod internal;

use crate::rtp_stream::MediaPacket;
use rtcp::packet::Packet as RtcpPacket;
use rtp::packet::Packet as RtpPacket;
use std::time::Instant;

/// Read output: decrypted media received from the peer.
#[derive(Debug)]
pub enum InboundMessage {
    /// Media published by the peer, for the application's producers.
    Rtp(RtpPacket),
    /// RTCP not consumed by the transport itself (sender reports, SDES,
    /// BYE, unknown feedback).
    Rtcp(Vec<Box<dyn RtcpPacket + Send + Sync>>),
}

/// Write input: what the application asks the transport to send.
#[derive(Debug)]
pub enum OutboundMessage {
    /// A packet of a producer, relayed through every consumer of it.
    Media {
        now: Instant,
        producer_id: String,
        packet: MediaPacket,
    },
    /// RTCP generated by the application, sent as is.
    Rtcp {
        now: Instant,
        packets: Vec<Box<dyn RtcpPacket + Send + Sync>>,
    },
}
