use crate::rtp_stream::MediaPacket;
use bytes::BytesMut;
use rtcp::packet::Packet as RtcpPacket;
use rtp::packet::Packet as RtpPacket;
use shared::TransportContext;
use std::time::Instant;

#[derive(Debug)]
pub(crate) enum STUNMessage {
    Raw(BytesMut),
}

#[derive(Debug)]
pub(crate) enum DTLSMessage {
    /// DTLS records.
    Raw(BytesMut),
    /// Application data carried by DTLS, i.e. SCTP packets.
    Sctp(BytesMut),
}

#[derive(Debug)]
pub(crate) enum RTPMessage {
    Srtp(BytesMut),
    Srtcp(BytesMut),
    Rtp(RtpPacket),
    Rtcp(Vec<Box<dyn RtcpPacket + Send + Sync>>),
    /// Source packet to relay, only seen by the forwarding handler.
    Media {
        producer_id: String,
        packet: MediaPacket,
    },
}

#[derive(Debug)]
pub(crate) enum MessageInternal {
    Raw(BytesMut),
    Stun(STUNMessage),
    Dtls(DTLSMessage),
    Rtp(RTPMessage),
}

#[derive(Debug)]
pub(crate) struct TaggedMessageInternal {
    pub(crate) now: Instant,
    pub(crate) transport: TransportContext,
    pub(crate) message: MessageInternal,
}
