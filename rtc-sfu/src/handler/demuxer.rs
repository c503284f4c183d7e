use crate::event::EventInternal;
use crate::message::internal::{
    DTLSMessage, MessageInternal, RTPMessage, STUNMessage, TaggedMessageInternal,
};
use log::{debug, trace, warn};
use shared::error::{Error, Result};
use shared::util::{match_dtls, match_srtcp, match_srtp, match_stun};
use std::collections::VecDeque;
use std::time::Instant;

/// Kind of a datagram received on the shared socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PacketClass {
    Stun,
    Rtcp,
    Rtp,
    Dtls,
    Unknown,
}

/// Classifies a datagram as described in RFC 7983, checking STUN, then RTCP,
/// then RTP, then DTLS. Each check requires the minimum header length.
pub(crate) fn classify(buf: &[u8]) -> PacketClass {
    if match_stun(buf) {
        PacketClass::Stun
    } else if match_srtcp(buf) {
        PacketClass::Rtcp
    } else if match_srtp(buf) {
        PacketClass::Rtp
    } else if match_dtls(buf) {
        PacketClass::Dtls
    } else {
        PacketClass::Unknown
    }
}

pub(crate) struct DemuxerHandlerContext {
    pub(crate) receive_mtu: usize,

    pub(crate) read_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) write_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) event_outs: VecDeque<EventInternal>,
}

impl DemuxerHandlerContext {
    pub(crate) fn new(receive_mtu: usize) -> Self {
        Self {
            receive_mtu,
            read_outs: VecDeque::new(),
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
        }
    }
}

/// DemuxerHandler implements demuxing of STUN/RTCP/RTP/DTLS packets
pub(crate) struct DemuxerHandler<'a> {
    ctx: &'a mut DemuxerHandlerContext,
}

impl<'a> DemuxerHandler<'a> {
    pub(crate) fn new(ctx: &'a mut DemuxerHandlerContext) -> Self {
        DemuxerHandler { ctx }
    }

    pub(crate) fn name(&self) -> &'static str {
        "DemuxerHandler"
    }
}

impl<'a> sansio::Protocol<TaggedMessageInternal, TaggedMessageInternal, EventInternal>
    for DemuxerHandler<'a>
{
    type Rout = TaggedMessageInternal;
    type Wout = TaggedMessageInternal;
    type Eout = EventInternal;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        let MessageInternal::Raw(message) = msg.message else {
            debug!("drop non-RAW packet {:?}", msg.message);
            return Ok(());
        };

        if message.len() > self.ctx.receive_mtu {
            warn!(
                "drop packet of {} bytes larger than receive MTU {}",
                message.len(),
                self.ctx.receive_mtu
            );
            return Ok(());
        }

        let message = match classify(&message) {
            PacketClass::Stun => MessageInternal::Stun(STUNMessage::Raw(message)),
            PacketClass::Rtcp => MessageInternal::Rtp(RTPMessage::Srtcp(message)),
            PacketClass::Rtp => MessageInternal::Rtp(RTPMessage::Srtp(message)),
            PacketClass::Dtls => MessageInternal::Dtls(DTLSMessage::Raw(message)),
            PacketClass::Unknown => {
                warn!(
                    "drop unknown packet of {} bytes from {}",
                    message.len(),
                    msg.transport.peer_addr
                );
                return Ok(());
            }
        };

        self.ctx.read_outs.push_back(TaggedMessageInternal {
            now: msg.now,
            transport: msg.transport,
            message,
        });
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.ctx.read_outs.pop_front()
    }

    fn handle_write(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        match msg.message {
            MessageInternal::Raw(message)
            | MessageInternal::Stun(STUNMessage::Raw(message))
            | MessageInternal::Dtls(DTLSMessage::Raw(message))
            | MessageInternal::Rtp(RTPMessage::Srtp(message))
            | MessageInternal::Rtp(RTPMessage::Srtcp(message)) => {
                self.ctx.write_outs.push_back(TaggedMessageInternal {
                    now: msg.now,
                    transport: msg.transport,
                    message: MessageInternal::Raw(message),
                });
            }
            _ => {
                trace!("drop non-RAW packet {:?}", msg.message);
            }
        }
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.ctx.write_outs.pop_front()
    }

    fn handle_event(&mut self, evt: EventInternal) -> Result<()> {
        self.ctx.event_outs.push_back(evt);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.ctx.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        None
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
