use crate::event::EventInternal;
use crate::message::internal::{MessageInternal, RTPMessage, TaggedMessageInternal};
use crate::transport::dtls::DtlsTransportState;
use crate::transport::srtp::{SrtpSessionFactory, SrtpSessionPair};
use log::{trace, warn};
use shared::error::{Error, Result};
use std::collections::VecDeque;
use std::time::Instant;
use util::marshal::{Marshal, Unmarshal};

pub(crate) struct SrtpHandlerContext {
    pub(crate) sessions: SrtpSessionPair,
    pub(crate) session_factory: Box<dyn SrtpSessionFactory>,
    pub(crate) dtls_connected: bool,

    pub(crate) read_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) write_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) event_outs: VecDeque<EventInternal>,
}

impl SrtpHandlerContext {
    pub(crate) fn new(session_factory: Box<dyn SrtpSessionFactory>) -> Self {
        Self {
            sessions: SrtpSessionPair::default(),
            session_factory,
            dtls_connected: false,

            read_outs: VecDeque::new(),
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
        }
    }
}

/// SrtpHandler protects and unprotects RTP/RTCP with the sessions keyed by
/// the last DTLS handshake.
pub(crate) struct SrtpHandler<'a> {
    ctx: &'a mut SrtpHandlerContext,
}

impl<'a> SrtpHandler<'a> {
    pub(crate) fn new(ctx: &'a mut SrtpHandlerContext) -> Self {
        SrtpHandler { ctx }
    }

    pub(crate) fn name(&self) -> &'static str {
        "SrtpHandler"
    }
}

impl<'a> sansio::Protocol<TaggedMessageInternal, TaggedMessageInternal, EventInternal>
    for SrtpHandler<'a>
{
    type Rout = TaggedMessageInternal;
    type Wout = TaggedMessageInternal;
    type Eout = EventInternal;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        let message = match msg.message {
            MessageInternal::Rtp(RTPMessage::Srtp(message)) => {
                if !self.ctx.dtls_connected || !self.ctx.sessions.has_inbound() {
                    trace!("drop SRTP packet, no inbound session");
                    return Ok(());
                }
                let mut decrypted = match self.ctx.sessions.decrypt_rtp(&message) {
                    Ok(decrypted) => decrypted,
                    Err(err) => {
                        warn!("SRTP decrypt failed, packet dropped: {err}");
                        return Ok(());
                    }
                };
                let packet = rtp::packet::Packet::unmarshal(&mut decrypted)
                    .map_err(|e| Error::Rtp(e.to_string()))?;
                RTPMessage::Rtp(packet)
            }
            MessageInternal::Rtp(RTPMessage::Srtcp(message)) => {
                if !self.ctx.dtls_connected || !self.ctx.sessions.has_inbound() {
                    trace!("drop SRTCP packet, no inbound session");
                    return Ok(());
                }
                let mut decrypted = match self.ctx.sessions.decrypt_rtcp(&message) {
                    Ok(decrypted) => decrypted,
                    Err(err) => {
                        warn!("SRTCP decrypt failed, packet dropped: {err}");
                        return Ok(());
                    }
                };
                let packets = rtcp::packet::unmarshal(&mut decrypted)
                    .map_err(|e| Error::Rtcp(e.to_string()))?;
                RTPMessage::Rtcp(packets)
            }
            message => {
                trace!("bypass srtp read {:?}", msg.transport.peer_addr);
                self.ctx.read_outs.push_back(TaggedMessageInternal {
                    now: msg.now,
                    transport: msg.transport,
                    message,
                });
                return Ok(());
            }
        };

        self.ctx.read_outs.push_back(TaggedMessageInternal {
            now: msg.now,
            transport: msg.transport,
            message: MessageInternal::Rtp(message),
        });
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.ctx.read_outs.pop_front()
    }

    fn handle_write(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        let message = match msg.message {
            MessageInternal::Rtp(RTPMessage::Rtp(packet)) => {
                if !self.ctx.dtls_connected || !self.ctx.sessions.has_outbound() {
                    trace!("drop RTP packet, no outbound session");
                    return Ok(());
                }
                let raw = packet.marshal().map_err(|e| Error::Rtp(e.to_string()))?;
                RTPMessage::Srtp(self.ctx.sessions.encrypt_rtp(&raw)?.as_ref().into())
            }
            MessageInternal::Rtp(RTPMessage::Rtcp(packets)) => {
                if !self.ctx.dtls_connected || !self.ctx.sessions.has_outbound() {
                    trace!("drop RTCP packets, no outbound session");
                    return Ok(());
                }
                let raw =
                    rtcp::packet::marshal(&packets).map_err(|e| Error::Rtcp(e.to_string()))?;
                RTPMessage::Srtcp(self.ctx.sessions.encrypt_rtcp(&raw)?.as_ref().into())
            }
            message => {
                trace!("bypass srtp write {:?}", msg.transport.peer_addr);
                self.ctx.write_outs.push_back(TaggedMessageInternal {
                    now: msg.now,
                    transport: msg.transport,
                    message,
                });
                return Ok(());
            }
        };

        self.ctx.write_outs.push_back(TaggedMessageInternal {
            now: msg.now,
            transport: msg.transport,
            message: MessageInternal::Rtp(message),
        });
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.ctx.write_outs.pop_front()
    }

    fn handle_event(&mut self, evt: EventInternal) -> Result<()> {
        match &evt {
            EventInternal::SrtpKeys(keys) => {
                self.ctx
                    .sessions
                    .install(self.ctx.session_factory.as_mut(), keys);
            }
            EventInternal::DtlsStateChange(state) => {
                self.ctx.dtls_connected = *state == DtlsTransportState::Connected;
            }
            _ => {}
        }
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
        self.ctx.sessions.clear();
        self.ctx.dtls_connected = false;
        Ok(())
    }
}
