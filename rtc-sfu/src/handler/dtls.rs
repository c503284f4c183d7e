use crate::event::EventInternal;
use crate::message::internal::{DTLSMessage, MessageInternal, TaggedMessageInternal};
use crate::transport::dtls::{DtlsEvent, DtlsTransport};
use crate::transport::ice::IceState;
use log::{debug, trace};
use shared::TransportContext;
use shared::error::{Error, Result};
use std::collections::VecDeque;
use std::time::Instant;

pub(crate) struct DtlsHandlerContext {
    pub(crate) dtls_transport: DtlsTransport,
    /// Last ICE state seen, gates the handshake.
    pub(crate) ice_state: IceState,

    pub(crate) read_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) write_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) event_outs: VecDeque<EventInternal>,
}

impl DtlsHandlerContext {
    pub(crate) fn new(dtls_transport: DtlsTransport) -> Self {
        Self {
            dtls_transport,
            ice_state: IceState::New,

            read_outs: VecDeque::new(),
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
        }
    }

    /// Runs the handshake if the role is resolved and ICE is usable.
    pub(crate) fn may_run_dtls_transport(&mut self, now: Instant) -> Result<()> {
        let result = self.dtls_transport.may_run(now, self.ice_state);
        self.drain(now, TransportContext::default());
        result
    }

    /// Moves engine output into the handler queues.
    fn drain(&mut self, now: Instant, transport: TransportContext) {
        while let Some(transmit) = self.dtls_transport.poll_transmit() {
            self.write_outs.push_back(TaggedMessageInternal {
                now,
                transport,
                message: MessageInternal::Dtls(DTLSMessage::Raw(transmit)),
            });
        }

        while let Some(evt) = self.dtls_transport.poll_event() {
            match evt {
                DtlsEvent::StateChange(state) => {
                    self.event_outs
                        .push_back(EventInternal::DtlsStateChange(state));
                }
                DtlsEvent::SrtpKeys(keys) => {
                    self.event_outs.push_back(EventInternal::SrtpKeys(keys));
                }
                DtlsEvent::ApplicationData(data) => {
                    trace!("recv dtls application data {:?}", transport.peer_addr);
                    self.read_outs.push_back(TaggedMessageInternal {
                        now,
                        transport,
                        message: MessageInternal::Dtls(DTLSMessage::Sctp(data)),
                    });
                }
            }
        }
    }
}

/// DtlsHandler feeds DTLS records to the engine once it runs and carries
/// SCTP over it.
pub(crate) struct DtlsHandler<'a> {
    ctx: &'a mut DtlsHandlerContext,
}

impl<'a> DtlsHandler<'a> {
    pub(crate) fn new(ctx: &'a mut DtlsHandlerContext) -> Self {
        DtlsHandler { ctx }
    }

    pub(crate) fn name(&self) -> &'static str {
        "DtlsHandler"
    }
}

impl<'a> sansio::Protocol<TaggedMessageInternal, TaggedMessageInternal, EventInternal>
    for DtlsHandler<'a>
{
    type Rout = TaggedMessageInternal;
    type Wout = TaggedMessageInternal;
    type Eout = EventInternal;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        if let MessageInternal::Dtls(DTLSMessage::Raw(dtls_message)) = msg.message {
            trace!("recv dtls RAW {:?}", msg.transport.peer_addr);
            let result = self
                .ctx
                .dtls_transport
                .handle_read(msg.now, &dtls_message);
            self.ctx.drain(msg.now, msg.transport);
            result
        } else {
            trace!("bypass dtls read {:?}", msg.transport.peer_addr);
            self.ctx.read_outs.push_back(msg);
            Ok(())
        }
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.ctx.read_outs.pop_front()
    }

    fn handle_write(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        if let MessageInternal::Dtls(DTLSMessage::Sctp(data)) = msg.message {
            trace!("send dtls application data");
            let result = self.ctx.dtls_transport.send_application_data(&data);
            self.ctx.drain(msg.now, msg.transport);
            result
        } else {
            trace!("bypass dtls write {:?}", msg.transport.peer_addr);
            self.ctx.write_outs.push_back(msg);
            Ok(())
        }
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.ctx.write_outs.pop_front()
    }

    fn handle_event(&mut self, evt: EventInternal) -> Result<()> {
        let ice_state = if let EventInternal::IceStateChange(state) = &evt {
            Some(*state)
        } else {
            None
        };
        self.ctx.event_outs.push_back(evt);

        if let Some(state) = ice_state {
            debug!("dtls sees ice state {state}");
            self.ctx.ice_state = state;
            self.ctx.may_run_dtls_transport(Instant::now())?;
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.ctx.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        let result = self.ctx.dtls_transport.handle_timeout(now);
        self.ctx.drain(now, TransportContext::default());
        result
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        self.ctx.dtls_transport.poll_timeout()
    }

    fn close(&mut self) -> Result<()> {
        let result = self.ctx.dtls_transport.close();
        self.ctx.drain(Instant::now(), TransportContext::default());
        result
    }
}
