use crate::event::EventInternal;
use crate::message::internal::{DTLSMessage, MessageInternal, TaggedMessageInternal};
use crate::transport::dtls::DtlsTransportState;
use crate::transport::sctp::SctpAssociation;
use log::{debug, trace};
use shared::TransportContext;
use shared::error::{Error, Result};
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Default)]
pub(crate) struct SctpHandlerContext {
    pub(crate) association: Option<Box<dyn SctpAssociation>>,

    pub(crate) read_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) write_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) event_outs: VecDeque<EventInternal>,
}

impl SctpHandlerContext {
    pub(crate) fn new(association: Option<Box<dyn SctpAssociation>>) -> Self {
        Self {
            association,
            ..Default::default()
        }
    }
}

/// SctpHandler moves DTLS application data in and out of the optional
/// SCTP association.
pub(crate) struct SctpHandler<'a> {
    ctx: &'a mut SctpHandlerContext,
}

impl<'a> SctpHandler<'a> {
    pub(crate) fn new(ctx: &'a mut SctpHandlerContext) -> Self {
        SctpHandler { ctx }
    }

    pub(crate) fn name(&self) -> &'static str {
        "SctpHandler"
    }
}

impl<'a> sansio::Protocol<TaggedMessageInternal, TaggedMessageInternal, EventInternal>
    for SctpHandler<'a>
{
    type Rout = TaggedMessageInternal;
    type Wout = TaggedMessageInternal;
    type Eout = EventInternal;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        if let MessageInternal::Dtls(DTLSMessage::Sctp(data)) = msg.message {
            if let Some(association) = self.ctx.association.as_mut() {
                association.handle_read(msg.now, data)?;
            } else {
                debug!("ignoring DTLS application data (SCTP not enabled)");
            }
        } else {
            trace!("bypass sctp read {:?}", msg.transport.peer_addr);
            self.ctx.read_outs.push_back(msg);
        }
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.ctx.read_outs.pop_front()
    }

    fn handle_write(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        self.ctx.write_outs.push_back(msg);
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        if let Some(association) = self.ctx.association.as_mut() {
            while let Some(data) = association.poll_write() {
                self.ctx.write_outs.push_back(TaggedMessageInternal {
                    now: Instant::now(),
                    transport: TransportContext::default(),
                    message: MessageInternal::Dtls(DTLSMessage::Sctp(data)),
                });
            }
        }
        self.ctx.write_outs.pop_front()
    }

    fn handle_event(&mut self, evt: EventInternal) -> Result<()> {
        if let EventInternal::DtlsStateChange(DtlsTransportState::Connected) = evt {
            if let Some(association) = self.ctx.association.as_mut() {
                debug!("running SCTP association");
                association.run(Instant::now());
            }
        }
        self.ctx.event_outs.push_back(evt);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.ctx.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if let Some(association) = self.ctx.association.as_mut() {
            association.handle_timeout(now)?;
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        self.ctx
            .association
            .as_ref()
            .and_then(|association| association.poll_timeout())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(association) = self.ctx.association.as_mut() {
            association.close()?;
        }
        Ok(())
    }
}
