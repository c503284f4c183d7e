use crate::event::EventInternal;
use crate::message::internal::{MessageInternal, STUNMessage, TaggedMessageInternal};
use crate::transport::ice::{IceEvent, IceLiteAgent};
use log::{debug, trace, warn};
use shared::error::{Error, Result};
use std::collections::VecDeque;
use std::time::Instant;

pub(crate) struct IceHandlerContext {
    pub(crate) agent: IceLiteAgent,

    pub(crate) read_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) write_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) event_outs: VecDeque<EventInternal>,
}

impl IceHandlerContext {
    pub(crate) fn new(agent: IceLiteAgent) -> Self {
        Self {
            agent,

            read_outs: VecDeque::new(),
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
        }
    }
}

/// IceHandler answers connectivity checks and pins everything else to the
/// tuples validated by them.
pub(crate) struct IceHandler<'a> {
    ctx: &'a mut IceHandlerContext,
}

impl<'a> IceHandler<'a> {
    pub(crate) fn new(ctx: &'a mut IceHandlerContext) -> Self {
        IceHandler { ctx }
    }

    pub(crate) fn name(&self) -> &'static str {
        "IceHandler"
    }
}

impl<'a> sansio::Protocol<TaggedMessageInternal, TaggedMessageInternal, EventInternal>
    for IceHandler<'a>
{
    type Rout = TaggedMessageInternal;
    type Wout = TaggedMessageInternal;
    type Eout = EventInternal;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        if let MessageInternal::Stun(STUNMessage::Raw(message)) = msg.message {
            return self.ctx.agent.handle_stun(msg.now, msg.transport, &message);
        }

        if !self.ctx.agent.is_valid_tuple(&msg.transport) {
            warn!(
                "drop packet from {} on a tuple not validated by ICE",
                msg.transport.peer_addr
            );
            return Ok(());
        }

        // valid traffic moves the selection to the tuple it arrives on
        if self.ctx.agent.selected_tuple().is_some() {
            self.ctx.agent.force_selected_tuple(&msg.transport)?;
        }

        trace!("bypass ice read {:?}", msg.transport.peer_addr);
        self.ctx.read_outs.push_back(msg);
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.ctx.read_outs.pop_front()
    }

    fn handle_write(&mut self, mut msg: TaggedMessageInternal) -> Result<()> {
        if let Some(selected_tuple) = self.ctx.agent.selected_tuple() {
            msg.transport = selected_tuple;
            trace!("bypass ice write {:?}", msg.transport.peer_addr);
            self.ctx.write_outs.push_back(msg);
        } else {
            trace!("drop message before ICE has a selected tuple");
        }

        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        while let Some(transmit) = self.ctx.agent.poll_transmit() {
            self.ctx.write_outs.push_back(TaggedMessageInternal {
                now: transmit.now,
                transport: transmit.transport,
                message: MessageInternal::Stun(STUNMessage::Raw(transmit.message)),
            });
        }

        self.ctx.write_outs.pop_front()
    }

    fn handle_event(&mut self, evt: EventInternal) -> Result<()> {
        self.ctx.event_outs.push_back(evt);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        while let Some(evt) = self.ctx.agent.poll_event() {
            match evt {
                IceEvent::StateChange(state) => {
                    self.ctx
                        .event_outs
                        .push_back(EventInternal::IceStateChange(state));
                }
                IceEvent::SelectedTupleChange(tuple) => {
                    debug!("ice selected tuple {}", shared::FiveTuple::from(&tuple));
                    self.ctx
                        .event_outs
                        .push_back(EventInternal::IceSelectedTupleChange(tuple));
                }
            }
        }

        self.ctx.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        None
    }

    fn close(&mut self) -> Result<()> {
        self.ctx.agent.close();
        Ok(())
    }
}
