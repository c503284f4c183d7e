pub(crate) mod demuxer;
pub(crate) mod dtls;
pub(crate) mod forwarding;
pub(crate) mod ice;
pub(crate) mod sctp;
pub(crate) mod srtp;

use crate::WebRtcTransport;
use crate::event::{EventInternal, ProducerEvent, TransportEvent};
use crate::handler::demuxer::{DemuxerHandler, DemuxerHandlerContext};
use crate::handler::dtls::{DtlsHandler, DtlsHandlerContext};
use crate::handler::forwarding::{ForwardingHandler, ForwardingHandlerContext};
use crate::handler::ice::{IceHandler, IceHandlerContext};
use crate::handler::sctp::{SctpHandler, SctpHandlerContext};
use crate::handler::srtp::{SrtpHandler, SrtpHandlerContext};
use crate::message::internal::{MessageInternal, RTPMessage, TaggedMessageInternal};
use crate::message::{InboundMessage, OutboundMessage};
use log::{debug, warn};
use sansio::Protocol;
use shared::error::{Error, flatten_errs};
use shared::{FiveTuple, TaggedBytesMut};
use std::collections::VecDeque;
use std::time::Instant;

/// Forward handler list - invokes callback with handler list
macro_rules! forward_handlers {
    ($callback:ident!($($args:tt)*)) => {
        $callback!(
            $($args)*,
            [
                get_demuxer_handler,
                get_ice_handler,
                get_dtls_handler,
                get_sctp_handler,
                get_srtp_handler,
                get_forwarding_handler
            ]
        )
    };
}

/// Reverse handler list - invokes callback with handler list
macro_rules! reverse_handlers {
    ($callback:ident!($($args:tt)*)) => {
        $callback!(
            $($args)*,
            [
                get_forwarding_handler,
                get_srtp_handler,
                get_sctp_handler,
                get_dtls_handler,
                get_ice_handler,
                get_demuxer_handler
            ]
        )
    };
}

/// Helper macro that processes a list of handlers with code blocks
macro_rules! process_handler_list {
    (call_macro: process_handler!($self:expr, $handler:ident, $code:block), [$($getter:ident),+]) => {{
        $(
            {
                let mut $handler = $self.$getter();
                $code
            }
        )+
    }};
}

/// Unified macro to iterate over handlers with code blocks
macro_rules! for_each_handler {
    // Forward order: execute code block for each handler
    (forward: $macro:ident!($($args:tt)*)) => {
        forward_handlers!(process_handler_list!(call_macro: $macro!($($args)*)))
    };

    // Reverse order: execute code block for each handler
    (reverse: $macro:ident!($($args:tt)*)) => {
        reverse_handlers!(process_handler_list!(call_macro: $macro!($($args)*)))
    };
}

pub(crate) struct PipelineContext {
    // Handler contexts
    pub(crate) demuxer_handler_context: DemuxerHandlerContext,
    pub(crate) ice_handler_context: IceHandlerContext,
    pub(crate) dtls_handler_context: DtlsHandlerContext,
    pub(crate) sctp_handler_context: SctpHandlerContext,
    pub(crate) srtp_handler_context: SrtpHandlerContext,
    pub(crate) forwarding_handler_context: ForwardingHandlerContext,

    // Pipeline
    pub(crate) read_outs: VecDeque<InboundMessage>,
    pub(crate) write_outs: VecDeque<TaggedBytesMut>,
    pub(crate) event_outs: VecDeque<TransportEvent>,
}

impl PipelineContext {
    pub(crate) fn new(
        demuxer_handler_context: DemuxerHandlerContext,
        ice_handler_context: IceHandlerContext,
        dtls_handler_context: DtlsHandlerContext,
        sctp_handler_context: SctpHandlerContext,
        srtp_handler_context: SrtpHandlerContext,
        forwarding_handler_context: ForwardingHandlerContext,
    ) -> Self {
        Self {
            demuxer_handler_context,
            ice_handler_context,
            dtls_handler_context,
            sctp_handler_context,
            srtp_handler_context,
            forwarding_handler_context,

            read_outs: VecDeque::new(),
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
        }
    }
}

impl WebRtcTransport {
    /*
     Pipeline Flow (Read Path):
     Raw Bytes -> Demuxer -> ICE -> DTLS -> SCTP -> SRTP -> Forwarding -> Application

     Pipeline Flow (Write Path):
     Application -> Forwarding -> SRTP -> SCTP -> DTLS -> ICE -> Demuxer -> Raw Bytes
    */

    pub(crate) fn get_demuxer_handler(&mut self) -> DemuxerHandler<'_> {
        DemuxerHandler::new(&mut self.pipeline_context.demuxer_handler_context)
    }

    pub(crate) fn get_ice_handler(&mut self) -> IceHandler<'_> {
        IceHandler::new(&mut self.pipeline_context.ice_handler_context)
    }

    pub(crate) fn get_dtls_handler(&mut self) -> DtlsHandler<'_> {
        DtlsHandler::new(&mut self.pipeline_context.dtls_handler_context)
    }

    pub(crate) fn get_sctp_handler(&mut self) -> SctpHandler<'_> {
        SctpHandler::new(&mut self.pipeline_context.sctp_handler_context)
    }

    pub(crate) fn get_srtp_handler(&mut self) -> SrtpHandler<'_> {
        SrtpHandler::new(&mut self.pipeline_context.srtp_handler_context)
    }

    pub(crate) fn get_forwarding_handler(&mut self) -> ForwardingHandler<'_> {
        ForwardingHandler::new(&mut self.pipeline_context.forwarding_handler_context)
    }

    /// Pushes pending writes of every handler down to the pipeline's
    /// write_outs.
    pub(crate) fn flush_writes(&mut self) {
        let mut intermediate_wouts = VecDeque::new();

        for_each_handler!(reverse: process_handler!(self, handler, {
            while let Some(msg) = intermediate_wouts.pop_front() {
                if let Err(err) = handler.handle_write(msg) {
                    warn!("{}.handle_write got error: {}", handler.name(), err);
                }
            }
            while let Some(msg) = handler.poll_write() {
                intermediate_wouts.push_back(msg);
            }
        }));

        // Final poll write out to pipeline's write out
        while let Some(msg) = intermediate_wouts.pop_front() {
            if let MessageInternal::Raw(message) = msg.message {
                self.pipeline_context.write_outs.push_back(TaggedBytesMut {
                    now: msg.now,
                    transport: msg.transport,
                    message,
                });
            }
        }
    }
}

impl Protocol<TaggedBytesMut, OutboundMessage, ProducerEvent> for WebRtcTransport {
    type Rout = InboundMessage;
    type Wout = TaggedBytesMut;
    type Eout = TransportEvent;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<(), Self::Error> {
        if self.closed {
            return Err(Error::ErrTransportClosed);
        }

        let mut intermediate_routs = VecDeque::new();
        intermediate_routs.push_back(TaggedMessageInternal {
            now: msg.now,
            transport: msg.transport,
            message: MessageInternal::Raw(msg.message),
        });

        for_each_handler!(forward: process_handler!(self, handler, {
            while let Some(msg) = intermediate_routs.pop_front() {
                if let Err(err) = handler.handle_read(msg) {
                    warn!("{}.handle_read got error: {}", handler.name(), err);
                }
            }
            while let Some(msg) = handler.poll_read() {
                intermediate_routs.push_back(msg);
            }
        }));

        // Finally, put intermediate_routs into transport's routs
        while let Some(msg) = intermediate_routs.pop_front() {
            let inbound_message = match msg.message {
                MessageInternal::Rtp(RTPMessage::Rtp(packet)) => Some(InboundMessage::Rtp(packet)),
                MessageInternal::Rtp(RTPMessage::Rtcp(packets)) => {
                    Some(InboundMessage::Rtcp(packets))
                }
                _ => None,
            };

            if let Some(inbound_message) = inbound_message {
                self.pipeline_context.read_outs.push_back(inbound_message);
            }
        }

        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.pipeline_context.read_outs.pop_front()
    }

    fn handle_write(&mut self, msg: OutboundMessage) -> Result<(), Self::Error> {
        if self.closed {
            return Err(Error::ErrTransportClosed);
        }

        let (now, message) = match msg {
            OutboundMessage::Media {
                now,
                producer_id,
                packet,
            } => (
                now,
                MessageInternal::Rtp(RTPMessage::Media {
                    producer_id,
                    packet,
                }),
            ),
            OutboundMessage::Rtcp { now, packets } => {
                (now, MessageInternal::Rtp(RTPMessage::Rtcp(packets)))
            }
        };

        // Only forwarding can handle user write message
        let mut forwarding_handler = self.get_forwarding_handler();
        forwarding_handler.handle_write(TaggedMessageInternal {
            now,
            transport: Default::default(),
            message,
        })
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.flush_writes();
        self.pipeline_context.write_outs.pop_front()
    }

    fn handle_event(&mut self, evt: ProducerEvent) -> Result<(), Self::Error> {
        if self.closed {
            return Err(Error::ErrTransportClosed);
        }

        // Only forwarding can handle user event
        let mut forwarding_handler = self.get_forwarding_handler();
        forwarding_handler.handle_event(EventInternal::Producer(evt))
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        let mut intermediate_eouts = VecDeque::new();

        for_each_handler!(forward: process_handler!(self, handler, {
            while let Some(evt) = intermediate_eouts.pop_front() {
                if let Err(err) = handler.handle_event(evt) {
                    warn!("{}.handle_event got error: {}", handler.name(), err);
                }
            }
            while let Some(msg) = handler.poll_event() {
                intermediate_eouts.push_back(msg);
            }
        }));

        // Finally, put intermediate_eouts into transport's eouts
        while let Some(evt_internal) = intermediate_eouts.pop_front() {
            let evt = match evt_internal {
                EventInternal::IceStateChange(state) => Some(TransportEvent::IceStateChange(state)),
                EventInternal::IceSelectedTupleChange(transport) => Some(
                    TransportEvent::IceSelectedTupleChange(FiveTuple::from(&transport)),
                ),
                EventInternal::DtlsStateChange(state) => {
                    Some(TransportEvent::DtlsStateChange(state))
                }
                EventInternal::TransportEvent(evt) => Some(evt),
                EventInternal::SrtpKeys(_) | EventInternal::Producer(_) => None,
            };

            if let Some(evt) = evt {
                self.pipeline_context.event_outs.push_back(evt);
            }
        }

        self.pipeline_context.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<(), Self::Error> {
        for_each_handler!(forward: process_handler!(self, handler, {
            handler.handle_timeout(now)?;
        }));
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        let mut eto: Option<Instant> = None;
        for_each_handler!(forward: process_handler!(self, handler, {
            if let Some(next) = handler.poll_timeout() {
                eto = Some(eto.map_or(next, |curr| std::cmp::min(curr, next)));
            }
        }));
        eto
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("closing transport");

        // Shutdown strategy:
        // 1. SCTP first, its final packets still go out through DTLS.
        // 2. DTLS next, its close_notify still goes out through ICE.
        // 3. ICE, then the SRTP sessions, then consumers and the REMB client.
        let mut close_errs: Vec<Error> = vec![];

        if let Err(err) = self.get_sctp_handler().close() {
            close_errs.push(err);
        }
        self.flush_writes();

        if let Err(err) = self.get_dtls_handler().close() {
            close_errs.push(err);
        }
        self.flush_writes();

        if let Err(err) = self.get_ice_handler().close() {
            close_errs.push(err);
        }
        if let Err(err) = self.get_srtp_handler().close() {
            close_errs.push(err);
        }
        if let Err(err) = self.get_forwarding_handler().close() {
            close_errs.push(err);
        }
        if let Err(err) = self.get_demuxer_handler().close() {
            close_errs.push(err);
        }

        flatten_errs(close_errs)
    }
}
