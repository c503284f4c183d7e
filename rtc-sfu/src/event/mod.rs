//! Events crossing the [`sansio::Protocol`] surface of a transport.

use crate::consumer::ConsumerEvent;
use crate::rtp_stream::SourceStream;
use crate::transport::dtls::DtlsTransportState;
use crate::transport::ice::IceState;
use crate::transport::srtp::SrtpKeys;
use shared::{FiveTuple, TransportContext};
use std::fmt;
use std::rc::Rc;

/// Event input: what happened to a producer some consumers forward.
pub struct ProducerEvent {
    pub producer_id: String,
    pub kind: ProducerEventKind,
}

pub enum ProducerEventKind {
    /// A source stream became available under `mapped_ssrc`.
    NewRtpStream {
        stream: Rc<dyn SourceStream>,
        mapped_ssrc: u32,
    },
    RtpStreamScore {
        mapped_ssrc: u32,
        score: u8,
        previous_score: u8,
    },
    /// A sender report was received on the source stream.
    SenderReport { mapped_ssrc: u32, first: bool },
    Pause,
    Resume,
    /// Consumers of the producer are closed and removed.
    Close,
}

impl fmt::Debug for ProducerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerEventKind::NewRtpStream { mapped_ssrc, .. } => f
                .debug_struct("NewRtpStream")
                .field("mapped_ssrc", mapped_ssrc)
                .finish(),
            ProducerEventKind::RtpStreamScore {
                mapped_ssrc,
                score,
                previous_score,
            } => f
                .debug_struct("RtpStreamScore")
                .field("mapped_ssrc", mapped_ssrc)
                .field("score", score)
                .field("previous_score", previous_score)
                .finish(),
            ProducerEventKind::SenderReport { mapped_ssrc, first } => f
                .debug_struct("SenderReport")
                .field("mapped_ssrc", mapped_ssrc)
                .field("first", first)
                .finish(),
            ProducerEventKind::Pause => write!(f, "Pause"),
            ProducerEventKind::Resume => write!(f, "Resume"),
            ProducerEventKind::Close => write!(f, "Close"),
        }
    }
}

impl fmt::Debug for ProducerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerEvent")
            .field("producer_id", &self.producer_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Event output of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    IceStateChange(IceState),
    IceSelectedTupleChange(FiveTuple),
    DtlsStateChange(DtlsTransportState),
    /// New outgoing bitrate estimate from REMB feedback.
    AvailableBitrate(u32),
    Consumer {
        consumer_id: String,
        event: ConsumerEvent,
    },
    /// A consumer needs a key frame from the source stream `mapped_ssrc`
    /// of its producer.
    KeyFrameRequested {
        consumer_id: String,
        producer_id: String,
        mapped_ssrc: u32,
    },
}

#[derive(Debug)]
pub(crate) enum EventInternal {
    IceStateChange(IceState),
    IceSelectedTupleChange(TransportContext),
    DtlsStateChange(DtlsTransportState),
    SrtpKeys(SrtpKeys),
    Producer(ProducerEvent),
    TransportEvent(TransportEvent),
}
