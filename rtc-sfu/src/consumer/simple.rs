use super::seq_manager::SeqManager;
use super::{
    ConsumerCore, ConsumerOptions, ConsumerScore, ConsumerSettings, ForwardingConsumer, SendKind,
};
use crate::rtp_stream::{MediaPacket, RtpStreamSend, SourceStream};
use log::{debug, trace};
use shared::error::{Error, Result};
use std::rc::Rc;
use std::time::Instant;

/// Forwards a single source encoding, rewriting ssrc and sequence numbers.
pub struct SimpleConsumer {
    core: ConsumerCore,
    rtp_stream: RtpStreamSend,
    producer_stream: Option<Rc<dyn SourceStream>>,
    key_frame_supported: bool,
    sync_required: bool,
    seq_manager: SeqManager,
}

impl SimpleConsumer {
    pub(crate) fn new(options: ConsumerOptions, settings: &ConsumerSettings) -> Result<Self> {
        let core = ConsumerCore::new(options, settings)?;
        if core.consumable_rtp_encodings.len() != 1 {
            return Err(Error::ErrConsumerInvalidConsumableEncodingsCount(
                core.consumable_rtp_encodings.len(),
            ));
        }

        let rtp_stream = core.create_rtp_stream()?;
        let key_frame_supported = core.can_be_key_frame();

        Ok(Self {
            core,
            rtp_stream,
            producer_stream: None,
            key_frame_supported,
            sync_required: false,
            seq_manager: SeqManager::new(),
        })
    }
}

impl ForwardingConsumer for SimpleConsumer {
    fn core(&self) -> &ConsumerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ConsumerCore {
        &mut self.core
    }

    fn rtp_stream(&self) -> &RtpStreamSend {
        &self.rtp_stream
    }

    fn rtp_stream_mut(&mut self) -> &mut RtpStreamSend {
        &mut self.rtp_stream
    }

    fn producer_new_rtp_stream(
        &mut self,
        stream: Rc<dyn SourceStream>,
        _mapped_ssrc: u32,
    ) -> Result<()> {
        self.producer_stream = Some(stream);
        self.emit_score();
        Ok(())
    }

    fn producer_rtp_stream_score(&mut self, _mapped_ssrc: u32, _score: u8, _previous_score: u8) {
        self.emit_score();
    }

    fn producer_rtcp_sender_report(&mut self, _mapped_ssrc: u32, _first: bool) {}

    fn send_rtp_packet(&mut self, now: Instant, packet: &MediaPacket) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        if !self.core.is_payload_type_supported(packet.payload_type()) {
            trace!(
                "payload type not supported [payloadType:{}]",
                packet.payload_type()
            );
            return Ok(());
        }

        if self.sync_required && self.key_frame_supported && !packet.key_frame {
            return Ok(());
        }

        let is_sync_packet = self.sync_required;
        if is_sync_packet {
            if packet.key_frame {
                debug!("sync key frame received");
            }
            self.seq_manager
                .sync(packet.sequence_number().wrapping_sub(1));
            self.sync_required = false;
        }

        let Some(seq) = self.seq_manager.input(packet.sequence_number()) else {
            return Ok(());
        };

        let out = packet.rewrite(self.core.ssrc(), seq, packet.timestamp(), None);
        if is_sync_packet {
            debug!(
                "sending sync packet [ssrc:{}, seq:{}, ts:{}] from original [seq:{}]",
                out.header.ssrc,
                out.header.sequence_number,
                out.header.timestamp,
                packet.sequence_number()
            );
        }

        if self.rtp_stream.receive_packet(now, &out) {
            self.core.send(out, SendKind::Media);
        }

        Ok(())
    }

    fn request_key_frame(&mut self) {
        let mapped_ssrc = self.core.consumable_rtp_encodings[0].ssrc;
        self.core.request_key_frame_for(mapped_ssrc);
    }

    fn user_on_transport_connected(&mut self) {
        self.sync_required = true;
        if self.is_active() {
            self.request_key_frame();
        }
    }

    fn user_on_transport_disconnected(&mut self) {
        self.rtp_stream.pause();
    }

    fn user_on_paused(&mut self) {
        self.rtp_stream.pause();
    }

    fn user_on_resumed(&mut self) {
        self.sync_required = true;
        if self.is_active() {
            self.request_key_frame();
        }
    }

    fn score(&self) -> ConsumerScore {
        let producer_score = self
            .producer_stream
            .as_ref()
            .map(|stream| stream.score())
            .unwrap_or(0);

        ConsumerScore {
            score: self.rtp_stream.score(),
            producer_score,
            producer_scores: vec![producer_score],
        }
    }
}
