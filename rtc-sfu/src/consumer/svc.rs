use super::encoding_context::{EncodingContext, LayeredEncodingContext, PayloadAction};
use super::layers::{ConsumerLayers, Layers};
use super::seq_manager::SeqManager;
use super::{
    ConsumerCore, ConsumerEvent, ConsumerOptions, ConsumerScore, ConsumerSettings,
    ForwardingConsumer, SendKind,
};
use crate::rtp_stream::{MediaPacket, RtpStreamSend, SourceStream, MAX_SCORE};
use log::{debug, trace, warn};
use shared::error::{Error, Result};
use std::rc::Rc;
use std::time::Instant;

/// Forwards a scalable (SVC) encoding, filtering spatial and temporal layers
/// through its [`EncodingContext`].
pub struct SvcConsumer {
    core: ConsumerCore,
    rtp_stream: RtpStreamSend,
    producer_stream: Option<Rc<dyn SourceStream>>,
    encoding_context: Box<dyn EncodingContext>,
    seq_manager: SeqManager,
    sync_required: bool,
    preferred: Layers,
    provisional: Layers,
}

impl SvcConsumer {
    pub(crate) fn new(
        options: ConsumerOptions,
        settings: &ConsumerSettings,
        encoding_context: Option<Box<dyn EncodingContext>>,
    ) -> Result<Self> {
        let preferred_layers = options.preferred_layers;
        let core = ConsumerCore::new(options, settings)?;

        if core.consumable_rtp_encodings.len() != 1 {
            return Err(Error::ErrConsumerInvalidConsumableEncodingsCount(
                core.consumable_rtp_encodings.len(),
            ));
        }

        let scalability = core.scalability;
        if scalability.spatial_layers < 2 && scalability.temporal_layers < 2 {
            return Err(Error::ErrInvalidScalabilityMode(format!(
                "L{}T{}",
                scalability.spatial_layers, scalability.temporal_layers
            )));
        }

        let preferred = Layers::preferred(
            preferred_layers,
            scalability.spatial_layers,
            scalability.temporal_layers,
        );

        let encoding_context = encoding_context.unwrap_or_else(|| {
            Box::new(LayeredEncodingContext::new(
                scalability.spatial_layers,
                scalability.temporal_layers,
            ))
        });

        let rtp_stream = core.create_rtp_stream()?;

        Ok(Self {
            core,
            rtp_stream,
            producer_stream: None,
            encoding_context,
            seq_manager: SeqManager::new(),
            sync_required: false,
            preferred,
            provisional: Layers::NONE,
        })
    }

    pub(crate) fn target_layers(&self) -> Layers {
        Layers::new(
            self.encoding_context.target_spatial_layer(),
            self.encoding_context.target_temporal_layer(),
        )
    }

    fn producer_score(&self) -> u8 {
        self.producer_stream
            .as_ref()
            .map(|stream| stream.score())
            .unwrap_or(0)
    }

    fn recalculate_target_layers(&self) -> Option<Layers> {
        let new_target = if self.producer_score() == 0 {
            Layers::NONE
        } else {
            self.preferred
        };

        (new_target != self.target_layers()).then_some(new_target)
    }

    fn may_change_layers(&mut self, force: bool) {
        let Some(new_target) = self.recalculate_target_layers() else {
            return;
        };

        if self.core.externally_managed_bitrate {
            if new_target.spatial != self.encoding_context.target_spatial_layer() || force {
                self.core.need_bitrate_change();
            }
        } else {
            self.update_target_layers(new_target);
        }
    }

    fn update_target_layers(&mut self, new_target: Layers) {
        if new_target.is_none() {
            self.encoding_context.set_target_spatial_layer(-1);
            self.encoding_context.set_target_temporal_layer(-1);
            self.encoding_context.set_current_spatial_layer(-1);
            self.encoding_context.set_current_temporal_layer(-1);

            debug!(
                "target layers changed [spatial:-1, temporal:-1, consumerId:{}]",
                self.core.id
            );
            self.emit_layers_change();
            return;
        }

        self.encoding_context
            .set_target_spatial_layer(new_target.spatial);
        self.encoding_context
            .set_target_temporal_layer(new_target.temporal);

        debug!(
            "target layers changed [spatial:{}, temporal:{}, consumerId:{}]",
            new_target.spatial, new_target.temporal, self.core.id
        );

        // Going up needs a key frame; going down is immediate.
        if new_target.spatial > self.encoding_context.current_spatial_layer() {
            self.request_key_frame();
        }
    }

    fn emit_layers_change(&mut self) {
        let layers = self.current_layers();
        self.core.emit(ConsumerEvent::LayersChange(layers));
    }
}

impl ForwardingConsumer for SvcConsumer {
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

    fn is_active(&self) -> bool {
        self.core.is_active() && self.producer_stream.is_some()
    }

    fn producer_new_rtp_stream(
        &mut self,
        stream: Rc<dyn SourceStream>,
        _mapped_ssrc: u32,
    ) -> Result<()> {
        self.producer_stream = Some(stream);

        if self.is_active() {
            self.may_change_layers(false);
        }

        Ok(())
    }

    fn producer_rtp_stream_score(&mut self, _mapped_ssrc: u32, score: u8, previous_score: u8) {
        self.emit_score();

        if self.core.is_active()
            && (!self.core.externally_managed_bitrate || score == 0 || previous_score == 0)
        {
            self.may_change_layers(false);
        }
    }

    fn producer_rtcp_sender_report(&mut self, _mapped_ssrc: u32, _first: bool) {}

    fn bitrate_priority(&self) -> u16 {
        if !self.core.is_active() {
            return 0;
        }

        match &self.producer_stream {
            Some(stream) if stream.score() > 0 => {
                let max_spatial = stream.spatial_layers().max(1) as i16 - 1;
                (self.preferred.spatial.min(max_spatial) + 1) as u16
            }
            _ => 1,
        }
    }

    fn use_available_bitrate(&mut self, now: Instant, bitrate: u32) -> u32 {
        self.provisional = Layers::NONE;

        if !self.core.is_active() {
            return 0;
        }
        let Some(stream) = self.producer_stream.as_ref() else {
            return 0;
        };
        let producer_score = stream.score();
        if producer_score == 0 {
            return 0;
        }

        let tuning = self.core.settings.layer_tuning;
        let virtual_bitrate = tuning.virtual_bitrate(bitrate, self.rtp_stream.loss_percentage());

        let mut provisional = Layers::NONE;
        let mut used_bitrate = 0u32;

        'scan: for spatial_layer in 0..stream.spatial_layers() as i16 {
            for temporal_layer in 0..stream.temporal_layers() as i16 {
                let required_bitrate =
                    stream.bitrate(now, spatial_layer as u8, temporal_layer as u8);

                if required_bitrate == 0 {
                    break;
                }
                if required_bitrate > virtual_bitrate {
                    break 'scan;
                }

                provisional = Layers::new(spatial_layer, temporal_layer);
                used_bitrate = required_bitrate;

                if provisional == self.preferred && producer_score >= tuning.good_score {
                    break 'scan;
                }
            }

            if spatial_layer >= self.preferred.spatial && producer_score >= tuning.good_score {
                break;
            }
        }

        self.provisional = provisional;

        debug!(
            "choosing layers {}:{} [bitrate:{}, virtualBitrate:{}, usedBitrate:{}, consumerId:{}]",
            provisional.spatial,
            provisional.temporal,
            bitrate,
            virtual_bitrate,
            used_bitrate,
            self.core.id
        );

        if used_bitrate <= bitrate {
            used_bitrate
        } else if used_bitrate <= virtual_bitrate {
            bitrate
        } else {
            used_bitrate
        }
    }

    fn increase_layer(&mut self, now: Instant, bitrate: u32) -> u32 {
        if !self.core.is_active() || self.provisional == self.preferred {
            return 0;
        }
        let Some(stream) = self.producer_stream.as_ref() else {
            return 0;
        };

        let tuning = self.core.settings.layer_tuning;
        if stream.score() < tuning.good_score {
            return 0;
        }
        let virtual_bitrate = tuning.virtual_bitrate(bitrate, self.rtp_stream.loss_percentage());

        let mut candidate: Option<(Layers, u32)> = None;

        'scan: for spatial_layer in 0..stream.spatial_layers() as i16 {
            if spatial_layer < self.provisional.spatial {
                continue;
            }
            if spatial_layer > self.preferred.spatial {
                break;
            }

            for temporal_layer in 0..stream.temporal_layers() as i16 {
                if spatial_layer == self.provisional.spatial
                    && temporal_layer <= self.provisional.temporal
                {
                    continue;
                }
                if spatial_layer == self.preferred.spatial
                    && temporal_layer > self.preferred.temporal
                {
                    break 'scan;
                }

                let required_bitrate =
                    stream.layer_bitrate(now, spatial_layer as u8, temporal_layer as u8);
                if required_bitrate == 0 {
                    break;
                }

                candidate = Some((Layers::new(spatial_layer, temporal_layer), required_bitrate));
                break 'scan;
            }
        }

        let Some((layers, required_bitrate)) = candidate else {
            return 0;
        };
        if required_bitrate > virtual_bitrate {
            return 0;
        }

        self.provisional = layers;

        trace!(
            "upgrading to layers {}:{} [virtualBitrate:{}, requiredBitrate:{}]",
            layers.spatial,
            layers.temporal,
            virtual_bitrate,
            required_bitrate
        );

        required_bitrate.min(bitrate)
    }

    fn apply_layers(&mut self) {
        let provisional = std::mem::take(&mut self.provisional);

        if !self.core.is_active() {
            return;
        }

        if provisional != self.target_layers() {
            self.update_target_layers(provisional);
        }
    }

    fn preferred_layers(&self) -> Option<ConsumerLayers> {
        self.preferred.into()
    }

    fn current_layers(&self) -> Option<ConsumerLayers> {
        Layers::new(
            self.encoding_context.current_spatial_layer(),
            self.encoding_context.current_temporal_layer(),
        )
        .into()
    }

    fn set_preferred_layers(&mut self, layers: ConsumerLayers) {
        self.preferred = Layers::preferred(
            Some(layers),
            self.core.scalability.spatial_layers,
            self.core.scalability.temporal_layers,
        );

        debug!(
            "preferred layers changed [spatial:{}, temporal:{}, consumerId:{}]",
            self.preferred.spatial, self.preferred.temporal, self.core.id
        );

        if self.is_active() {
            self.may_change_layers(true);
        }
    }

    fn send_rtp_packet(&mut self, now: Instant, packet: &MediaPacket) -> Result<()> {
        if !self.is_active() || self.encoding_context.target_temporal_layer() == -1 {
            return Ok(());
        }

        if !self.core.is_payload_type_supported(packet.payload_type()) {
            trace!(
                "payload type not supported [payloadType:{}]",
                packet.payload_type()
            );
            return Ok(());
        }

        if self.sync_required && !packet.key_frame {
            return Ok(());
        }

        let is_sync_packet = self.sync_required;
        if is_sync_packet {
            debug!("sync key frame received");
            self.seq_manager
                .sync(packet.sequence_number().wrapping_sub(1));
            self.encoding_context.sync_required();
            self.sync_required = false;
        }

        let previous_layers = self.current_layers();

        let payload = match self.encoding_context.process_packet(packet) {
            PayloadAction::Drop => {
                self.seq_manager.drop(packet.sequence_number());
                return Ok(());
            }
            PayloadAction::Forward => None,
            PayloadAction::Rewrite(payload) => Some(payload),
        };

        let current_layers = self.current_layers();
        if previous_layers != current_layers {
            let spatial_changed = previous_layers.map(|l| l.spatial_layer)
                != current_layers.map(|l| l.spatial_layer);
            if spatial_changed {
                self.rtp_stream.reset_score(MAX_SCORE, false);
            }

            self.emit_layers_change();

            if spatial_changed {
                self.emit_score();
            }
        }

        let Some(seq) = self.seq_manager.input(packet.sequence_number()) else {
            return Ok(());
        };

        let out = packet.rewrite(self.core.ssrc(), seq, packet.timestamp(), payload);

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
        } else {
            warn!(
                "failed to send packet [ssrc:{}, seq:{}, ts:{}] from original [seq:{}]",
                out.header.ssrc,
                out.header.sequence_number,
                out.header.timestamp,
                packet.sequence_number()
            );
        }

        Ok(())
    }

    fn on_rtp_stream_score(&mut self) {
        self.emit_score();

        if self.is_active() && !self.core.externally_managed_bitrate {
            self.may_change_layers(false);
        }
    }

    fn request_key_frame(&mut self) {
        if self.producer_stream.is_none() {
            return;
        }
        let mapped_ssrc = self.core.consumable_rtp_encodings[0].ssrc;
        self.core.request_key_frame_for(mapped_ssrc);
    }

    fn user_on_transport_connected(&mut self) {
        self.sync_required = true;
        if self.is_active() {
            self.may_change_layers(false);
        }
    }

    fn user_on_transport_disconnected(&mut self) {
        self.rtp_stream.pause();
        self.update_target_layers(Layers::NONE);
    }

    fn user_on_paused(&mut self) {
        self.rtp_stream.pause();
        self.update_target_layers(Layers::NONE);

        if self.core.externally_managed_bitrate {
            self.core.need_bitrate_change();
        }
    }

    fn user_on_resumed(&mut self) {
        self.sync_required = true;
        if self.is_active() {
            self.may_change_layers(false);
        }
    }

    fn score(&self) -> ConsumerScore {
        let producer_score = self.producer_score();
        ConsumerScore {
            score: self.rtp_stream.score(),
            producer_score,
            producer_scores: vec![producer_score],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::test_utils::*;
    use crate::consumer::ConsumerType;

    const SOURCE_SSRC: u32 = 4444;

    fn connected_consumer(
        preferred: Option<ConsumerLayers>,
    ) -> Result<(SvcConsumer, Rc<MockSourceStream>)> {
        let mut options = video_options(ConsumerType::Svc, &[SOURCE_SSRC], "L3T3");
        options.preferred_layers = preferred;
        let mut consumer = SvcConsumer::new(options, &ConsumerSettings::default(), None)?;

        let stream = Rc::new(MockSourceStream::new(SOURCE_SSRC, 10).with_layers(3, 3));
        consumer.producer_new_rtp_stream(stream.clone(), SOURCE_SSRC)?;
        consumer.core.transport_connected = true;
        consumer.user_on_transport_connected();

        Ok((consumer, stream))
    }

    fn packet(seq: u16, spatial: u8, temporal: u8, key_frame: bool) -> MediaPacket {
        media_packet(SOURCE_SSRC, VP8_PT, seq, seq as u32 * 1000, key_frame)
            .with_layers(spatial, temporal)
    }

    #[test]
    fn test_svc_consumer_validation() {
        let settings = ConsumerSettings::default();
        let tests = vec![
            (
                "two consumables",
                video_options(ConsumerType::Svc, &[1, 2], "L3T3"),
                Error::ErrConsumerInvalidConsumableEncodingsCount(2),
            ),
            (
                "single layer",
                video_options(ConsumerType::Svc, &[1], "L1T1"),
                Error::ErrInvalidScalabilityMode("L1T1".to_owned()),
            ),
        ];

        for (name, options, expected) in tests {
            let result = SvcConsumer::new(options, &settings, None);
            assert_eq!(result.err(), Some(expected), "{name} failed");
        }
    }

    #[test]
    fn test_svc_target_follows_preferred_and_health() -> Result<()> {
        let (mut consumer, stream) = connected_consumer(Some(ConsumerLayers {
            spatial_layer: 1,
            temporal_layer: Some(1),
        }))?;
        assert_eq!(consumer.target_layers(), Layers::new(1, 1));

        let (_, _, requests, _) = split_actions(drain(&mut consumer));
        assert_eq!(requests, vec![SOURCE_SSRC]);

        stream.score.set(0);
        consumer.producer_rtp_stream_score(SOURCE_SSRC, 0, 10);
        assert!(consumer.target_layers().is_none());

        let (_, events, _, _) = split_actions(drain(&mut consumer));
        assert!(events.contains(&ConsumerEvent::LayersChange(None)));

        Ok(())
    }

    #[test]
    fn test_svc_filters_layers_with_gap_free_output() -> Result<()> {
        let (mut consumer, _) = connected_consumer(Some(ConsumerLayers {
            spatial_layer: 1,
            temporal_layer: Some(0),
        }))?;
        drain(&mut consumer);
        let now = Instant::now();

        let tests = vec![
            ("non key frame before sync", packet(1, 0, 0, false), false),
            ("key frame", packet(2, 0, 0, true), true),
            ("spatial 1", packet(3, 1, 0, false), true),
            ("spatial 2 above target", packet(4, 2, 0, false), false),
            ("temporal 1 above target", packet(5, 0, 1, false), false),
            ("next frame", packet(6, 0, 0, false), true),
        ];

        let mut last_seq: Option<u16> = None;
        for (name, p, forwarded) in tests {
            consumer.send_rtp_packet(now, &p)?;
            let (packets, _, _, _) = split_actions(drain(&mut consumer));
            assert_eq!(packets.len(), forwarded as usize, "{name} failed");
            if let Some(out) = packets.first() {
                if let Some(last) = last_seq {
                    assert_eq!(out.header.sequence_number, last.wrapping_add(1), "{name} failed");
                }
                last_seq = Some(out.header.sequence_number);
            }
        }

        assert_eq!(
            consumer.current_layers(),
            Some(ConsumerLayers {
                spatial_layer: 1,
                temporal_layer: Some(0),
            })
        );

        Ok(())
    }

    #[test]
    fn test_svc_use_available_bitrate() -> Result<()> {
        let mut options = video_options(ConsumerType::Svc, &[SOURCE_SSRC], "L2T2");
        options.preferred_layers = None;
        let mut consumer = SvcConsumer::new(options, &ConsumerSettings::default(), None)?;
        let stream = MockSourceStream::new(SOURCE_SSRC, 10)
            .with_layers(2, 2)
            .with_layer_bitrate(0, 0, 100_000)
            .with_layer_bitrate(0, 1, 50_000)
            .with_layer_bitrate(1, 0, 200_000)
            .with_layer_bitrate(1, 1, 100_000);
        consumer.producer_new_rtp_stream(Rc::new(stream), SOURCE_SSRC)?;
        consumer.set_externally_managed_bitrate();
        consumer.core.transport_connected = true;
        consumer.user_on_transport_connected();

        let now = Instant::now();
        assert_eq!(consumer.bitrate_priority(), 2);

        let used = consumer.use_available_bitrate(now, 140_000);
        assert_eq!(consumer.provisional, Layers::new(0, 1));
        assert_eq!(used, 140_000);

        assert_eq!(consumer.increase_layer(now, 10_000), 0);

        consumer.apply_layers();
        assert_eq!(consumer.target_layers(), Layers::new(0, 1));

        Ok(())
    }
}
