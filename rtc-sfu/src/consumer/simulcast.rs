use super::encoding_context::{EncodingContext, LayeredEncodingContext, PayloadAction};
use super::layers::{ConsumerLayers, Layers};
use super::seq_manager::SeqManager;
use super::{
    ConsumerCore, ConsumerEvent, ConsumerOptions, ConsumerScore, ConsumerSettings,
    ForwardingConsumer, SendKind,
};
use crate::rtp_stream::{is_ts_higher_than, MediaPacket, RtpStreamSend, SourceStream, MAX_SCORE};
use log::{debug, trace, warn};
use shared::error::{Error, Result};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

/// Packets forwarded with a pending extra offset before the map is cleared.
const TS_EXTRA_OFFSET_MAX_PACKETS: u32 = 200;
/// Packets forwarded before the extra offset map is cleared regardless.
const TS_EXTRA_OFFSET_MAX_TOTAL: u32 = 500;

/// Forwards one of several simulcast encodings, switching between them on
/// key frames while presenting a single continuous stream.
pub struct SimulcastConsumer {
    core: ConsumerCore,
    rtp_stream: RtpStreamSend,
    /// Source stream per spatial layer, in consumable encoding order.
    producer_streams: Vec<Option<Rc<dyn SourceStream>>>,
    mapped_ssrc_spatial_layer: HashMap<u32, i16>,
    encoding_context: Box<dyn EncodingContext>,
    seq_manager: SeqManager,
    sync_required: bool,

    preferred: Layers,
    target: Layers,
    provisional: Layers,
    current_spatial_layer: i16,

    ts_reference_spatial_layer: i16,
    ts_offset: u32,
    ts_extra_offsets: HashMap<u32, u32>,
    ts_extra_offset_packet_count: u32,
}

impl SimulcastConsumer {
    pub(crate) fn new(
        options: ConsumerOptions,
        settings: &ConsumerSettings,
        encoding_context: Option<Box<dyn EncodingContext>>,
    ) -> Result<Self> {
        let preferred_layers = options.preferred_layers;
        let core = ConsumerCore::new(options, settings)?;

        let consumables = core.consumable_rtp_encodings.len();
        if consumables <= 1 {
            return Err(Error::ErrConsumerInvalidConsumableEncodingsCount(
                consumables,
            ));
        }
        if core.scalability.spatial_layers as usize != consumables {
            return Err(Error::ErrConsumerSpatialLayersMismatch(
                core.scalability.spatial_layers,
                consumables,
            ));
        }

        let mapped_ssrc_spatial_layer = core
            .consumable_rtp_encodings
            .iter()
            .enumerate()
            .map(|(idx, encoding)| (encoding.ssrc, idx as i16))
            .collect();

        let preferred = Layers::preferred(
            preferred_layers,
            core.scalability.spatial_layers,
            core.scalability.temporal_layers,
        );

        // Every simulcast stream is a single spatial layer.
        let encoding_context = encoding_context.unwrap_or_else(|| {
            Box::new(LayeredEncodingContext::new(
                1,
                core.scalability.temporal_layers,
            ))
        });

        let rtp_stream = core.create_rtp_stream()?;

        Ok(Self {
            core,
            rtp_stream,
            producer_streams: vec![None; consumables],
            mapped_ssrc_spatial_layer,
            encoding_context,
            seq_manager: SeqManager::new(),
            sync_required: false,
            preferred,
            target: Layers::NONE,
            provisional: Layers::NONE,
            current_spatial_layer: -1,
            ts_reference_spatial_layer: -1,
            ts_offset: 0,
            ts_extra_offsets: HashMap::new(),
            ts_extra_offset_packet_count: 0,
        })
    }

    pub(crate) fn target_layers(&self) -> Layers {
        self.target
    }

    pub(crate) fn ts_reference_spatial_layer(&self) -> i16 {
        self.ts_reference_spatial_layer
    }

    fn spatial_layer_for(&self, mapped_ssrc: u32) -> Result<i16> {
        self.mapped_ssrc_spatial_layer
            .get(&mapped_ssrc)
            .copied()
            .ok_or(Error::ErrConsumerUnknownMappedSsrc(mapped_ssrc))
    }

    /// Source stream of a spatial layer, `None` for `-1`, out of range or
    /// not yet received.
    fn producer_stream(&self, spatial_layer: i16) -> Option<&Rc<dyn SourceStream>> {
        usize::try_from(spatial_layer)
            .ok()
            .and_then(|idx| self.producer_streams.get(idx))
            .and_then(Option::as_ref)
    }

    fn producer_score(&self, spatial_layer: i16) -> u8 {
        self.producer_stream(spatial_layer)
            .map(|stream| stream.score())
            .unwrap_or(0)
    }

    /// A layer is a valid switch target when there is no timestamp reference
    /// yet, it is the reference, or both it and the reference have a sender
    /// report to align timestamps with.
    fn can_switch_to_spatial_layer(&self, spatial_layer: i16) -> bool {
        if self.ts_reference_spatial_layer == -1
            || spatial_layer == self.ts_reference_spatial_layer
        {
            return true;
        }

        let has_sender_report = |layer: i16| {
            self.producer_stream(layer)
                .and_then(|stream| stream.sender_report())
                .is_some()
        };

        has_sender_report(self.ts_reference_spatial_layer) && has_sender_report(spatial_layer)
    }

    /// Temporal layer to use at `spatial_layer`: preferred at the preferred
    /// spatial layer, all of them below it, the base one above it.
    fn temporal_layer_for(&self, spatial_layer: i16) -> i16 {
        if spatial_layer == self.preferred.spatial {
            self.preferred.temporal
        } else if spatial_layer < self.preferred.spatial {
            self.rtp_stream.temporal_layers() as i16 - 1
        } else {
            0
        }
    }

    /// Best layers given source health alone. `None` when they equal the
    /// current target.
    fn recalculate_target_layers(&self) -> Option<Layers> {
        let good_score = self.core.settings.layer_tuning.good_score;
        let mut new_target = Layers::NONE;
        let mut max_producer_score = 0u8;

        for idx in 0..self.producer_streams.len() {
            let spatial_layer = idx as i16;
            let producer_score = self.producer_score(spatial_layer);

            if producer_score == 0 {
                continue;
            }
            if !self.can_switch_to_spatial_layer(spatial_layer) {
                continue;
            }
            if producer_score < max_producer_score && producer_score < good_score {
                continue;
            }

            new_target.spatial = spatial_layer;
            max_producer_score = producer_score;

            if spatial_layer >= self.preferred.spatial && producer_score >= good_score {
                break;
            }
        }

        if !new_target.is_none() {
            new_target.temporal = self.temporal_layer_for(new_target.spatial);
        }

        (new_target != self.target).then_some(new_target)
    }

    fn may_change_layers(&mut self, force: bool) {
        let Some(new_target) = self.recalculate_target_layers() else {
            return;
        };

        // Under external management the temporal layer follows the bitrate,
        // so only a spatial change is worth a redistribution.
        if self.core.externally_managed_bitrate {
            if new_target.spatial != self.target.spatial || force {
                self.core.need_bitrate_change();
            }
        } else {
            self.update_target_layers(new_target);
        }
    }

    fn update_target_layers(&mut self, new_target: Layers) {
        if !new_target.is_none() && self.ts_reference_spatial_layer == -1 {
            debug!(
                "using spatial layer {} as RTP timestamp reference [consumerId:{}]",
                new_target.spatial, self.core.id
            );
            self.ts_reference_spatial_layer = new_target.spatial;
        }

        if new_target.is_none() {
            self.target = Layers::NONE;
            self.current_spatial_layer = -1;
            self.encoding_context.set_target_temporal_layer(-1);
            self.encoding_context.set_current_temporal_layer(-1);

            debug!(
                "target layers changed [spatial:-1, temporal:-1, consumerId:{}]",
                self.core.id
            );
            self.emit_layers_change();
            return;
        }

        self.target = new_target;

        if self.target.spatial == self.current_spatial_layer {
            self.encoding_context
                .set_target_temporal_layer(self.target.temporal);
        }

        debug!(
            "target layers changed [spatial:{}, temporal:{}, consumerId:{}]",
            self.target.spatial, self.target.temporal, self.core.id
        );

        if self.target.spatial != self.current_spatial_layer {
            self.request_key_frame_for_layer(self.target.spatial);
        }
    }

    fn request_key_frame_for_layer(&mut self, spatial_layer: i16) {
        if self.producer_stream(spatial_layer).is_none() {
            return;
        }
        let mapped_ssrc = self.core.consumable_rtp_encodings[spatial_layer as usize].ssrc;
        self.core.request_key_frame_for(mapped_ssrc);
    }

    fn emit_layers_change(&mut self) {
        let layers = self.current_layers();
        self.core.emit(ConsumerEvent::LayersChange(layers));
    }

    /// Offset mapping timestamps of `spatial_layer` onto the reference
    /// layer's timeline using the NTP time of both sender reports.
    fn sync_ts_offset(&self, spatial_layer: i16) -> u32 {
        if spatial_layer == self.ts_reference_spatial_layer {
            return 0;
        }

        let reference = self
            .producer_stream(self.ts_reference_spatial_layer)
            .and_then(|stream| stream.sender_report());
        let current = self
            .producer_stream(spatial_layer)
            .and_then(|stream| stream.sender_report());

        let (Some(reference), Some(current)) = (reference, current) else {
            warn!(
                "missing sender report for timestamp sync [spatialLayer:{}, consumerId:{}]",
                spatial_layer, self.core.id
            );
            return 0;
        };

        let diff_ms = current.ntp_ms as i64 - reference.ntp_ms as i64;
        let diff_ts = diff_ms * self.rtp_stream.clock_rate() as i64 / 1000;
        let new_ts = current.rtp_timestamp.wrapping_sub(diff_ts as u32);

        new_ts.wrapping_sub(reference.rtp_timestamp)
    }

    /// Output timestamp with the extra offset that keeps it above the
    /// highest timestamp sent, cleared after enough packets.
    fn apply_ts_extra_offset(&mut self, input_ts: u32, timestamp: u32) -> u32 {
        if self.ts_extra_offsets.is_empty() {
            return timestamp;
        }

        let max_ts = self.rtp_stream.max_packet_ts();
        let extra = match self.ts_extra_offsets.get(&input_ts) {
            Some(&extra) => {
                trace!(
                    "ts extra offset mapping found [ts in:{}, ts out:{}, extra:{}]",
                    input_ts,
                    timestamp,
                    extra
                );
                extra
            }
            None if is_ts_higher_than(max_ts, timestamp) => {
                let extra = max_ts.wrapping_sub(timestamp).wrapping_add(1);
                self.ts_extra_offsets.insert(input_ts, extra);
                trace!(
                    "ts extra offset generated [ts in:{}, ts out:{}, extra:{}]",
                    input_ts,
                    timestamp,
                    extra
                );
                extra
            }
            None => 0,
        };

        self.ts_extra_offset_packet_count += 1;
        if (extra != 0 && self.ts_extra_offset_packet_count > TS_EXTRA_OFFSET_MAX_PACKETS)
            || self.ts_extra_offset_packet_count > TS_EXTRA_OFFSET_MAX_TOTAL
        {
            trace!("cleaning ts extra offset map");
            self.ts_extra_offsets.clear();
            self.ts_extra_offset_packet_count = 0;
        }

        timestamp.wrapping_add(extra)
    }
}

impl ForwardingConsumer for SimulcastConsumer {
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
        self.core.is_active() && self.producer_streams.iter().any(Option::is_some)
    }

    fn producer_new_rtp_stream(
        &mut self,
        stream: Rc<dyn SourceStream>,
        mapped_ssrc: u32,
    ) -> Result<()> {
        let spatial_layer = self.spatial_layer_for(mapped_ssrc)?;
        self.producer_streams[spatial_layer as usize] = Some(stream);

        if self.is_active() {
            self.may_change_layers(false);
        }

        Ok(())
    }

    fn producer_rtp_stream_score(&mut self, mapped_ssrc: u32, score: u8, previous_score: u8) {
        if self.spatial_layer_for(mapped_ssrc).ok() == Some(self.current_spatial_layer) {
            self.emit_score();
        }

        // Under external management only a dead or reborn stream matters.
        if self.core.is_active()
            && (!self.core.externally_managed_bitrate || score == 0 || previous_score == 0)
        {
            self.may_change_layers(false);
        }
    }

    fn producer_rtcp_sender_report(&mut self, mapped_ssrc: u32, first: bool) {
        if !first {
            return;
        }
        debug!("first sender report [mappedSsrc:{}]", mapped_ssrc);

        // No switch is possible until the current stream has a report too.
        let current_has_report = self
            .producer_stream(self.current_spatial_layer)
            .and_then(|stream| stream.sender_report())
            .is_some();
        if !current_has_report {
            return;
        }

        if self.is_active() {
            self.may_change_layers(false);
        }
    }

    fn bitrate_priority(&self) -> u16 {
        if !self.core.is_active() {
            return 0;
        }

        let mut priority_spatial_layer = -1i16;
        for idx in 0..self.producer_streams.len() {
            let spatial_layer = idx as i16;
            if spatial_layer > self.preferred.spatial && priority_spatial_layer != -1 {
                break;
            }
            if self.producer_score(spatial_layer) == 0 {
                continue;
            }
            priority_spatial_layer = spatial_layer;
        }

        // Still ask for a share so that the distribution can unset layers.
        if priority_spatial_layer == -1 {
            return 1;
        }

        (priority_spatial_layer + 1) as u16
    }

    fn use_available_bitrate(&mut self, now: Instant, bitrate: u32) -> u32 {
        self.provisional = Layers::NONE;

        if !self.core.is_active() {
            return 0;
        }

        let tuning = self.core.settings.layer_tuning;
        let virtual_bitrate = tuning.virtual_bitrate(bitrate, self.rtp_stream.loss_percentage());

        let mut provisional = Layers::NONE;
        let mut used_bitrate = 0u32;
        let mut max_producer_score = 0u8;

        'scan: for idx in 0..self.producer_streams.len() {
            let spatial_layer = idx as i16;
            let Some(stream) = self.producer_stream(spatial_layer) else {
                continue;
            };
            let producer_score = stream.score();

            if producer_score == 0 {
                continue;
            }
            if !self.can_switch_to_spatial_layer(spatial_layer) {
                continue;
            }
            if producer_score < max_producer_score && producer_score < tuning.good_score {
                continue;
            }

            for temporal_layer in 0..stream.temporal_layers() as i16 {
                let required_bitrate = stream.bitrate(now, 0, temporal_layer as u8);

                trace!(
                    "testing layers {}:{} [virtualBitrate:{}, requiredBitrate:{}]",
                    spatial_layer,
                    temporal_layer,
                    virtual_bitrate,
                    required_bitrate
                );

                // Inactive layer, try the next spatial layer.
                if required_bitrate == 0 {
                    break;
                }
                if required_bitrate > virtual_bitrate {
                    break 'scan;
                }

                provisional = Layers::new(spatial_layer, temporal_layer);
                used_bitrate = required_bitrate;
                max_producer_score = producer_score;

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
        if !self.core.is_active() {
            return 0;
        }
        if self.provisional == self.preferred {
            return 0;
        }

        let tuning = self.core.settings.layer_tuning;
        let virtual_bitrate = tuning.virtual_bitrate(bitrate, self.rtp_stream.loss_percentage());

        let mut candidate: Option<(Layers, u32)> = None;

        'scan: for idx in 0..self.producer_streams.len() {
            let spatial_layer = idx as i16;
            if spatial_layer < self.provisional.spatial {
                continue;
            }
            let Some(stream) = self.producer_stream(spatial_layer) else {
                continue;
            };
            if stream.score() < tuning.good_score {
                continue;
            }
            if !self.can_switch_to_spatial_layer(spatial_layer) {
                continue;
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

                let required_bitrate = stream.layer_bitrate(now, 0, temporal_layer as u8);
                if required_bitrate == 0 {
                    break;
                }

                candidate = Some((Layers::new(spatial_layer, temporal_layer), required_bitrate));
                break 'scan;
            }

            if spatial_layer >= self.preferred.spatial {
                break;
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

        if required_bitrate <= bitrate {
            required_bitrate
        } else {
            bitrate
        }
    }

    fn apply_layers(&mut self) {
        let provisional = std::mem::take(&mut self.provisional);

        if !self.core.is_active() {
            return;
        }

        if provisional != self.target {
            self.update_target_layers(provisional);
        }
    }

    fn preferred_layers(&self) -> Option<ConsumerLayers> {
        self.preferred.into()
    }

    fn current_layers(&self) -> Option<ConsumerLayers> {
        Layers::new(
            self.current_spatial_layer,
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
        if !self.is_active() || self.target.temporal == -1 {
            return Ok(());
        }

        if !self.core.is_payload_type_supported(packet.payload_type()) {
            trace!(
                "payload type not supported [payloadType:{}]",
                packet.payload_type()
            );
            return Ok(());
        }

        let spatial_layer = self.spatial_layer_for(packet.ssrc())?;

        // The packet we wait for to complete a pending switch.
        if self.current_spatial_layer != self.target.spatial
            && spatial_layer == self.target.spatial
        {
            if !packet.key_frame {
                return Ok(());
            }

            self.current_spatial_layer = self.target.spatial;
            self.encoding_context
                .set_target_temporal_layer(self.target.temporal);
            self.encoding_context
                .set_current_temporal_layer(packet.temporal_layer as i16);

            self.rtp_stream.reset_score(MAX_SCORE, false);

            self.emit_layers_change();
            self.emit_score();

            self.sync_required = true;
        }

        if spatial_layer != self.current_spatial_layer {
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

            self.ts_offset = self.sync_ts_offset(spatial_layer);
            self.ts_extra_offsets.clear();
            self.ts_extra_offset_packet_count = 0;

            // The key frame may be older than the last packet sent on the
            // previous layer.
            let out_ts = packet.timestamp().wrapping_sub(self.ts_offset);
            let max_ts = self.rtp_stream.max_packet_ts();
            if self.rtp_stream.has_sent() && !is_ts_higher_than(out_ts, max_ts) {
                let extra = max_ts.wrapping_sub(out_ts).wrapping_add(1);
                self.ts_extra_offsets.insert(packet.timestamp(), extra);

                warn!(
                    "ts extra offset needed [ts in:{}, ts out:{}, ts max out:{}, ts offset:{}]",
                    packet.timestamp(),
                    out_ts,
                    max_ts,
                    self.ts_offset
                );
            }

            self.encoding_context.sync_required();
            self.sync_required = false;
        }

        let previous_temporal_layer = self.encoding_context.current_temporal_layer();

        let payload = match self.encoding_context.process_packet(packet) {
            PayloadAction::Drop => {
                self.seq_manager.drop(packet.sequence_number());
                return Ok(());
            }
            PayloadAction::Forward => None,
            PayloadAction::Rewrite(payload) => Some(payload),
        };

        if previous_temporal_layer != self.encoding_context.current_temporal_layer() {
            self.emit_layers_change();
        }

        let timestamp = packet.timestamp().wrapping_sub(self.ts_offset);
        let timestamp = self.apply_ts_extra_offset(packet.timestamp(), timestamp);

        let Some(seq) = self.seq_manager.input(packet.sequence_number()) else {
            return Ok(());
        };

        let out = packet.rewrite(self.core.ssrc(), seq, timestamp, payload);

        if is_sync_packet {
            debug!(
                "sending sync packet [ssrc:{}, seq:{}, ts:{}] from original [ssrc:{}, seq:{}, ts:{}]",
                out.header.ssrc,
                out.header.sequence_number,
                out.header.timestamp,
                packet.ssrc(),
                packet.sequence_number(),
                packet.timestamp()
            );
        }

        if self.rtp_stream.receive_packet(now, &out) {
            self.core.send(out, SendKind::Media);
        } else {
            warn!(
                "failed to send packet [ssrc:{}, seq:{}, ts:{}] from original [ssrc:{}, seq:{}, ts:{}]",
                out.header.ssrc,
                out.header.sequence_number,
                out.header.timestamp,
                packet.ssrc(),
                packet.sequence_number(),
                packet.timestamp()
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
        self.request_key_frame_for_layer(self.current_spatial_layer);
    }

    /// Asks for a key frame on the target layer and, if different, on the
    /// layer still being forwarded.
    fn request_key_frames(&mut self) {
        let target = self.target.spatial;
        let current = self.current_spatial_layer;

        self.request_key_frame_for_layer(target);
        if current != target {
            self.request_key_frame_for_layer(current);
        }
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
        ConsumerScore {
            score: self.rtp_stream.score(),
            producer_score: self.producer_score(self.current_spatial_layer),
            producer_scores: (0..self.producer_streams.len())
                .map(|idx| self.producer_score(idx as i16))
                .collect(),
        }
    }
}
