//! Forwarding consumers.
//!
//! A consumer turns the packets of one producer into a single continuous
//! output stream for one receiver. Three strategies exist:
//!
//! * [`SimpleConsumer`]: one source encoding, ssrc and sequence rewrite only.
//! * [`SimulcastConsumer`]: one source encoding per spatial layer; picks a
//!   layer, switches on key frames and keeps timestamps continuous across
//!   switches using sender report alignment.
//! * [`SvcConsumer`]: one source encoding carrying every layer; filters
//!   layers through an [`EncodingContext`].
//!
//! Consumers never perform I/O. Every decision is queued as a
//! `ConsumerAction` which the owning transport drains after each call.

pub mod encoding_context;
pub mod event;
pub mod layers;
pub mod options;
pub(crate) mod seq_manager;
pub mod simple;
pub mod simulcast;
pub mod svc;

#[cfg(test)]
pub(crate) mod test_utils;

pub use encoding_context::{EncodingContext, LayeredEncodingContext, PayloadAction};
pub use event::{ConsumerEvent, ConsumerScore, SendKind};
pub use layers::ConsumerLayers;
pub use options::{ConsumerOptions, ConsumerType};
pub use simple::SimpleConsumer;
pub use simulcast::SimulcastConsumer;
pub use svc::SvcConsumer;

pub(crate) use event::ConsumerAction;

use crate::configuration::{LayerTuning, SettingEngine};
use crate::rtp_parameters::{
    can_be_key_frame, MediaKind, RtpEncodingParameters, RtpParameters, ScalabilityMode,
};
use crate::rtp_stream::{
    KeyFrameRequestKind, MediaPacket, RtpStreamSend, RtpStreamSendParams, RtpStreamSendStats,
    SourceStream,
};
use log::{debug, trace};
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::SourceDescriptionChunk;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use rtp::packet::Packet;
use serde::Serialize;
use shared::error::{Error, Result};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Consumer related subset of the [`SettingEngine`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConsumerSettings {
    pub(crate) layer_tuning: LayerTuning,
    pub(crate) send_buffer_size: u16,
    pub(crate) max_retransmission_age: Duration,
    pub(crate) audio_rtcp_interval: Duration,
    pub(crate) video_rtcp_interval: Duration,
}

impl From<&SettingEngine> for ConsumerSettings {
    fn from(setting_engine: &SettingEngine) -> Self {
        Self {
            layer_tuning: setting_engine.layer_tuning,
            send_buffer_size: setting_engine.retransmission.send_buffer_size,
            max_retransmission_age: setting_engine.retransmission.max_age,
            audio_rtcp_interval: setting_engine.rtcp.audio_interval,
            video_rtcp_interval: setting_engine.rtcp.video_interval,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from(&SettingEngine::default())
    }
}

/// Serializable snapshot of a consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStats {
    pub id: String,
    pub producer_id: String,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub paused: bool,
    pub producer_paused: bool,
    pub score: ConsumerScore,
    pub preferred_layers: Option<ConsumerLayers>,
    pub current_layers: Option<ConsumerLayers>,
    pub rtp_stream: RtpStreamSendStats,
}

/// State and bookkeeping shared by every consumer variant.
pub(crate) struct ConsumerCore {
    pub(crate) id: String,
    pub(crate) producer_id: String,
    pub(crate) kind: MediaKind,
    pub(crate) consumer_type: ConsumerType,
    pub(crate) rtp_parameters: RtpParameters,
    pub(crate) consumable_rtp_encodings: Vec<RtpEncodingParameters>,
    pub(crate) supported_payload_types: HashSet<u8>,
    pub(crate) media_ssrcs: Vec<u32>,
    pub(crate) rtx_ssrcs: Vec<u32>,
    pub(crate) scalability: ScalabilityMode,

    pub(crate) paused: bool,
    pub(crate) producer_paused: bool,
    pub(crate) producer_closed: bool,
    pub(crate) transport_connected: bool,
    pub(crate) externally_managed_bitrate: bool,

    pub(crate) max_rtcp_interval: Duration,
    pub(crate) last_rtcp_sent_at: Option<Instant>,
    pub(crate) settings: ConsumerSettings,

    actions: VecDeque<ConsumerAction>,
}

impl ConsumerCore {
    /// Validates the options shared by every variant.
    pub(crate) fn new(options: ConsumerOptions, settings: &ConsumerSettings) -> Result<Self> {
        let rtp_parameters = options.rtp_parameters;

        if rtp_parameters.encodings.is_empty() {
            return Err(Error::ErrConsumerEmptyEncodings);
        }
        for encoding in &rtp_parameters.encodings {
            if encoding.ssrc == 0 {
                return Err(Error::ErrConsumerInvalidSsrc);
            }
            if let Some(rtx) = &encoding.rtx {
                if rtx.ssrc == 0 {
                    return Err(Error::ErrConsumerInvalidRtxSsrc);
                }
            }
        }

        if options.consumable_rtp_encodings.is_empty() {
            return Err(Error::ErrConsumerEmptyConsumableEncodings);
        }
        if options
            .consumable_rtp_encodings
            .iter()
            .any(|encoding| encoding.ssrc == 0)
        {
            return Err(Error::ErrConsumerInvalidConsumableSsrc);
        }

        if rtp_parameters.header_extensions.iter().any(|ext| ext.id == 0) {
            return Err(Error::ErrConsumerInvalidHeaderExtensionId);
        }

        let supported_payload_types: HashSet<u8> = rtp_parameters
            .media_codecs()
            .map(|codec| codec.payload_type)
            .collect();
        if supported_payload_types.is_empty() {
            return Err(Error::ErrConsumerNoMediaCodecs);
        }

        let scalability = rtp_parameters.encodings[0].scalability()?;

        let media_ssrcs = rtp_parameters.encodings.iter().map(|e| e.ssrc).collect();
        let rtx_ssrcs = rtp_parameters
            .encodings
            .iter()
            .filter_map(|e| e.rtx.map(|rtx| rtx.ssrc))
            .collect();

        let max_rtcp_interval = match options.kind {
            MediaKind::Audio => settings.audio_rtcp_interval,
            MediaKind::Video => settings.video_rtcp_interval,
        };

        Ok(Self {
            id: options.id,
            producer_id: options.producer_id,
            kind: options.kind,
            consumer_type: options.consumer_type,
            rtp_parameters,
            consumable_rtp_encodings: options.consumable_rtp_encodings,
            supported_payload_types,
            media_ssrcs,
            rtx_ssrcs,
            scalability,
            paused: options.paused,
            producer_paused: options.producer_paused,
            producer_closed: false,
            transport_connected: false,
            externally_managed_bitrate: false,
            max_rtcp_interval,
            last_rtcp_sent_at: None,
            settings: settings.clone(),
            actions: VecDeque::new(),
        })
    }

    /// Active means connected, not paused, producer not paused nor closed.
    pub(crate) fn is_active(&self) -> bool {
        self.transport_connected && !self.paused && !self.producer_paused && !self.producer_closed
    }

    pub(crate) fn is_payload_type_supported(&self, payload_type: u8) -> bool {
        self.supported_payload_types.contains(&payload_type)
    }

    /// Output ssrc, taken from the first negotiated encoding.
    pub(crate) fn ssrc(&self) -> u32 {
        self.rtp_parameters.encodings[0].ssrc
    }

    /// Builds the send stream tracker for the negotiated encoding.
    pub(crate) fn create_rtp_stream(&self) -> Result<RtpStreamSend> {
        let encoding = &self.rtp_parameters.encodings[0];
        let media_codec = self
            .rtp_parameters
            .codec_for_encoding(encoding)
            .ok_or(Error::ErrConsumerNoMediaCodecs)?;

        debug!(
            "creating send stream [ssrc:{}, payloadType:{}, consumerId:{}]",
            encoding.ssrc, media_codec.payload_type, self.id
        );

        let mut params = RtpStreamSendParams {
            ssrc: encoding.ssrc,
            payload_type: media_codec.payload_type,
            mime_type: media_codec.mime_type.clone(),
            clock_rate: media_codec.clock_rate,
            cname: self.rtp_parameters.rtcp.cname.clone().unwrap_or_default(),
            use_in_band_fec: media_codec.parameter_is_one("useinbandfec"),
            use_dtx: media_codec.parameter_is_one("usedtx") || encoding.dtx,
            use_nack: media_codec.has_feedback("nack", ""),
            use_pli: media_codec.has_feedback("nack", "pli"),
            use_fir: media_codec.has_feedback("ccm", "fir"),
            spatial_layers: self.scalability.spatial_layers,
            temporal_layers: self.scalability.temporal_layers,
            ..Default::default()
        };

        if let (Some(rtx_codec), Some(rtx)) = (
            self.rtp_parameters.rtx_codec_for_encoding(encoding),
            encoding.rtx,
        ) {
            params.rtx_ssrc = Some(rtx.ssrc);
            params.rtx_payload_type = Some(rtx_codec.payload_type);
        }

        let mut rtp_stream = RtpStreamSend::new(
            params,
            self.settings.send_buffer_size,
            self.settings.max_retransmission_age,
        )?;

        if self.paused || self.producer_paused {
            rtp_stream.pause();
        }

        Ok(rtp_stream)
    }

    pub(crate) fn can_be_key_frame(&self) -> bool {
        self.rtp_parameters
            .codec_for_encoding(&self.rtp_parameters.encodings[0])
            .map(|codec| can_be_key_frame(&codec.mime_type))
            .unwrap_or(false)
    }

    pub(crate) fn emit(&mut self, event: ConsumerEvent) {
        self.actions.push_back(ConsumerAction::Event(event));
    }

    pub(crate) fn send(&mut self, packet: Packet, kind: SendKind) {
        self.actions.push_back(ConsumerAction::SendRtp { packet, kind });
    }

    /// Queues a key frame request towards the producer. Audio never asks.
    pub(crate) fn request_key_frame_for(&mut self, mapped_ssrc: u32) {
        if self.kind != MediaKind::Video {
            return;
        }
        trace!(
            "key frame requested [mappedSsrc:{}, consumerId:{}]",
            mapped_ssrc,
            self.id
        );
        self.actions
            .push_back(ConsumerAction::KeyFrameRequest { mapped_ssrc });
    }

    pub(crate) fn need_bitrate_change(&mut self) {
        self.actions.push_back(ConsumerAction::NeedBitrateChange);
    }

    pub(crate) fn poll_action(&mut self) -> Option<ConsumerAction> {
        self.actions.pop_front()
    }
}

/// Capability interface implemented by every consumer variant.
///
/// Shared behavior lives in the provided methods; variants override what
/// their strategy changes.
pub(crate) trait ForwardingConsumer {
    fn core(&self) -> &ConsumerCore;
    fn core_mut(&mut self) -> &mut ConsumerCore;
    fn rtp_stream(&self) -> &RtpStreamSend;
    fn rtp_stream_mut(&mut self) -> &mut RtpStreamSend;

    fn is_active(&self) -> bool {
        self.core().is_active()
    }

    fn producer_new_rtp_stream(
        &mut self,
        stream: Rc<dyn SourceStream>,
        mapped_ssrc: u32,
    ) -> Result<()>;

    fn producer_rtp_stream_score(&mut self, mapped_ssrc: u32, score: u8, previous_score: u8);

    fn producer_rtcp_sender_report(&mut self, mapped_ssrc: u32, first: bool);

    fn set_externally_managed_bitrate(&mut self) {
        self.core_mut().externally_managed_bitrate = true;
    }

    /// Share of the available bitrate this consumer asks for. 0 opts out of
    /// the distribution.
    fn bitrate_priority(&self) -> u16 {
        0
    }

    fn use_available_bitrate(&mut self, _now: Instant, _bitrate: u32) -> u32 {
        0
    }

    fn increase_layer(&mut self, _now: Instant, _bitrate: u32) -> u32 {
        0
    }

    fn apply_layers(&mut self) {}

    fn preferred_layers(&self) -> Option<ConsumerLayers> {
        None
    }

    fn current_layers(&self) -> Option<ConsumerLayers> {
        None
    }

    fn set_preferred_layers(&mut self, _layers: ConsumerLayers) {}

    fn send_rtp_packet(&mut self, now: Instant, packet: &MediaPacket) -> Result<()>;

    fn send_probation_packet(&mut self, seq: u16) {
        if let Some(packet) = self.rtp_stream_mut().probation_packet(seq) {
            self.core_mut().send(packet, SendKind::Probation);
        }
    }

    /// Sender report and SDES chunk when the report interval elapsed.
    fn rtcp(&mut self, now: Instant) -> Option<(SenderReport, SourceDescriptionChunk)> {
        if let Some(last) = self.core().last_rtcp_sent_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed.mul_f64(1.15) < self.core().max_rtcp_interval {
                return None;
            }
        }

        let report = self.rtp_stream_mut().sender_report(now)?;
        let chunk = self.rtp_stream().sdes_chunk();
        self.core_mut().last_rtcp_sent_at = Some(now);

        Some((report, chunk))
    }

    fn receive_nack(&mut self, now: Instant, nack: &TransportLayerNack) {
        if !self.is_active() {
            return;
        }

        let packets = self.rtp_stream_mut().receive_nack(now, nack);
        for packet in packets {
            self.core_mut().send(packet, SendKind::Retransmission);
        }
    }

    fn receive_key_frame_request(&mut self, kind: KeyFrameRequestKind) {
        self.rtp_stream_mut().receive_key_frame_request(kind);

        if self.is_active() {
            self.request_key_frame();
        }
    }

    fn receive_rtcp_receiver_report(&mut self, now: Instant, report: &ReceptionReport) {
        if self.rtp_stream_mut().receive_rtcp_receiver_report(now, report) {
            self.on_rtp_stream_score();
        }
    }

    /// The output stream score changed.
    fn on_rtp_stream_score(&mut self) {
        self.emit_score();
    }

    fn transmission_rate(&mut self, now: Instant) -> u32 {
        if !self.is_active() {
            return 0;
        }
        self.rtp_stream_mut().bitrate(now)
    }

    /// Key frame request for the layer currently forwarded.
    fn request_key_frame(&mut self);

    /// Explicit key frame request from the application.
    fn request_key_frames(&mut self) {
        self.request_key_frame();
    }

    fn user_on_transport_connected(&mut self);
    fn user_on_transport_disconnected(&mut self);
    fn user_on_paused(&mut self);
    fn user_on_resumed(&mut self);

    fn score(&self) -> ConsumerScore;

    fn emit_score(&mut self) {
        let score = self.score();
        self.core_mut().emit(ConsumerEvent::Score(score));
    }
}

/// A forwarding consumer, one variant per [`ConsumerType`].
pub enum Consumer {
    Simple(SimpleConsumer),
    Simulcast(SimulcastConsumer),
    Svc(SvcConsumer),
}

impl Consumer {
    pub(crate) fn new(options: ConsumerOptions, settings: &ConsumerSettings) -> Result<Self> {
        Ok(match options.consumer_type {
            ConsumerType::Simple => Consumer::Simple(SimpleConsumer::new(options, settings)?),
            ConsumerType::Simulcast => {
                Consumer::Simulcast(SimulcastConsumer::new(options, settings, None)?)
            }
            ConsumerType::Svc => Consumer::Svc(SvcConsumer::new(options, settings, None)?),
        })
    }

    /// Creates a layered consumer with a codec specific encoding context.
    pub(crate) fn with_encoding_context(
        options: ConsumerOptions,
        settings: &ConsumerSettings,
        encoding_context: Box<dyn EncodingContext>,
    ) -> Result<Self> {
        Ok(match options.consumer_type {
            ConsumerType::Simple => Consumer::Simple(SimpleConsumer::new(options, settings)?),
            ConsumerType::Simulcast => Consumer::Simulcast(SimulcastConsumer::new(
                options,
                settings,
                Some(encoding_context),
            )?),
            ConsumerType::Svc => {
                Consumer::Svc(SvcConsumer::new(options, settings, Some(encoding_context))?)
            }
        })
    }

    pub(crate) fn inner(&self) -> &dyn ForwardingConsumer {
        match self {
            Consumer::Simple(c) => c,
            Consumer::Simulcast(c) => c,
            Consumer::Svc(c) => c,
        }
    }

    pub(crate) fn inner_mut(&mut self) -> &mut dyn ForwardingConsumer {
        match self {
            Consumer::Simple(c) => c,
            Consumer::Simulcast(c) => c,
            Consumer::Svc(c) => c,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner().core().id
    }

    pub fn producer_id(&self) -> &str {
        &self.inner().core().producer_id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner().core().kind
    }

    pub fn consumer_type(&self) -> ConsumerType {
        self.inner().core().consumer_type
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.inner().core().rtp_parameters
    }

    pub fn is_active(&self) -> bool {
        self.inner().is_active()
    }

    pub fn is_paused(&self) -> bool {
        self.inner().core().paused
    }

    pub fn is_producer_paused(&self) -> bool {
        self.inner().core().producer_paused
    }

    pub fn media_ssrcs(&self) -> &[u32] {
        &self.inner().core().media_ssrcs
    }

    pub fn rtx_ssrcs(&self) -> &[u32] {
        &self.inner().core().rtx_ssrcs
    }

    pub fn score(&self) -> ConsumerScore {
        self.inner().score()
    }

    pub fn preferred_layers(&self) -> Option<ConsumerLayers> {
        self.inner().preferred_layers()
    }

    pub fn current_layers(&self) -> Option<ConsumerLayers> {
        self.inner().current_layers()
    }

    pub(crate) fn uses_externally_managed_bitrate(&self) -> bool {
        self.inner().core().externally_managed_bitrate
    }

    pub fn pause(&mut self) {
        let inner = self.inner_mut();
        if inner.core().paused {
            return;
        }

        let was_active = inner.is_active();
        inner.core_mut().paused = true;
        debug!("consumer paused [consumerId:{}]", inner.core().id);

        if was_active {
            inner.user_on_paused();
        }
    }

    pub fn resume(&mut self) {
        let inner = self.inner_mut();
        if !inner.core().paused {
            return;
        }

        inner.core_mut().paused = false;
        debug!("consumer resumed [consumerId:{}]", inner.core().id);

        if inner.is_active() {
            inner.user_on_resumed();
        }
    }

    pub(crate) fn producer_paused(&mut self) {
        let inner = self.inner_mut();
        if inner.core().producer_paused {
            return;
        }

        let was_active = inner.is_active();
        inner.core_mut().producer_paused = true;
        debug!("producer paused [consumerId:{}]", inner.core().id);

        if was_active {
            inner.user_on_paused();
        }

        inner.core_mut().emit(ConsumerEvent::ProducerPause);
    }

    pub(crate) fn producer_resumed(&mut self) {
        let inner = self.inner_mut();
        if !inner.core().producer_paused {
            return;
        }

        inner.core_mut().producer_paused = false;
        debug!("producer resumed [consumerId:{}]", inner.core().id);

        if inner.is_active() {
            inner.user_on_resumed();
        }

        inner.core_mut().emit(ConsumerEvent::ProducerResume);
    }

    /// The owner is expected to drop the consumer right after this call.
    pub(crate) fn producer_closed(&mut self) {
        let core = self.inner_mut().core_mut();
        core.producer_closed = true;
        debug!("producer closed [consumerId:{}]", core.id);
        core.emit(ConsumerEvent::ProducerClose);
    }

    pub(crate) fn transport_connected(&mut self) {
        let inner = self.inner_mut();
        if inner.core().transport_connected {
            return;
        }

        inner.core_mut().transport_connected = true;
        debug!("transport connected [consumerId:{}]", inner.core().id);
        inner.user_on_transport_connected();
    }

    pub(crate) fn transport_disconnected(&mut self) {
        let inner = self.inner_mut();
        if !inner.core().transport_connected {
            return;
        }

        inner.core_mut().transport_connected = false;
        debug!("transport disconnected [consumerId:{}]", inner.core().id);
        inner.user_on_transport_disconnected();
    }

    pub(crate) fn poll_action(&mut self) -> Option<ConsumerAction> {
        self.inner_mut().core_mut().poll_action()
    }

    pub fn stats(&mut self, now: Instant) -> ConsumerStats {
        let inner = self.inner_mut();
        let rtp_stream = inner.rtp_stream_mut().stats(now);
        let core = inner.core();

        ConsumerStats {
            id: core.id.clone(),
            producer_id: core.producer_id.clone(),
            consumer_type: core.consumer_type,
            paused: core.paused,
            producer_paused: core.producer_paused,
            score: inner.score(),
            preferred_layers: inner.preferred_layers(),
            current_layers: inner.current_layers(),
            rtp_stream,
        }
    }
}
