use crate::bandwidth::{LayerAllocator, RembClient, distribute};
use crate::configuration::SettingEngine;
use crate::consumer::{
    Consumer, ConsumerAction, ConsumerOptions, ConsumerSettings, ConsumerType, EncodingContext,
    SendKind,
};
use crate::event::{EventInternal, ProducerEvent, ProducerEventKind, TransportEvent};
use crate::message::internal::{MessageInternal, RTPMessage, TaggedMessageInternal};
use crate::rtp_parameters::ABS_SEND_TIME_URI;
use crate::rtp_stream::{KeyFrameRequestKind, MediaPacket};
use crate::transport::dtls::DtlsTransportState;
use crate::transport::ice::IceState;
use log::{debug, trace, warn};
use rand::{Rng, rng};
use rtcp::packet::Packet as RtcpPacket;
use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::SourceDescription;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use shared::TransportContext;
use shared::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Generated RTCP is sent at least every `max_rtcp_interval`, more often the
/// more is sent: 360 / kbps seconds.
const RTCP_BANDWIDTH_FACTOR_MS: u64 = 360_000;

pub(crate) struct ForwardingHandlerContext {
    /// In creation order, which is also the order of equal priorities in the
    /// bandwidth distribution.
    pub(crate) consumers: Vec<Consumer>,
    pub(crate) media_ssrc_consumers: HashMap<u32, String>,
    pub(crate) rtx_ssrc_consumers: HashMap<u32, String>,
    pub(crate) remb_client: Option<RembClient>,

    pub(crate) consumer_settings: ConsumerSettings,
    pub(crate) setting_engine: SettingEngine,

    pub(crate) ice_state: IceState,
    pub(crate) dtls_state: DtlsTransportState,
    pub(crate) connected: bool,
    pub(crate) next_rtcp_at: Option<Instant>,

    pub(crate) read_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) write_outs: VecDeque<TaggedMessageInternal>,
    pub(crate) event_outs: VecDeque<EventInternal>,
}

impl ForwardingHandlerContext {
    pub(crate) fn new(setting_engine: SettingEngine) -> Self {
        Self {
            consumers: vec![],
            media_ssrc_consumers: HashMap::new(),
            rtx_ssrc_consumers: HashMap::new(),
            remb_client: None,

            consumer_settings: ConsumerSettings::from(&setting_engine),
            setting_engine,

            ice_state: IceState::New,
            dtls_state: DtlsTransportState::New,
            connected: false,
            next_rtcp_at: None,

            read_outs: VecDeque::new(),
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
        }
    }

    pub(crate) fn consumer(&self, consumer_id: &str) -> Option<&Consumer> {
        self.consumers.iter().find(|c| c.id() == consumer_id)
    }

    pub(crate) fn consumer_mut(&mut self, consumer_id: &str) -> Result<&mut Consumer> {
        self.consumers
            .iter_mut()
            .find(|c| c.id() == consumer_id)
            .ok_or_else(|| Error::ErrConsumerNotFound(consumer_id.to_owned()))
    }

    /// Creates a consumer, registers its ssrcs and hands it to the REMB
    /// client when layered and congestion feedback is negotiated.
    pub(crate) fn add_consumer(
        &mut self,
        now: Instant,
        options: ConsumerOptions,
        encoding_context: Option<Box<dyn EncodingContext>>,
    ) -> Result<()> {
        if self.consumer(&options.id).is_some() {
            return Err(Error::ErrConsumerAlreadyExists(options.id));
        }

        let mut consumer = match encoding_context {
            Some(encoding_context) => {
                Consumer::with_encoding_context(options, &self.consumer_settings, encoding_context)?
            }
            None => Consumer::new(options, &self.consumer_settings)?,
        };

        for ssrc in consumer.media_ssrcs().iter().chain(consumer.rtx_ssrcs()) {
            if self.media_ssrc_consumers.contains_key(ssrc)
                || self.rtx_ssrc_consumers.contains_key(ssrc)
            {
                return Err(Error::ErrConsumerSsrcInUse(*ssrc));
            }
        }

        let consumer_id = consumer.id().to_owned();
        for ssrc in consumer.media_ssrcs() {
            self.media_ssrc_consumers.insert(*ssrc, consumer_id.clone());
        }
        for ssrc in consumer.rtx_ssrcs() {
            self.rtx_ssrc_consumers.insert(*ssrc, consumer_id.clone());
        }

        let layered = matches!(
            consumer.consumer_type(),
            ConsumerType::Simulcast | ConsumerType::Svc
        );
        if layered {
            if self.remb_client.is_none() && self.is_remb_negotiated(&consumer) {
                debug!("enabling REMB client");
                self.remb_client = Some(RembClient::new(self.setting_engine.remb));
                for existing in self.consumers.iter_mut() {
                    if matches!(
                        existing.consumer_type(),
                        ConsumerType::Simulcast | ConsumerType::Svc
                    ) {
                        existing.inner_mut().set_externally_managed_bitrate();
                    }
                }
            }
            if self.remb_client.is_some() {
                consumer.inner_mut().set_externally_managed_bitrate();
            }
        }

        if self.connected {
            consumer.transport_connected();
        }

        debug!(
            "consumer created [consumerId:{}, producerId:{}, type:{}]",
            consumer_id,
            consumer.producer_id(),
            consumer.consumer_type()
        );
        self.consumers.push(consumer);
        self.process_consumer_actions(now);

        Ok(())
    }

    pub(crate) fn remove_consumer(&mut self, now: Instant, consumer_id: &str) -> Result<()> {
        let index = self
            .consumers
            .iter()
            .position(|c| c.id() == consumer_id)
            .ok_or_else(|| Error::ErrConsumerNotFound(consumer_id.to_owned()))?;
        let consumer = self.consumers.remove(index);

        self.media_ssrc_consumers.retain(|_, id| id != consumer_id);
        self.rtx_ssrc_consumers.retain(|_, id| id != consumer_id);
        debug!("consumer closed [consumerId:{consumer_id}]");

        if consumer.uses_externally_managed_bitrate() {
            self.distribute_available_bitrate(now);
            self.process_consumer_actions(now);
        }
        Ok(())
    }

    /// REMB needs `goog-remb` feedback on a codec and, unless disabled,
    /// the abs-send-time header extension.
    fn is_remb_negotiated(&self, consumer: &Consumer) -> bool {
        let rtp_parameters = consumer.rtp_parameters();
        let has_abs_send_time = rtp_parameters.header_extension_id(ABS_SEND_TIME_URI).is_some();
        (has_abs_send_time || !self.setting_engine.remb.require_abs_send_time)
            && rtp_parameters.has_feedback("goog-remb")
    }

    /// Runs `f` on every consumer forwarding `producer_id`.
    fn for_each_consumer_of<F>(&mut self, producer_id: &str, mut f: F)
    where
        F: FnMut(&mut Consumer),
    {
        for consumer in self
            .consumers
            .iter_mut()
            .filter(|c| c.producer_id() == producer_id)
        {
            f(consumer);
        }
    }

    pub(crate) fn handle_producer_event(&mut self, now: Instant, evt: ProducerEvent) {
        let ProducerEvent { producer_id, kind } = evt;
        trace!("producer event [producerId:{producer_id}, kind:{kind:?}]");

        match kind {
            ProducerEventKind::NewRtpStream {
                stream,
                mapped_ssrc,
            } => {
                self.for_each_consumer_of(&producer_id, |consumer| {
                    if let Err(err) = consumer
                        .inner_mut()
                        .producer_new_rtp_stream(stream.clone(), mapped_ssrc)
                    {
                        warn!(
                            "new rtp stream rejected [consumerId:{}]: {}",
                            consumer.id(),
                            err
                        );
                    }
                });
            }
            ProducerEventKind::RtpStreamScore {
                mapped_ssrc,
                score,
                previous_score,
            } => {
                self.for_each_consumer_of(&producer_id, |consumer| {
                    consumer
                        .inner_mut()
                        .producer_rtp_stream_score(mapped_ssrc, score, previous_score);
                });
            }
            ProducerEventKind::SenderReport { mapped_ssrc, first } => {
                self.for_each_consumer_of(&producer_id, |consumer| {
                    consumer
                        .inner_mut()
                        .producer_rtcp_sender_report(mapped_ssrc, first);
                });
            }
            ProducerEventKind::Pause => {
                self.for_each_consumer_of(&producer_id, Consumer::producer_paused);
            }
            ProducerEventKind::Resume => {
                self.for_each_consumer_of(&producer_id, Consumer::producer_resumed);
            }
            ProducerEventKind::Close => {
                self.for_each_consumer_of(&producer_id, Consumer::producer_closed);
                self.process_consumer_actions(now);

                let closed: Vec<String> = self
                    .consumers
                    .iter()
                    .filter(|c| c.producer_id() == producer_id)
                    .map(|c| c.id().to_owned())
                    .collect();
                for consumer_id in closed {
                    if let Err(err) = self.remove_consumer(now, &consumer_id) {
                        warn!("remove_consumer failed [consumerId:{consumer_id}]: {err}");
                    }
                }
            }
        }

        self.process_consumer_actions(now);
    }

    fn send_media(&mut self, now: Instant, producer_id: &str, packet: &MediaPacket) {
        self.for_each_consumer_of(producer_id, |consumer| {
            if let Err(err) = consumer.inner_mut().send_rtp_packet(now, packet) {
                warn!(
                    "send_rtp_packet failed [consumerId:{}]: {}",
                    consumer.id(),
                    err
                );
            }
        });
        self.process_consumer_actions(now);
    }

    /// Dispatches what consumers queued until nothing is left, running the
    /// bandwidth distribution whenever one of them asked for it.
    pub(crate) fn process_consumer_actions(&mut self, now: Instant) {
        loop {
            let mut actions = vec![];
            for consumer in self.consumers.iter_mut() {
                while let Some(action) = consumer.poll_action() {
                    actions.push((
                        consumer.id().to_owned(),
                        consumer.producer_id().to_owned(),
                        action,
                    ));
                }
            }
            if actions.is_empty() {
                break;
            }

            let mut need_bitrate_change = false;
            for (consumer_id, producer_id, action) in actions {
                match action {
                    ConsumerAction::SendRtp { packet, kind } => {
                        if let Some(remb_client) = self.remb_client.as_mut() {
                            if kind == SendKind::Probation {
                                remb_client.sent_probation_rtp_packet(now, &packet);
                            } else {
                                remb_client.sent_rtp_packet(now, &packet);
                                if kind == SendKind::Media && remb_client.is_probation_needed(now)
                                {
                                    let seq = packet.header.sequence_number;
                                    if let Ok(consumer) = self.consumer_mut(&consumer_id) {
                                        consumer.inner_mut().send_probation_packet(seq);
                                    }
                                }
                            }
                        }

                        self.write_outs.push_back(TaggedMessageInternal {
                            now,
                            transport: TransportContext::default(),
                            message: MessageInternal::Rtp(RTPMessage::Rtp(packet)),
                        });
                    }
                    ConsumerAction::Event(event) => {
                        self.event_outs.push_back(EventInternal::TransportEvent(
                            TransportEvent::Consumer { consumer_id, event },
                        ));
                    }
                    ConsumerAction::KeyFrameRequest { mapped_ssrc } => {
                        if !self.connected {
                            warn!(
                                "ignoring key frame request (transport not connected) [consumerId:{consumer_id}]"
                            );
                            continue;
                        }
                        self.event_outs.push_back(EventInternal::TransportEvent(
                            TransportEvent::KeyFrameRequested {
                                consumer_id,
                                producer_id,
                                mapped_ssrc,
                            },
                        ));
                    }
                    ConsumerAction::NeedBitrateChange => {
                        need_bitrate_change = true;
                    }
                }
            }

            if need_bitrate_change {
                self.distribute_available_bitrate(now);
            }
        }
    }

    /// Splits the REMB estimate across the consumers whose bitrate is managed
    /// by the transport.
    pub(crate) fn distribute_available_bitrate(&mut self, now: Instant) {
        let Some(remb_client) = self.remb_client.as_mut() else {
            return;
        };

        let total_priorities: u64 = self
            .consumers
            .iter()
            .map(|c| c.inner().bitrate_priority() as u64)
            .sum();
        if total_priorities == 0 {
            return;
        }

        let available_bitrate = remb_client.available_bitrate(now);
        remb_client.reschedule_next_event(now);

        let allocators: Vec<&mut dyn LayerAllocator> = self
            .consumers
            .iter_mut()
            .map(|c| c as &mut dyn LayerAllocator)
            .collect();
        let remaining = distribute(
            now,
            available_bitrate,
            allocators,
            self.setting_engine.layer_tuning.min_greedy_bitrate,
        );
        trace!("bitrate distributed [available:{available_bitrate}, remaining:{remaining}]");
    }

    /// Consumes the feedback addressed to consumers and returns the rest.
    fn receive_rtcp(
        &mut self,
        now: Instant,
        packets: Vec<Box<dyn RtcpPacket + Send + Sync>>,
    ) -> Vec<Box<dyn RtcpPacket + Send + Sync>> {
        let mut unhandled = vec![];

        for packet in packets {
            let any = packet.as_any();
            if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                self.receive_reception_reports(now, &rr.reports);
            } else if let Some(sr) = any.downcast_ref::<SenderReport>() {
                self.receive_reception_reports(now, &sr.reports);
                unhandled.push(packet);
            } else if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
                self.receive_key_frame_request(pli.media_ssrc, KeyFrameRequestKind::Pli);
            } else if let Some(fir) = any.downcast_ref::<FullIntraRequest>() {
                for entry in &fir.fir {
                    self.receive_key_frame_request(entry.ssrc, KeyFrameRequestKind::Fir);
                }
            } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                match self.consumer_by_media_ssrc(nack.media_ssrc) {
                    Some(consumer) => consumer.inner_mut().receive_nack(now, nack),
                    None => warn!("NACK for unknown ssrc {}", nack.media_ssrc),
                }
            } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
                self.receive_remb(now, remb.bitrate as u32);
            } else {
                unhandled.push(packet);
            }
        }

        self.process_consumer_actions(now);
        unhandled
    }

    fn consumer_by_media_ssrc(&mut self, ssrc: u32) -> Option<&mut Consumer> {
        let consumer_id = self.media_ssrc_consumers.get(&ssrc)?;
        self.consumers.iter_mut().find(|c| c.id() == consumer_id)
    }

    fn receive_reception_reports(&mut self, now: Instant, reports: &[ReceptionReport]) {
        for report in reports {
            if let Some(consumer) = self.consumer_by_media_ssrc(report.ssrc) {
                consumer.inner_mut().receive_rtcp_receiver_report(now, report);
            } else if !self.rtx_ssrc_consumers.contains_key(&report.ssrc) {
                warn!("receiver report for unknown ssrc {}", report.ssrc);
            }
        }
    }

    fn receive_key_frame_request(&mut self, ssrc: u32, kind: KeyFrameRequestKind) {
        match self.consumer_by_media_ssrc(ssrc) {
            Some(consumer) => {
                debug!("{kind:?} received [consumerId:{}]", consumer.id());
                consumer.inner_mut().receive_key_frame_request(kind);
            }
            None => warn!("{kind:?} for unknown ssrc {ssrc}"),
        }
    }

    fn receive_remb(&mut self, now: Instant, bitrate: u32) {
        let Some(remb_client) = self.remb_client.as_mut() else {
            trace!("ignoring REMB, no REMB client");
            return;
        };

        if let Some(available_bitrate) = remb_client.receive_remb_feedback(now, bitrate) {
            self.event_outs
                .push_back(EventInternal::TransportEvent(TransportEvent::AvailableBitrate(
                    available_bitrate,
                )));
            self.distribute_available_bitrate(now);
        }
    }

    /// Re-evaluates connectivity after an ICE or DTLS state change.
    fn update_connected(&mut self, now: Instant) {
        let connected =
            self.ice_state.is_connected() && self.dtls_state == DtlsTransportState::Connected;
        if connected == self.connected {
            return;
        }
        self.connected = connected;

        if connected {
            debug!("transport connected");
            for consumer in self.consumers.iter_mut() {
                consumer.transport_connected();
            }
            self.next_rtcp_at = Some(now + self.max_rtcp_interval() / 2);
        } else {
            debug!("transport disconnected");
            for consumer in self.consumers.iter_mut() {
                consumer.transport_disconnected();
            }
            self.next_rtcp_at = None;
        }

        self.process_consumer_actions(now);
    }

    fn max_rtcp_interval(&self) -> Duration {
        self.setting_engine.rtcp.video_interval
    }

    /// Sends a sender report and SDES for every consumer whose report
    /// interval elapsed and schedules the next round.
    fn send_rtcp(&mut self, now: Instant) {
        let mut rate = 0u64;
        for consumer in self.consumers.iter_mut() {
            let inner = consumer.inner_mut();
            rate += inner.transmission_rate(now) as u64;

            if let Some((report, chunk)) = inner.rtcp(now) {
                let packets: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![
                    Box::new(report),
                    Box::new(SourceDescription {
                        chunks: vec![chunk],
                    }),
                ];
                self.write_outs.push_back(TaggedMessageInternal {
                    now,
                    transport: TransportContext::default(),
                    message: MessageInternal::Rtp(RTPMessage::Rtcp(packets)),
                });
            }
        }

        let max_interval = self.max_rtcp_interval();
        let mut interval = max_interval;
        let rate_kbps = rate / 1000;
        if rate_kbps != 0 {
            interval = Duration::from_millis(RTCP_BANDWIDTH_FACTOR_MS / rate_kbps).min(max_interval);
        }
        // randomize within [0.5, 1.5]
        let factor = rng().random_range(5..=15) as f64 / 10.0;
        self.next_rtcp_at = Some(now + interval.mul_f64(factor));
    }
}

/// ForwardingHandler is the application end of the pipeline: it relays
/// producer media through the consumers and consumes the RTCP meant for them.
pub(crate) struct ForwardingHandler<'a> {
    ctx: &'a mut ForwardingHandlerContext,
}

impl<'a> ForwardingHandler<'a> {
    pub(crate) fn new(ctx: &'a mut ForwardingHandlerContext) -> Self {
        ForwardingHandler { ctx }
    }

    pub(crate) fn name(&self) -> &'static str {
        "ForwardingHandler"
    }
}

impl<'a> sansio::Protocol<TaggedMessageInternal, TaggedMessageInternal, EventInternal>
    for ForwardingHandler<'a>
{
    type Rout = TaggedMessageInternal;
    type Wout = TaggedMessageInternal;
    type Eout = EventInternal;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        match msg.message {
            MessageInternal::Rtp(RTPMessage::Rtcp(packets)) => {
                let unhandled = self.ctx.receive_rtcp(msg.now, packets);
                if !unhandled.is_empty() {
                    self.ctx.read_outs.push_back(TaggedMessageInternal {
                        now: msg.now,
                        transport: msg.transport,
                        message: MessageInternal::Rtp(RTPMessage::Rtcp(unhandled)),
                    });
                }
            }
            message @ MessageInternal::Rtp(RTPMessage::Rtp(_)) => {
                self.ctx.read_outs.push_back(TaggedMessageInternal {
                    now: msg.now,
                    transport: msg.transport,
                    message,
                });
            }
            _ => {
                trace!("drop unexpected message at forwarding handler");
            }
        }
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.ctx.read_outs.pop_front()
    }

    fn handle_write(&mut self, msg: TaggedMessageInternal) -> Result<()> {
        match msg.message {
            MessageInternal::Rtp(RTPMessage::Media {
                producer_id,
                packet,
            }) => {
                self.ctx.send_media(msg.now, &producer_id, &packet);
            }
            message => {
                self.ctx.write_outs.push_back(TaggedMessageInternal {
                    now: msg.now,
                    transport: msg.transport,
                    message,
                });
            }
        }
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.ctx.write_outs.pop_front()
    }

    fn handle_event(&mut self, evt: EventInternal) -> Result<()> {
        match evt {
            EventInternal::Producer(producer_event) => {
                self.ctx.handle_producer_event(Instant::now(), producer_event);
            }
            EventInternal::IceStateChange(state) => {
                self.ctx.ice_state = state;
                self.ctx.event_outs.push_back(evt);
                self.ctx.update_connected(Instant::now());
            }
            EventInternal::DtlsStateChange(state) => {
                self.ctx.dtls_state = state;
                self.ctx.event_outs.push_back(evt);
                self.ctx.update_connected(Instant::now());
            }
            evt => {
                self.ctx.event_outs.push_back(evt);
            }
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.ctx.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.ctx.next_rtcp_at.is_some_and(|at| at <= now) {
            self.ctx.send_rtcp(now);
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        self.ctx.next_rtcp_at
    }

    fn close(&mut self) -> Result<()> {
        self.ctx.remb_client = None;
        self.ctx.next_rtcp_at = None;
        self.ctx.connected = false;
        self.ctx.media_ssrc_consumers.clear();
        self.ctx.rtx_ssrc_consumers.clear();
        self.ctx.consumers.clear();
        Ok(())
    }
}
