//! The transport towards one receiver.
//!
//! A [`WebRtcTransport`] owns the ICE-Lite agent, the DTLS transport, the
//! SRTP session pair, the optional SCTP association and every consumer
//! forwarding media to the receiver. It performs no I/O: datagrams, source
//! packets, producer notifications and timers are all pushed in through
//! [`sansio::Protocol`], and whatever must be sent or reported is polled out.
//!
//! ```text
//! Raw Bytes -> Demuxer -> ICE -> DTLS -> SCTP -> SRTP -> Forwarding -> Application
//! Application -> Forwarding -> SRTP -> SCTP -> DTLS -> ICE -> Demuxer -> Raw Bytes
//! ```
//!
//! # Examples
//!
//! ```ignore
//! use rtc_sfu::configuration::SettingEngine;
//! use rtc_sfu::WebRtcTransport;
//! use sansio::Protocol;
//!
//! let mut transport = WebRtcTransport::new(
//!     SettingEngine::default(),
//!     dtls_engine,
//!     srtp_session_factory,
//!     None,
//! )?;
//! let ice_parameters = transport.ice_parameters();
//! let dtls_parameters = transport.dtls_parameters();
//! // ... signal them, then with the answer of the peer:
//! transport.connect(&remote_dtls_parameters)?;
//!
//! transport.handle_read(datagram)?;
//! while let Some(transmit) = transport.poll_write() {
//!     socket.send_to(&transmit.message, transmit.transport.peer_addr)?;
//! }
//! while let Some(event) = transport.poll_event() {
//!     // ...
//! }
//! ```

pub mod dtls;
pub mod ice;
pub mod sctp;
pub mod srtp;

use crate::configuration::SettingEngine;
use crate::consumer::{Consumer, ConsumerLayers, ConsumerOptions, ConsumerStats, EncodingContext};
use crate::handler::PipelineContext;
use crate::handler::demuxer::DemuxerHandlerContext;
use crate::handler::dtls::DtlsHandlerContext;
use crate::handler::forwarding::ForwardingHandlerContext;
use crate::handler::ice::IceHandlerContext;
use crate::handler::sctp::SctpHandlerContext;
use crate::handler::srtp::SrtpHandlerContext;
use dtls::{DtlsEngine, DtlsParameters, DtlsRole, DtlsTransport, DtlsTransportState};
use ice::{IceLiteAgent, IceParameters, IceState};
use sctp::SctpAssociation;
use shared::error::{Error, Result};
use shared::util::{generate_ice_pwd, generate_ice_ufrag};
use shared::{FiveTuple, TransportContext};
use srtp::SrtpSessionFactory;
use std::time::Instant;

/// One ICE-Lite / DTLS / SRTP connection and the consumers sending media
/// over it.
pub struct WebRtcTransport {
    pub(crate) pipeline_context: PipelineContext,
    pub(crate) closed: bool,
}

impl WebRtcTransport {
    /// Creates a transport. ICE credentials are random unless fixed in the
    /// [`SettingEngine`]. The SCTP association is optional; without it DTLS
    /// application data is ignored.
    pub fn new(
        setting_engine: SettingEngine,
        dtls_engine: Box<dyn DtlsEngine>,
        srtp_session_factory: Box<dyn SrtpSessionFactory>,
        sctp_association: Option<Box<dyn SctpAssociation>>,
    ) -> Result<Self> {
        let remb = &setting_engine.remb;
        if remb.minimum_available_bitrate > remb.initial_available_bitrate {
            return Err(Error::ErrTransportInvalidRembBitrates(
                remb.initial_available_bitrate,
                remb.minimum_available_bitrate,
            ));
        }

        let (username_fragment, password) = setting_engine
            .ice_credentials
            .clone()
            .unwrap_or_else(|| (generate_ice_ufrag(), generate_ice_pwd()));
        let agent = IceLiteAgent::new(username_fragment, password);

        let dtls_transport = DtlsTransport::new(
            dtls_engine,
            setting_engine.answering_dtls_role,
            setting_engine.get_srtp_protection_profiles(),
            setting_engine.disable_certificate_fingerprint_verification,
        );

        let pipeline_context = PipelineContext::new(
            DemuxerHandlerContext::new(setting_engine.get_receive_mtu()),
            IceHandlerContext::new(agent),
            DtlsHandlerContext::new(dtls_transport),
            SctpHandlerContext::new(sctp_association),
            SrtpHandlerContext::new(srtp_session_factory),
            ForwardingHandlerContext::new(setting_engine),
        );

        Ok(Self {
            pipeline_context,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ErrTransportClosed)
        } else {
            Ok(())
        }
    }

    fn forwarding(&mut self) -> &mut ForwardingHandlerContext {
        &mut self.pipeline_context.forwarding_handler_context
    }

    /// Local ICE parameters to signal to the peer.
    pub fn ice_parameters(&self) -> IceParameters {
        self.pipeline_context.ice_handler_context.agent.parameters()
    }

    /// Local DTLS fingerprints and role. The role is `auto` until
    /// [`connect`](Self::connect) resolved it.
    pub fn dtls_parameters(&self) -> DtlsParameters {
        let dtls_transport = &self.pipeline_context.dtls_handler_context.dtls_transport;
        DtlsParameters {
            role: Some(dtls_transport.local_role().unwrap_or(DtlsRole::Auto)),
            fingerprints: dtls_transport.local_fingerprints().to_vec(),
        }
    }

    /// Applies the remote DTLS parameters and returns the local role. The
    /// handshake starts as soon as ICE is connected.
    pub fn connect(&mut self, remote: &DtlsParameters) -> Result<DtlsRole> {
        self.ensure_open()?;

        let dtls_handler_context = &mut self.pipeline_context.dtls_handler_context;
        let local_role = dtls_handler_context.dtls_transport.connect(remote)?;
        dtls_handler_context.may_run_dtls_transport(Instant::now())?;

        Ok(local_role)
    }

    /// Replaces the ICE credentials. The previous ones keep working until
    /// the peer uses the new ones.
    pub fn restart_ice(&mut self) -> Result<IceParameters> {
        self.ensure_open()?;

        let agent = &mut self.pipeline_context.ice_handler_context.agent;
        agent.restart(generate_ice_ufrag(), generate_ice_pwd());
        Ok(agent.parameters())
    }

    /// Forgets a tuple, e.g. after its TCP connection closed.
    pub fn remove_tuple(&mut self, transport: &TransportContext) {
        self.pipeline_context
            .ice_handler_context
            .agent
            .remove_tuple(transport);
    }

    pub fn ice_state(&self) -> IceState {
        self.pipeline_context.ice_handler_context.agent.state()
    }

    pub fn ice_selected_tuple(&self) -> Option<FiveTuple> {
        self.pipeline_context
            .ice_handler_context
            .agent
            .selected_tuple()
            .map(FiveTuple::from)
    }

    pub fn dtls_state(&self) -> DtlsTransportState {
        self.pipeline_context
            .dtls_handler_context
            .dtls_transport
            .state()
    }

    /// ICE has a selected tuple and DTLS is connected.
    pub fn is_connected(&self) -> bool {
        self.pipeline_context.forwarding_handler_context.connected
    }

    /// Creates a consumer of `options.producer_id`. Source streams are
    /// attached afterwards through producer events.
    pub fn consume(&mut self, options: ConsumerOptions) -> Result<()> {
        self.ensure_open()?;
        self.forwarding().add_consumer(Instant::now(), options, None)
    }

    /// Like [`consume`](Self::consume), for layered consumers whose codec
    /// needs payload inspection to filter layers.
    pub fn consume_with_encoding_context(
        &mut self,
        options: ConsumerOptions,
        encoding_context: Box<dyn EncodingContext>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.forwarding()
            .add_consumer(Instant::now(), options, Some(encoding_context))
    }

    pub fn close_consumer(&mut self, consumer_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.forwarding()
            .remove_consumer(Instant::now(), consumer_id)
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<&Consumer> {
        self.pipeline_context
            .forwarding_handler_context
            .consumer(consumer_id)
    }

    pub fn consumer_ids(&self) -> Vec<String> {
        self.pipeline_context
            .forwarding_handler_context
            .consumers
            .iter()
            .map(|c| c.id().to_owned())
            .collect()
    }

    pub fn pause_consumer(&mut self, consumer_id: &str) -> Result<()> {
        self.with_consumer(consumer_id, Consumer::pause)
    }

    pub fn resume_consumer(&mut self, consumer_id: &str) -> Result<()> {
        self.with_consumer(consumer_id, Consumer::resume)
    }

    pub fn set_consumer_preferred_layers(
        &mut self,
        consumer_id: &str,
        layers: ConsumerLayers,
    ) -> Result<()> {
        self.with_consumer(consumer_id, |consumer| {
            consumer.inner_mut().set_preferred_layers(layers)
        })
    }

    pub fn request_consumer_key_frame(&mut self, consumer_id: &str) -> Result<()> {
        self.with_consumer(consumer_id, |consumer| {
            if consumer.is_active() {
                consumer.inner_mut().request_key_frames();
            }
        })
    }

    pub fn consumer_stats(&mut self, consumer_id: &str) -> Result<ConsumerStats> {
        let now = Instant::now();
        Ok(self.forwarding().consumer_mut(consumer_id)?.stats(now))
    }

    /// Runs `f` on a consumer, then dispatches what it queued.
    fn with_consumer<F>(&mut self, consumer_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Consumer),
    {
        self.ensure_open()?;

        let now = Instant::now();
        let forwarding = self.forwarding();
        f(forwarding.consumer_mut(consumer_id)?);
        forwarding.process_consumer_actions(now);
        Ok(())
    }
}
