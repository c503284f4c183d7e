//! DTLS role negotiation and handshake coordination.
//!
//! The record layer and handshake are provided by a [`DtlsEngine`]. The
//! [`DtlsTransport`] decides when the engine may run and with which role,
//! checks the remote certificate against the signaled fingerprint and turns
//! the exported keying material into [`SrtpKeys`].

pub mod fingerprint;
pub mod parameters;
pub mod role;
pub mod state;


pub use fingerprint::{DtlsFingerprint, FingerprintAlgorithm};
pub use parameters::DtlsParameters;
pub use role::DtlsRole;
pub use state::DtlsTransportState;

use crate::transport::ice::IceState;
use crate::transport::srtp::{SrtpKeys, SrtpProtectionProfile};
use bytes::BytesMut;
use log::{debug, trace, warn};
use shared::error::{Error, Result};
use std::collections::VecDeque;
use std::time::Instant;

/// Outcome reported by a [`DtlsEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtlsEngineEvent {
    HandshakeComplete {
        /// DER encoded certificate presented by the peer.
        remote_certificate: Vec<u8>,
        /// `None` if the peer did not negotiate `use_srtp`.
        srtp_profile: Option<SrtpProtectionProfile>,
        /// `EXTRACTOR-dtls_srtp` exporter output.
        keying_material: Vec<u8>,
    },
    ApplicationData(BytesMut),
    /// Fatal alert or handshake error.
    Failed(String),
    /// close_notify received.
    Closed,
}

/// DTLS 1.2 endpoint driven by the transport.
pub trait DtlsEngine {
    /// DER encoded local certificate, used for the local fingerprints.
    fn certificate(&self) -> &[u8];

    /// Starts the handshake with `role`, resetting any previous session.
    fn run(&mut self, now: Instant, role: DtlsRole) -> Result<()>;

    fn handle_read(&mut self, now: Instant, data: &[u8]) -> Result<()>;

    fn send_application_data(&mut self, data: &[u8]) -> Result<()>;

    /// Next record to put on the wire.
    fn poll_transmit(&mut self) -> Option<BytesMut>;

    fn poll_event(&mut self) -> Option<DtlsEngineEvent>;

    fn handle_timeout(&mut self, now: Instant) -> Result<()>;

    fn poll_timeout(&self) -> Option<Instant>;

    /// Queues a close_notify alert if a session exists.
    fn close(&mut self) -> Result<()>;
}

/// Notification of the [`DtlsTransport`] to the transport pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DtlsEvent {
    StateChange(DtlsTransportState),
    /// Always queued right before `StateChange(Connected)`.
    SrtpKeys(SrtpKeys),
    ApplicationData(BytesMut),
}

pub(crate) struct DtlsTransport {
    engine: Box<dyn DtlsEngine>,
    state: DtlsTransportState,
    /// Role resolved by `connect()`.
    local_role: Option<DtlsRole>,
    /// Role the engine currently runs with.
    engine_role: Option<DtlsRole>,
    remote_fingerprint: Option<DtlsFingerprint>,
    local_fingerprints: Vec<DtlsFingerprint>,
    answering_role: DtlsRole,
    srtp_protection_profiles: Vec<SrtpProtectionProfile>,
    disable_fingerprint_verification: bool,
    events: VecDeque<DtlsEvent>,
}

impl DtlsTransport {
    pub(crate) fn new(
        engine: Box<dyn DtlsEngine>,
        answering_role: DtlsRole,
        srtp_protection_profiles: Vec<SrtpProtectionProfile>,
        disable_fingerprint_verification: bool,
    ) -> Self {
        let local_fingerprints = FingerprintAlgorithm::ALL
            .iter()
            .map(|algorithm| DtlsFingerprint::of(*algorithm, engine.certificate()))
            .collect();

        Self {
            engine,
            state: DtlsTransportState::New,
            local_role: None,
            engine_role: None,
            remote_fingerprint: None,
            local_fingerprints,
            answering_role,
            srtp_protection_profiles,
            disable_fingerprint_verification,
            events: VecDeque::new(),
        }
    }

    pub(crate) fn state(&self) -> DtlsTransportState {
        self.state
    }

    pub(crate) fn local_role(&self) -> Option<DtlsRole> {
        self.local_role
    }

    pub(crate) fn local_fingerprints(&self) -> &[DtlsFingerprint] {
        &self.local_fingerprints
    }

    /// Validates the remote parameters and resolves the local role. May only
    /// succeed once.
    pub(crate) fn connect(&mut self, remote: &DtlsParameters) -> Result<DtlsRole> {
        if self.remote_fingerprint.is_some() {
            return Err(Error::ErrDtlsConnectAlreadyCalled);
        }

        let fingerprint = remote
            .fingerprints
            .first()
            .ok_or(Error::ErrDtlsNoRemoteFingerprint)?;
        fingerprint.validate()?;

        let local_role = DtlsRole::answer(remote.role, self.answering_role);
        debug!(
            "remote DTLS role {:?} resolved to local role {}",
            remote.role, local_role
        );

        self.remote_fingerprint = Some(fingerprint.clone());
        self.local_role = Some(local_role);

        Ok(local_role)
    }

    /// Starts the engine once a local role is known and ICE has a usable
    /// tuple. Does nothing if the engine already runs with that role.
    pub(crate) fn may_run(&mut self, now: Instant, ice_state: IceState) -> Result<()> {
        let Some(local_role) = self.local_role else {
            return Ok(());
        };
        if self.engine_role == Some(local_role) || !ice_state.is_connected() {
            return Ok(());
        }

        debug!("running DTLS transport as {local_role}");
        self.engine_role = Some(local_role);
        self.state_change(DtlsTransportState::Connecting);
        self.engine.run(now, local_role)?;
        self.process_engine_events();

        Ok(())
    }

    pub(crate) fn handle_read(&mut self, now: Instant, data: &[u8]) -> Result<()> {
        if !self.state.accepts_records() {
            trace!("ignoring DTLS record in state {}", self.state);
            return Ok(());
        }

        let result = self.engine.handle_read(now, data);
        self.process_engine_events();
        result
    }

    pub(crate) fn send_application_data(&mut self, data: &[u8]) -> Result<()> {
        if self.state != DtlsTransportState::Connected {
            return Err(Error::ErrDtlsTransportNotConnected);
        }
        self.engine.send_application_data(data)
    }

    pub(crate) fn poll_transmit(&mut self) -> Option<BytesMut> {
        self.engine.poll_transmit()
    }

    pub(crate) fn poll_event(&mut self) -> Option<DtlsEvent> {
        self.events.pop_front()
    }

    pub(crate) fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if !self.state.accepts_records() {
            return Ok(());
        }

        let result = self.engine.handle_timeout(now);
        self.process_engine_events();
        result
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        if self.state.accepts_records() {
            self.engine.poll_timeout()
        } else {
            None
        }
    }

    /// Sends close_notify if a session may exist. No state event is queued.
    pub(crate) fn close(&mut self) -> Result<()> {
        let result = if self.state.accepts_records() {
            self.engine.close()
        } else {
            Ok(())
        };
        self.state = DtlsTransportState::Closed;
        result
    }

    fn process_engine_events(&mut self) {
        while let Some(event) = self.engine.poll_event() {
            match event {
                DtlsEngineEvent::HandshakeComplete {
                    remote_certificate,
                    srtp_profile,
                    keying_material,
                } => {
                    if let Err(err) =
                        self.handshake_complete(&remote_certificate, srtp_profile, &keying_material)
                    {
                        warn!("DTLS handshake rejected: {err}");
                        self.state_change(DtlsTransportState::Failed);
                    }
                }
                DtlsEngineEvent::ApplicationData(data) => {
                    if self.state == DtlsTransportState::Connected {
                        self.events.push_back(DtlsEvent::ApplicationData(data));
                    } else {
                        trace!("ignoring DTLS application data in state {}", self.state);
                    }
                }
                DtlsEngineEvent::Failed(reason) => {
                    warn!("DTLS failed: {reason}");
                    self.state_change(DtlsTransportState::Failed);
                }
                DtlsEngineEvent::Closed => {
                    debug!("DTLS remotely closed");
                    self.state_change(DtlsTransportState::Closed);
                }
            }
        }
    }

    fn handshake_complete(
        &mut self,
        remote_certificate: &[u8],
        srtp_profile: Option<SrtpProtectionProfile>,
        keying_material: &[u8],
    ) -> Result<()> {
        if !self.disable_fingerprint_verification {
            let fingerprint = self
                .remote_fingerprint
                .as_ref()
                .ok_or(Error::ErrDtlsNoRemoteFingerprint)?;
            if !fingerprint.matches(remote_certificate)? {
                return Err(Error::ErrDtlsFingerprintMismatch);
            }
        }

        let profile = srtp_profile
            .ok_or_else(|| Error::ErrSrtpUnsupportedProfile("none".to_owned()))?;
        if !self.srtp_protection_profiles.contains(&profile) {
            return Err(Error::ErrSrtpUnsupportedProfile(profile.to_string()));
        }

        let is_client = self.engine_role == Some(DtlsRole::Client);
        let keys = SrtpKeys::from_keying_material(profile, keying_material, is_client)?;

        self.events.push_back(DtlsEvent::SrtpKeys(keys));
        self.state_change(DtlsTransportState::Connected);

        Ok(())
    }

    fn state_change(&mut self, state: DtlsTransportState) {
        if self.state == state {
            return;
        }
        debug!("DTLS state {} -> {}", self.state, state);
        self.state = state;
        self.events.push_back(DtlsEvent::StateChange(state));
    }
}
