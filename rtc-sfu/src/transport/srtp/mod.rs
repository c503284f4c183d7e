//! SRTP session pair.
//!
//! The cipher suites themselves are provided by the application through
//! [`SrtpSessionFactory`]; this module only tracks which session protects
//! which direction and when they are replaced.

pub mod profile;

pub use profile::{SrtpKeys, SrtpProtectionProfile};

use bytes::Bytes;
use log::{debug, error};
use shared::error::{Error, Result};

/// Direction a session protects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SrtpDirection {
    /// Protects packets sent by this side.
    Outbound,
    /// Unprotects packets received from the peer.
    Inbound,
}

/// One SRTP crypto context.
pub trait SrtpSession {
    fn encrypt_rtp(&mut self, plaintext: &[u8]) -> Result<Bytes>;
    fn decrypt_rtp(&mut self, encrypted: &[u8]) -> Result<Bytes>;
    fn encrypt_rtcp(&mut self, plaintext: &[u8]) -> Result<Bytes>;
    fn decrypt_rtcp(&mut self, encrypted: &[u8]) -> Result<Bytes>;
}

/// Creates crypto contexts once DTLS exported the keys.
pub trait SrtpSessionFactory {
    /// `master_key` is the master key followed by the master salt.
    fn create_session(
        &mut self,
        direction: SrtpDirection,
        profile: SrtpProtectionProfile,
        master_key: &[u8],
    ) -> Result<Box<dyn SrtpSession>>;
}

/// The inbound and outbound sessions of a transport.
///
/// Each direction is replaced independently: a failure to create one leaves
/// that direction without a session and the other one untouched.
#[derive(Default)]
pub struct SrtpSessionPair {
    outbound: Option<Box<dyn SrtpSession>>,
    inbound: Option<Box<dyn SrtpSession>>,
}

impl SrtpSessionPair {
    /// Drops the previous sessions, then creates new ones from `keys`.
    pub fn install(&mut self, factory: &mut dyn SrtpSessionFactory, keys: &SrtpKeys) {
        self.clear();

        match factory.create_session(
            SrtpDirection::Outbound,
            keys.profile,
            &keys.local_master_key,
        ) {
            Ok(session) => self.outbound = Some(session),
            Err(err) => error!("error creating outbound SRTP session: {err}"),
        }

        match factory.create_session(
            SrtpDirection::Inbound,
            keys.profile,
            &keys.remote_master_key,
        ) {
            Ok(session) => self.inbound = Some(session),
            Err(err) => error!("error creating inbound SRTP session: {err}"),
        }

        debug!(
            "SRTP sessions installed [profile:{}, outbound:{}, inbound:{}]",
            keys.profile,
            self.outbound.is_some(),
            self.inbound.is_some()
        );
    }

    /// Drops both sessions, outbound first.
    pub fn clear(&mut self) {
        self.outbound.take();
        self.inbound.take();
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn has_inbound(&self) -> bool {
        self.inbound.is_some()
    }

    pub fn encrypt_rtp(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        self.outbound
            .as_mut()
            .ok_or(Error::ErrSrtpNoSession)?
            .encrypt_rtp(plaintext)
    }

    pub fn encrypt_rtcp(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        self.outbound
            .as_mut()
            .ok_or(Error::ErrSrtpNoSession)?
            .encrypt_rtcp(plaintext)
    }

    pub fn decrypt_rtp(&mut self, encrypted: &[u8]) -> Result<Bytes> {
        self.inbound
            .as_mut()
            .ok_or(Error::ErrSrtpNoSession)?
            .decrypt_rtp(encrypted)
    }

    pub fn decrypt_rtcp(&mut self, encrypted: &[u8]) -> Result<Bytes> {
        self.inbound
            .as_mut()
            .ok_or(Error::ErrSrtpNoSession)?
            .decrypt_rtcp(encrypted)
    }
}
