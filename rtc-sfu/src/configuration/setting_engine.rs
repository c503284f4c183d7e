//! Advanced configuration engine for SFU transports.
//!
//! The `SettingEngine` provides low-level control over ICE credentials, DTLS
//! negotiation, RTCP timing, retransmission storage and the empirical
//! constants of layer selection and congestion control.
//!
//! # Examples
//!
//! ```
//! use rtc_sfu::configuration::SettingEngine;
//! use std::time::Duration;
//!
//! let mut setting_engine = SettingEngine::default();
//!
//! // Keep more packets around for NACK on lossy links
//! setting_engine.set_send_buffer_size(1024).unwrap();
//! setting_engine.set_max_retransmission_age(Duration::from_secs(3));
//!
//! // Start conservatively until the first REMB arrives
//! setting_engine.set_remb_bitrates(300_000, 30_000).unwrap();
//! ```

use crate::transport::dtls::role::DtlsRole;
use crate::transport::srtp::profile::SrtpProtectionProfile;
use shared::error::{Error, Result};
use std::time::Duration;

/// Default receive MTU, large enough for any UDP datagram on common links.
pub(crate) const RECEIVE_MTU: usize = 1460;

/// Empirical constants used to turn an offered bitrate into a layer choice.
///
/// The offered bitrate is first adjusted by the loss the receiver reports:
/// below `low_loss_percentage` it is boosted by `low_loss_boost`, above
/// `high_loss_percentage` it shrinks by `high_loss_factor * loss / 100`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct LayerTuning {
    /// Score from which a source stream is considered healthy.
    pub good_score: u8,
    pub low_loss_percentage: f64,
    pub low_loss_boost: f64,
    pub high_loss_percentage: f64,
    pub high_loss_factor: f64,
    /// Remaining bitrate below which the greedy distribution pass stops.
    pub min_greedy_bitrate: u32,
}

impl Default for LayerTuning {
    fn default() -> Self {
        Self {
            good_score: 7,
            low_loss_percentage: 2.0,
            low_loss_boost: 1.08,
            high_loss_percentage: 10.0,
            high_loss_factor: 0.5,
            min_greedy_bitrate: 2000,
        }
    }
}

impl LayerTuning {
    /// Bitrate a consumer may plan with given the loss of its output stream.
    pub fn virtual_bitrate(&self, bitrate: u32, loss_percentage: f64) -> u32 {
        let bitrate = bitrate as f64;
        let virtual_bitrate = if loss_percentage < self.low_loss_percentage {
            self.low_loss_boost * bitrate
        } else if loss_percentage > self.high_loss_percentage {
            (1.0 - self.high_loss_factor * (loss_percentage / 100.0)) * bitrate
        } else {
            bitrate
        };
        virtual_bitrate as u32
    }
}

/// REMB client timing and bounds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RembSettings {
    pub initial_available_bitrate: u32,
    pub minimum_available_bitrate: u32,
    /// Minimum time between two bitrate notifications.
    pub event_interval: Duration,
    /// Silence after which the estimate is reset to the initial bitrate.
    pub max_elapsed: Duration,
    /// Window after a reset during which lower estimates are ignored.
    pub initial_duration: Duration,
    /// Only enable the REMB client when abs-send-time is negotiated.
    pub require_abs_send_time: bool,
}

impl Default for RembSettings {
    fn default() -> Self {
        Self {
            initial_available_bitrate: 600_000,
            minimum_available_bitrate: 30_000,
            event_interval: Duration::from_millis(2000),
            max_elapsed: Duration::from_millis(5000),
            initial_duration: Duration::from_millis(8000),
            require_abs_send_time: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Rtcp {
    pub(crate) audio_interval: Duration,
    pub(crate) video_interval: Duration,
}

impl Default for Rtcp {
    fn default() -> Self {
        Self {
            audio_interval: Duration::from_millis(5000),
            video_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Retransmission {
    pub(crate) send_buffer_size: u16,
    pub(crate) max_age: Duration,
}

impl Default for Retransmission {
    fn default() -> Self {
        Self {
            send_buffer_size: 512,
            max_age: Duration::from_millis(2000),
        }
    }
}

/// SettingEngine allows influencing behavior in ways that are not
/// supported by the control plane API.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct SettingEngine {
    pub(crate) ice_credentials: Option<(String, String)>,
    pub(crate) answering_dtls_role: DtlsRole,
    pub(crate) disable_certificate_fingerprint_verification: bool,
    pub(crate) srtp_protection_profiles: Vec<SrtpProtectionProfile>,
    pub(crate) receive_mtu: usize,
    pub(crate) layer_tuning: LayerTuning,
    pub(crate) remb: RembSettings,
    pub(crate) rtcp: Rtcp,
    pub(crate) retransmission: Retransmission,
}

impl SettingEngine {
    /// Returns the configured receive MTU, or the default if not set.
    pub(crate) fn get_receive_mtu(&self) -> usize {
        if self.receive_mtu != 0 {
            self.receive_mtu
        } else {
            RECEIVE_MTU
        }
    }

    /// Allowed SRTP protection profiles, all supported ones when unset.
    pub(crate) fn get_srtp_protection_profiles(&self) -> Vec<SrtpProtectionProfile> {
        if !self.srtp_protection_profiles.is_empty() {
            self.srtp_protection_profiles.clone()
        } else {
            vec![
                SrtpProtectionProfile::AeadAes256Gcm,
                SrtpProtectionProfile::AeadAes128Gcm,
                SrtpProtectionProfile::Aes128CmHmacSha1_80,
                SrtpProtectionProfile::Aes128CmHmacSha1_32,
            ]
        }
    }

    /// Uses fixed ICE credentials instead of random ones. Mostly useful for
    /// tests and for deterministic signaling.
    pub fn set_ice_credentials(&mut self, username_fragment: String, password: String) {
        self.ice_credentials = Some((username_fragment, password));
    }

    /// Sets the local DTLS role used when the remote peer declares `auto`
    /// or nothing. Only `Client` and `Server` are accepted.
    pub fn set_answering_dtls_role(&mut self, role: DtlsRole) -> Result<()> {
        if role != DtlsRole::Client && role != DtlsRole::Server {
            return Err(Error::ErrDtlsInvalidRole(role.to_string()));
        }

        self.answering_dtls_role = role;
        Ok(())
    }

    /// Skips the remote certificate fingerprint check after the handshake.
    pub fn disable_certificate_fingerprint_verification(&mut self, is_disabled: bool) {
        self.disable_certificate_fingerprint_verification = is_disabled;
    }

    /// Restricts the SRTP protection profiles accepted from the DTLS handshake.
    pub fn set_srtp_protection_profiles(&mut self, profiles: Vec<SrtpProtectionProfile>) {
        self.srtp_protection_profiles = profiles;
    }

    /// Datagrams larger than `receive_mtu` are dropped on read.
    pub fn set_receive_mtu(&mut self, receive_mtu: usize) {
        self.receive_mtu = receive_mtu;
    }

    pub fn set_layer_tuning(&mut self, layer_tuning: LayerTuning) {
        self.layer_tuning = layer_tuning;
    }

    /// Initial and minimum outgoing bitrate assumed by the REMB client.
    pub fn set_remb_bitrates(&mut self, initial: u32, minimum: u32) -> Result<()> {
        if minimum > initial {
            return Err(Error::ErrTransportInvalidRembBitrates(initial, minimum));
        }

        self.remb.initial_available_bitrate = initial;
        self.remb.minimum_available_bitrate = minimum;
        Ok(())
    }

    pub fn set_remb_settings(&mut self, remb: RembSettings) {
        self.remb = remb;
    }

    /// Maximum interval between two sender reports per media kind.
    pub fn set_rtcp_intervals(&mut self, audio: Duration, video: Duration) {
        self.rtcp.audio_interval = audio;
        self.rtcp.video_interval = video;
    }

    /// Number of sent packets kept for NACK, a power of two.
    pub fn set_send_buffer_size(&mut self, size: u16) -> Result<()> {
        if !size.is_power_of_two() {
            return Err(Error::ErrInvalidSendBufferSize(size));
        }

        self.retransmission.send_buffer_size = size;
        Ok(())
    }

    /// Packets older than this (by RTP timestamp) are never retransmitted.
    pub fn set_max_retransmission_age(&mut self, max_age: Duration) {
        self.retransmission.max_age = max_age;
    }
}
