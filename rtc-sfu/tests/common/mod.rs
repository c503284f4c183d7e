#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use rtc_sfu::WebRtcTransport;
use rtc_sfu::configuration::SettingEngine;
use rtc_sfu::consumer::{ConsumerOptions, ConsumerType};
use rtc_sfu::event::TransportEvent;
use rtc_sfu::rtp_parameters::{
    MediaKind, RtcpFeedback, RtcpParameters, RtpCodecParameters, RtpEncodingParameters,
    RtpParameters,
};
use rtc_sfu::rtp_stream::{MediaPacket, SenderReportInfo, SourceStream};
use rtc_sfu::transport::dtls::{
    DtlsEngine, DtlsEngineEvent, DtlsFingerprint, DtlsParameters, DtlsRole, FingerprintAlgorithm,
};
use rtc_sfu::transport::sctp::SctpAssociation;
use rtc_sfu::transport::srtp::{
    SrtpDirection, SrtpProtectionProfile, SrtpSession, SrtpSessionFactory,
};
use sansio::Protocol;
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportMessage};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;
use stun::agent::TransactionId;
use stun::attributes::*;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::Username;

pub const LOCAL_UFRAG: &str = "sfuufrag";
pub const LOCAL_PWD: &str = "sfupasswordsfupasswordsfu";

pub const LOCAL_CERTIFICATE: &[u8] = b"local certificate";
pub const REMOTE_CERTIFICATE: &[u8] = b"remote certificate";

pub const DTLS_HANDSHAKE: u8 = 22;
pub const DTLS_ALERT: u8 = 21;
pub const DTLS_APPLICATION_DATA: u8 = 23;

/// Appended by the mock outbound session, stripped by the inbound one.
pub const SRTP_AUTH_TAG: [u8; 10] = [0xAB; 10];

pub const VP8_PT: u8 = 101;
pub const OPUS_PT: u8 = 100;

/// Ordered record of what the mocks were asked to do.
pub type Log = Rc<RefCell<Vec<String>>>;

pub fn init_log() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init()
        .ok();
}

pub fn tuple(port: u16) -> TransportContext {
    let local: SocketAddr = "10.0.0.1:40000".parse().unwrap();
    let peer: SocketAddr = format!("192.168.1.2:{port}").parse().unwrap();
    TransportContext::udp(local, peer)
}

pub fn datagram(transport: TransportContext, data: &[u8]) -> TaggedBytesMut {
    TransportMessage {
        now: Instant::now(),
        transport,
        message: BytesMut::from(data),
    }
}

/// DTLS record with a full 13 byte header.
pub fn dtls_record(content_type: u8, payload: &[u8]) -> BytesMut {
    let mut record = BytesMut::with_capacity(13 + payload.len());
    record.extend_from_slice(&[content_type, 0xfe, 0xfd, 0, 0, 0, 0, 0, 0, 0, 0]);
    record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    record.extend_from_slice(payload);
    record
}

/// Binding request from the controlling peer, signed with the local
/// password.
pub fn binding_request(use_candidate: bool) -> BytesMut {
    let mut msg = Message::new();
    msg.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
    ])
    .unwrap();
    Username::new(ATTR_USERNAME, format!("{LOCAL_UFRAG}:remoteufrag"))
        .add_to(&mut msg)
        .unwrap();
    msg.add(ATTR_PRIORITY, &1_845_501_695u32.to_be_bytes());
    if use_candidate {
        msg.add(ATTR_USE_CANDIDATE, &[]);
    }
    msg.add(ATTR_ICE_CONTROLLING, &7u64.to_be_bytes());
    MessageIntegrity::new_short_term_integrity(LOCAL_PWD.to_owned())
        .add_to(&mut msg)
        .unwrap();
    FINGERPRINT.add_to(&mut msg).unwrap();
    BytesMut::from(&msg.raw[..])
}

/// DTLS engine completing the handshake on the first record it receives.
pub struct MockDtlsEngine {
    log: Log,
    srtp_profile: Option<SrtpProtectionProfile>,
    remote_certificate: Vec<u8>,
    role: Option<DtlsRole>,
    connected: bool,
    transmits: VecDeque<BytesMut>,
    events: VecDeque<DtlsEngineEvent>,
}

impl MockDtlsEngine {
    pub fn new(log: Log) -> Self {
        Self {
            log,
            srtp_profile: Some(SrtpProtectionProfile::Aes128CmHmacSha1_80),
            remote_certificate: REMOTE_CERTIFICATE.to_vec(),
            role: None,
            connected: false,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn with_remote_certificate(mut self, certificate: &[u8]) -> Self {
        self.remote_certificate = certificate.to_vec();
        self
    }

    pub fn with_srtp_profile(mut self, profile: Option<SrtpProtectionProfile>) -> Self {
        self.srtp_profile = profile;
        self
    }
}

impl DtlsEngine for MockDtlsEngine {
    fn certificate(&self) -> &[u8] {
        LOCAL_CERTIFICATE
    }

    fn run(&mut self, _now: Instant, role: DtlsRole) -> Result<()> {
        self.log.borrow_mut().push(format!("dtls run {role}"));
        self.role = Some(role);
        self.connected = false;
        if role == DtlsRole::Client {
            self.transmits
                .push_back(dtls_record(DTLS_HANDSHAKE, b"client hello"));
        }
        Ok(())
    }

    fn handle_read(&mut self, _now: Instant, data: &[u8]) -> Result<()> {
        match data[0] {
            DTLS_HANDSHAKE if !self.connected => {
                self.connected = true;
                self.transmits
                    .push_back(dtls_record(DTLS_HANDSHAKE, b"finished"));
                let keying_material_len = self
                    .srtp_profile
                    .map_or(0, |profile| profile.keying_material_len());
                self.events.push_back(DtlsEngineEvent::HandshakeComplete {
                    remote_certificate: self.remote_certificate.clone(),
                    srtp_profile: self.srtp_profile,
                    keying_material: (1..=keying_material_len as u8).collect(),
                });
            }
            DTLS_APPLICATION_DATA if self.connected => {
                self.events
                    .push_back(DtlsEngineEvent::ApplicationData(BytesMut::from(&data[13..])));
            }
            DTLS_ALERT => {
                self.connected = false;
                self.events.push_back(DtlsEngineEvent::Closed);
            }
            _ => {}
        }
        Ok(())
    }

    fn send_application_data(&mut self, data: &[u8]) -> Result<()> {
        self.transmits
            .push_back(dtls_record(DTLS_APPLICATION_DATA, data));
        Ok(())
    }

    fn poll_transmit(&mut self) -> Option<BytesMut> {
        self.transmits.pop_front()
    }

    fn poll_event(&mut self) -> Option<DtlsEngineEvent> {
        self.events.pop_front()
    }

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    fn close(&mut self) -> Result<()> {
        self.log.borrow_mut().push("dtls close".to_owned());
        if self.role.is_some() {
            self.transmits
                .push_back(dtls_record(DTLS_ALERT, b"close_notify"));
        }
        Ok(())
    }
}

/// Session appending a fixed tag on the way out and stripping it on the
/// way in.
struct TaggingSession {
    direction: SrtpDirection,
    log: Log,
}

impl TaggingSession {
    fn protect(&self, plaintext: &[u8]) -> Result<Bytes> {
        let mut out = plaintext.to_vec();
        out.extend_from_slice(&SRTP_AUTH_TAG);
        Ok(out.into())
    }

    fn unprotect(&self, encrypted: &[u8]) -> Result<Bytes> {
        match encrypted.strip_suffix(&SRTP_AUTH_TAG[..]) {
            Some(plaintext) => Ok(Bytes::copy_from_slice(plaintext)),
            None => Err(Error::Srtp("authentication failed".to_owned())),
        }
    }
}

impl SrtpSession for TaggingSession {
    fn encrypt_rtp(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        self.protect(plaintext)
    }

    fn decrypt_rtp(&mut self, encrypted: &[u8]) -> Result<Bytes> {
        self.unprotect(encrypted)
    }

    fn encrypt_rtcp(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        self.protect(plaintext)
    }

    fn decrypt_rtcp(&mut self, encrypted: &[u8]) -> Result<Bytes> {
        self.unprotect(encrypted)
    }
}

impl Drop for TaggingSession {
    fn drop(&mut self) {
        self.log
            .borrow_mut()
            .push(format!("srtp {:?} dropped", self.direction));
    }
}

pub struct MockSrtpSessionFactory {
    log: Log,
}

impl MockSrtpSessionFactory {
    pub fn new(log: Log) -> Self {
        Self { log }
    }
}

impl SrtpSessionFactory for MockSrtpSessionFactory {
    fn create_session(
        &mut self,
        direction: SrtpDirection,
        profile: SrtpProtectionProfile,
        master_key: &[u8],
    ) -> Result<Box<dyn SrtpSession>> {
        assert_eq!(master_key.len(), profile.key_len() + profile.salt_len());
        self.log
            .borrow_mut()
            .push(format!("srtp {direction:?} created"));
        Ok(Box::new(TaggingSession {
            direction,
            log: Rc::clone(&self.log),
        }))
    }
}

pub struct MockSctpAssociation {
    log: Log,
    outbound: VecDeque<BytesMut>,
}

impl MockSctpAssociation {
    pub fn new(log: Log) -> Self {
        Self {
            log,
            outbound: VecDeque::new(),
        }
    }
}

impl SctpAssociation for MockSctpAssociation {
    fn run(&mut self, _now: Instant) {
        self.log.borrow_mut().push("sctp run".to_owned());
        self.outbound.push_back(BytesMut::from(&b"INIT"[..]));
    }

    fn handle_read(&mut self, _now: Instant, data: BytesMut) -> Result<()> {
        self.log
            .borrow_mut()
            .push(format!("sctp read {}", String::from_utf8_lossy(&data)));
        Ok(())
    }

    fn poll_write(&mut self) -> Option<BytesMut> {
        self.outbound.pop_front()
    }

    fn close(&mut self) -> Result<()> {
        self.log.borrow_mut().push("sctp close".to_owned());
        self.outbound.push_back(BytesMut::from(&b"ABORT"[..]));
        Ok(())
    }
}

/// Single layer source stream of a producer.
pub struct TestSourceStream {
    pub ssrc: u32,
    pub clock_rate: u32,
    pub score: Cell<u8>,
}

impl TestSourceStream {
    pub fn new(ssrc: u32, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate,
            score: Cell::new(10),
        }
    }
}

impl SourceStream for TestSourceStream {
    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    fn score(&self) -> u8 {
        self.score.get()
    }

    fn bitrate(&self, _now: Instant, _spatial_layer: u8, _temporal_layer: u8) -> u32 {
        500_000
    }

    fn layer_bitrate(&self, _now: Instant, _spatial_layer: u8, _temporal_layer: u8) -> u32 {
        500_000
    }

    fn sender_report(&self) -> Option<SenderReportInfo> {
        None
    }
}

pub fn video_consumer_options(id: &str, producer_id: &str, ssrc: u32, mapped_ssrc: u32) -> ConsumerOptions {
    ConsumerOptions {
        id: id.to_owned(),
        producer_id: producer_id.to_owned(),
        kind: MediaKind::Video,
        consumer_type: ConsumerType::Simple,
        rtp_parameters: RtpParameters {
            mid: Some("0".to_owned()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_owned(),
                payload_type: VP8_PT,
                clock_rate: 90000,
                rtcp_feedback: vec![
                    RtcpFeedback::new("nack", ""),
                    RtcpFeedback::new("nack", "pli"),
                    RtcpFeedback::new("ccm", "fir"),
                ],
                ..Default::default()
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc,
                ..Default::default()
            }],
            rtcp: RtcpParameters {
                cname: Some("video-cname".to_owned()),
                reduced_size: true,
            },
            ..Default::default()
        },
        consumable_rtp_encodings: vec![RtpEncodingParameters {
            ssrc: mapped_ssrc,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn audio_consumer_options(id: &str, producer_id: &str, ssrc: u32, mapped_ssrc: u32) -> ConsumerOptions {
    ConsumerOptions {
        id: id.to_owned(),
        producer_id: producer_id.to_owned(),
        kind: MediaKind::Audio,
        consumer_type: ConsumerType::Simple,
        rtp_parameters: RtpParameters {
            mid: Some("1".to_owned()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_owned(),
                payload_type: OPUS_PT,
                clock_rate: 48000,
                channels: Some(2),
                ..Default::default()
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc,
                ..Default::default()
            }],
            rtcp: RtcpParameters {
                cname: Some("audio-cname".to_owned()),
                reduced_size: true,
            },
            ..Default::default()
        },
        consumable_rtp_encodings: vec![RtpEncodingParameters {
            ssrc: mapped_ssrc,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn media_packet(ssrc: u32, payload_type: u8, seq: u16, timestamp: u32, key_frame: bool) -> MediaPacket {
    MediaPacket::new(rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type,
            sequence_number: seq,
            timestamp,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0x90, 0x00, 0x01, 0x02]),
        ..Default::default()
    })
    .with_key_frame(key_frame)
}

pub fn remote_dtls_parameters(role: Option<DtlsRole>) -> DtlsParameters {
    DtlsParameters {
        role,
        fingerprints: vec![DtlsFingerprint::of(
            FingerprintAlgorithm::Sha256,
            REMOTE_CERTIFICATE,
        )],
    }
}

pub fn setting_engine() -> SettingEngine {
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_ice_credentials(LOCAL_UFRAG.to_owned(), LOCAL_PWD.to_owned());
    setting_engine
}

/// Transport wired to the mocks, all of them logging into `log`.
pub fn new_transport(log: &Log, with_sctp: bool) -> WebRtcTransport {
    let sctp: Option<Box<dyn SctpAssociation>> = if with_sctp {
        Some(Box::new(MockSctpAssociation::new(Rc::clone(log))))
    } else {
        None
    };
    WebRtcTransport::new(
        setting_engine(),
        Box::new(MockDtlsEngine::new(Rc::clone(log))),
        Box::new(MockSrtpSessionFactory::new(Rc::clone(log))),
        sctp,
    )
    .unwrap()
}

pub fn drain_events(transport: &mut WebRtcTransport) -> Vec<TransportEvent> {
    let mut events = vec![];
    while let Some(event) = transport.poll_event() {
        events.push(event);
    }
    events
}

pub fn drain_writes(transport: &mut WebRtcTransport) -> Vec<TaggedBytesMut> {
    let mut writes = vec![];
    while let Some(write) = transport.poll_write() {
        writes.push(write);
    }
    writes
}

/// Runs ICE and the DTLS handshake (local role server) on `tuple(5000)`.
pub fn connect(transport: &mut WebRtcTransport) -> Vec<TransportEvent> {
    transport
        .handle_read(datagram(tuple(5000), &binding_request(true)))
        .unwrap();
    transport
        .connect(&remote_dtls_parameters(Some(DtlsRole::Client)))
        .unwrap();
    let mut events = drain_events(transport);

    transport
        .handle_read(datagram(
            tuple(5000),
            &dtls_record(DTLS_HANDSHAKE, b"client hello"),
        ))
        .unwrap();
    events.extend(drain_events(transport));
    events
}
