mod common;

use bytes::Bytes;
use common::*;
use rtc_sfu::consumer::ConsumerEvent;
use rtc_sfu::event::{ProducerEvent, ProducerEventKind, TransportEvent};
use rtc_sfu::message::{InboundMessage, OutboundMessage};
use rtc_sfu::transport::dtls::{DtlsRole, DtlsTransportState};
use rtc_sfu::transport::ice::IceState;
use rtc_sfu::transport::srtp::SrtpProtectionProfile;
use rtc_sfu::WebRtcTransport;
use rtcp::packet::Packet as RtcpPacket;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::sender_report::SenderReport;
use sansio::Protocol;
use shared::error::Error;
use shared::FiveTuple;
use std::rc::Rc;
use std::time::{Duration, Instant};
use stun::message::{BINDING_SUCCESS, Getter, Message};
use stun::xoraddr::XorMappedAddress;
use util::marshal::Unmarshal;

const VIDEO_SSRC: u32 = 1111;
const VIDEO_MAPPED_SSRC: u32 = 2222;
const AUDIO_SSRC: u32 = 3333;
const AUDIO_MAPPED_SSRC: u32 = 4444;

fn is_stun(write: &shared::TaggedBytesMut) -> bool {
    write.message[0] < 4
}

fn new_rtp_stream(producer_id: &str, ssrc: u32, clock_rate: u32) -> ProducerEvent {
    ProducerEvent {
        producer_id: producer_id.to_owned(),
        kind: ProducerEventKind::NewRtpStream {
            stream: Rc::new(TestSourceStream::new(ssrc, clock_rate)),
            mapped_ssrc: ssrc,
        },
    }
}

fn add_video_consumer(transport: &mut WebRtcTransport) {
    transport
        .consume(video_consumer_options(
            "video",
            "video-producer",
            VIDEO_SSRC,
            VIDEO_MAPPED_SSRC,
        ))
        .unwrap();
    transport
        .handle_event(new_rtp_stream("video-producer", VIDEO_MAPPED_SSRC, 90000))
        .unwrap();
}

fn add_audio_consumer(transport: &mut WebRtcTransport) {
    transport
        .consume(audio_consumer_options(
            "audio",
            "audio-producer",
            AUDIO_SSRC,
            AUDIO_MAPPED_SSRC,
        ))
        .unwrap();
    transport
        .handle_event(new_rtp_stream("audio-producer", AUDIO_MAPPED_SSRC, 48000))
        .unwrap();
}

fn send_audio(transport: &mut WebRtcTransport, seq: u16) {
    transport
        .handle_write(OutboundMessage::Media {
            now: Instant::now(),
            producer_id: "audio-producer".to_owned(),
            packet: media_packet(AUDIO_MAPPED_SSRC, OPUS_PT, seq, seq as u32 * 960, false),
        })
        .unwrap();
}

/// Strips the mock SRTP tag and parses the RTP packet.
fn unprotect_rtp(write: &shared::TaggedBytesMut) -> rtp::packet::Packet {
    let plaintext = write
        .message
        .strip_suffix(&SRTP_AUTH_TAG[..])
        .expect("packet sent without SRTP protection");
    let mut buf = Bytes::copy_from_slice(plaintext);
    rtp::packet::Packet::unmarshal(&mut buf).unwrap()
}

fn protect_rtcp(packets: &[Box<dyn RtcpPacket + Send + Sync>]) -> Vec<u8> {
    let mut data = rtcp::packet::marshal(packets).unwrap().to_vec();
    data.extend_from_slice(&SRTP_AUTH_TAG);
    data
}

#[test]
fn test_binding_request_connects_ice() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    assert_eq!(transport.ice_state(), IceState::New);

    transport
        .handle_read(datagram(tuple(5000), &binding_request(false)))
        .unwrap();

    let writes = drain_writes(&mut transport);
    assert_eq!(writes.len(), 1);
    assert!(is_stun(&writes[0]));
    assert_eq!(writes[0].transport.peer_addr, tuple(5000).peer_addr);

    let mut response = Message::new();
    response.raw = writes[0].message.to_vec();
    response.decode().unwrap();
    assert_eq!(response.typ, BINDING_SUCCESS);
    let mut mapped = XorMappedAddress::default();
    mapped.get_from(&response).unwrap();
    assert_eq!(mapped.port, tuple(5000).peer_addr.port());

    assert_eq!(
        drain_events(&mut transport),
        vec![
            TransportEvent::IceSelectedTupleChange(FiveTuple::from(&tuple(5000))),
            TransportEvent::IceStateChange(IceState::Connected),
        ]
    );
    assert_eq!(
        transport.ice_selected_tuple(),
        Some(FiveTuple::from(&tuple(5000)))
    );
    // DTLS waits for connect()
    assert!(log.borrow().is_empty());
    assert!(!transport.is_connected());
    assert_eq!(transport.dtls_state(), DtlsTransportState::New);

    // ICE is already connected, so connect() runs DTLS right away
    let local_role = transport
        .connect(&remote_dtls_parameters(Some(DtlsRole::Client)))
        .unwrap();
    assert_eq!(local_role, DtlsRole::Server);
    assert_eq!(*log.borrow(), vec!["dtls run server".to_owned()]);
    assert_eq!(transport.dtls_state(), DtlsTransportState::Connecting);
}

#[test]
fn test_dtls_role_resolution() {
    init_log();
    let tests = vec![
        ("remote client", Some(DtlsRole::Client), None, DtlsRole::Server),
        ("remote server", Some(DtlsRole::Server), None, DtlsRole::Client),
        ("remote auto", Some(DtlsRole::Auto), None, DtlsRole::Client),
        ("remote unset", None, None, DtlsRole::Client),
        (
            "remote auto with answering role",
            Some(DtlsRole::Auto),
            Some(DtlsRole::Server),
            DtlsRole::Server,
        ),
        (
            "explicit remote role wins over answering role",
            Some(DtlsRole::Server),
            Some(DtlsRole::Server),
            DtlsRole::Client,
        ),
    ];

    for (name, remote_role, answering_role, expected) in tests {
        let log = Log::default();
        let mut setting_engine = setting_engine();
        if let Some(role) = answering_role {
            setting_engine.set_answering_dtls_role(role).unwrap();
        }
        let mut transport = WebRtcTransport::new(
            setting_engine,
            Box::new(MockDtlsEngine::new(Rc::clone(&log))),
            Box::new(MockSrtpSessionFactory::new(Rc::clone(&log))),
            None,
        )
        .unwrap();

        assert_eq!(
            transport.dtls_parameters().role,
            Some(DtlsRole::Auto),
            "{name} failed"
        );
        assert_eq!(
            transport.dtls_parameters().fingerprints.len(),
            3,
            "{name} failed"
        );

        let local_role = transport
            .connect(&remote_dtls_parameters(remote_role))
            .unwrap();
        assert_eq!(local_role, expected, "{name} failed");
        assert_eq!(
            transport.dtls_parameters().role,
            Some(expected),
            "{name} failed"
        );
        assert_eq!(
            transport.connect(&remote_dtls_parameters(remote_role)),
            Err(Error::ErrDtlsConnectAlreadyCalled),
            "{name} failed"
        );
        assert_eq!(transport.dtls_state(), DtlsTransportState::New, "{name} failed");

        // the handshake starts once ICE is connected
        transport
            .handle_read(datagram(tuple(5000), &binding_request(false)))
            .unwrap();
        drain_events(&mut transport);
        assert_eq!(
            *log.borrow(),
            vec![format!("dtls run {expected}")],
            "{name} failed"
        );
        assert_eq!(
            transport.dtls_state(),
            DtlsTransportState::Connecting,
            "{name} failed"
        );

        // a client sends its first flight to the selected tuple
        let dtls_writes: Vec<_> = drain_writes(&mut transport)
            .into_iter()
            .filter(|write| !is_stun(write))
            .collect();
        if expected == DtlsRole::Client {
            assert_eq!(dtls_writes.len(), 1, "{name} failed");
            assert_eq!(dtls_writes[0].message[0], DTLS_HANDSHAKE, "{name} failed");
            assert_eq!(
                dtls_writes[0].transport.peer_addr,
                tuple(5000).peer_addr,
                "{name} failed"
            );
        } else {
            assert!(dtls_writes.is_empty(), "{name} failed");
        }
    }
}

#[test]
fn test_handshake_connects_consumers() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    add_video_consumer(&mut transport);
    drain_events(&mut transport);

    let events = connect(&mut transport);

    assert_eq!(
        *log.borrow(),
        vec![
            "dtls run server",
            "srtp Outbound created",
            "srtp Inbound created",
        ]
    );
    assert_eq!(transport.dtls_state(), DtlsTransportState::Connected);
    assert_eq!(transport.ice_state(), IceState::Completed);
    assert!(transport.is_connected());

    let connected_at = events
        .iter()
        .position(|event| {
            *event == TransportEvent::DtlsStateChange(DtlsTransportState::Connected)
        })
        .expect("no DTLS connected event");
    let key_frame_at = events
        .iter()
        .position(|event| {
            *event
                == TransportEvent::KeyFrameRequested {
                    consumer_id: "video".to_owned(),
                    producer_id: "video-producer".to_owned(),
                    mapped_ssrc: VIDEO_MAPPED_SSRC,
                }
        })
        .expect("no key frame request");
    assert!(connected_at < key_frame_at);

    // the server flight goes back on the selected tuple
    let writes: Vec<_> = drain_writes(&mut transport)
        .into_iter()
        .filter(|write| !is_stun(write))
        .collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].message[0], DTLS_HANDSHAKE);
    assert_eq!(writes[0].transport.peer_addr, tuple(5000).peer_addr);

    assert!(transport.consumer("video").unwrap().is_active());
}

#[test]
fn test_rejected_handshake_fails() {
    init_log();
    let tests = vec![
        (
            "fingerprint mismatch",
            MockDtlsEngine::new(Log::default()).with_remote_certificate(b"someone else"),
        ),
        (
            "no srtp profile negotiated",
            MockDtlsEngine::new(Log::default()).with_srtp_profile(None),
        ),
        (
            "srtp profile not allowed",
            MockDtlsEngine::new(Log::default())
                .with_srtp_profile(Some(SrtpProtectionProfile::AeadAes256Gcm)),
        ),
    ];

    for (name, engine) in tests {
        let log = Log::default();
        let mut setting_engine = setting_engine();
        setting_engine.set_srtp_protection_profiles(vec![
            SrtpProtectionProfile::Aes128CmHmacSha1_80,
            SrtpProtectionProfile::AeadAes128Gcm,
        ]);
        let mut transport = WebRtcTransport::new(
            setting_engine,
            Box::new(engine),
            Box::new(MockSrtpSessionFactory::new(Rc::clone(&log))),
            None,
        )
        .unwrap();

        let events = connect(&mut transport);
        assert!(
            events.contains(&TransportEvent::DtlsStateChange(DtlsTransportState::Failed)),
            "{name} failed"
        );
        assert_eq!(transport.dtls_state(), DtlsTransportState::Failed, "{name} failed");
        assert!(!transport.is_connected(), "{name} failed");
        assert!(log.borrow().is_empty(), "{name} failed");
    }
}

#[test]
fn test_media_is_protected_and_sent_to_selected_tuple() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    add_audio_consumer(&mut transport);
    connect(&mut transport);
    drain_writes(&mut transport);

    send_audio(&mut transport, 100);
    let writes = drain_writes(&mut transport);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].transport.peer_addr, tuple(5000).peer_addr);

    let packet = unprotect_rtp(&writes[0]);
    assert_eq!(packet.header.ssrc, AUDIO_SSRC);
    assert_eq!(packet.header.payload_type, OPUS_PT);
    assert_eq!(&packet.payload[..], &[0x90, 0x00, 0x01, 0x02]);
    let first_seq = packet.header.sequence_number;

    // a nomination on another tuple moves the output there
    transport
        .handle_read(datagram(tuple(5001), &binding_request(true)))
        .unwrap();
    assert!(drain_events(&mut transport).contains(&TransportEvent::IceSelectedTupleChange(
        FiveTuple::from(&tuple(5001))
    )));
    drain_writes(&mut transport);

    send_audio(&mut transport, 101);
    let writes = drain_writes(&mut transport);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].transport.peer_addr, tuple(5001).peer_addr);
    assert_eq!(
        unprotect_rtp(&writes[0]).header.sequence_number,
        first_seq.wrapping_add(1)
    );

    // media of another producer is not forwarded
    transport
        .handle_write(OutboundMessage::Media {
            now: Instant::now(),
            producer_id: "other-producer".to_owned(),
            packet: media_packet(AUDIO_MAPPED_SSRC, OPUS_PT, 102, 0, false),
        })
        .unwrap();
    assert!(drain_writes(&mut transport).is_empty());
}

#[test]
fn test_media_is_not_sent_before_connected() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    add_audio_consumer(&mut transport);

    let tests = vec![("ice not connected", false), ("dtls not connected", true)];
    for (name, ice_connected) in tests {
        if ice_connected {
            transport
                .handle_read(datagram(tuple(5000), &binding_request(false)))
                .unwrap();
            drain_events(&mut transport);
        }

        send_audio(&mut transport, 1);
        let writes = drain_writes(&mut transport);
        assert!(
            writes.iter().all(is_stun),
            "{name} failed: {} media writes",
            writes.len()
        );
        assert!(!transport.consumer("audio").unwrap().is_active(), "{name} failed");
    }
}

#[test]
fn test_rtcp_feedback_dispatch() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    add_video_consumer(&mut transport);
    connect(&mut transport);
    drain_writes(&mut transport);

    let packets: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![
        Box::new(SenderReport {
            ssrc: 7777,
            ..Default::default()
        }),
        Box::new(PictureLossIndication {
            sender_ssrc: 7777,
            media_ssrc: VIDEO_SSRC,
        }),
    ];
    transport
        .handle_read(datagram(tuple(5000), &protect_rtcp(&packets)))
        .unwrap();

    assert_eq!(
        drain_events(&mut transport),
        vec![TransportEvent::KeyFrameRequested {
            consumer_id: "video".to_owned(),
            producer_id: "video-producer".to_owned(),
            mapped_ssrc: VIDEO_MAPPED_SSRC,
        }]
    );

    // the sender report is not addressed to a consumer
    match transport.poll_read() {
        Some(InboundMessage::Rtcp(packets)) => {
            assert_eq!(packets.len(), 1);
            let sr = packets[0]
                .as_any()
                .downcast_ref::<SenderReport>()
                .expect("not a sender report");
            assert_eq!(sr.ssrc, 7777);
        }
        other => panic!("unexpected read {other:?}"),
    }
    assert!(transport.poll_read().is_none());

    // unauthenticated RTCP is dropped
    let plaintext = rtcp::packet::marshal(&packets).unwrap();
    transport
        .handle_read(datagram(tuple(5000), &plaintext))
        .unwrap();
    assert!(transport.poll_read().is_none());
    assert!(drain_events(&mut transport).is_empty());
}

#[test]
fn test_inbound_rtp_is_delivered() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    connect(&mut transport);

    let tests = vec![
        ("validated tuple", tuple(5000), true),
        ("unknown tuple", tuple(6000), false),
    ];
    for (name, from, delivered) in tests {
        let packet = media_packet(9999, VP8_PT, 1, 0, false).packet;
        let mut data = util::marshal::Marshal::marshal(&packet).unwrap().to_vec();
        data.extend_from_slice(&SRTP_AUTH_TAG);
        transport.handle_read(datagram(from, &data)).unwrap();

        match transport.poll_read() {
            Some(InboundMessage::Rtp(received)) => {
                assert!(delivered, "{name} failed");
                assert_eq!(received.header.ssrc, 9999, "{name} failed");
            }
            None => assert!(!delivered, "{name} failed"),
            other => panic!("{name} failed: unexpected read {other:?}"),
        }
    }
}

#[test]
fn test_sender_reports_follow_the_rtcp_timer() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    add_audio_consumer(&mut transport);
    assert!(transport.poll_timeout().is_none());

    connect(&mut transport);
    send_audio(&mut transport, 1);
    drain_writes(&mut transport);

    let timeout = transport.poll_timeout().expect("no RTCP timer");
    transport
        .handle_timeout(timeout + Duration::from_millis(1))
        .unwrap();

    let writes = drain_writes(&mut transport);
    assert_eq!(writes.len(), 1);
    let plaintext = writes[0]
        .message
        .strip_suffix(&SRTP_AUTH_TAG[..])
        .expect("RTCP sent without SRTP protection");
    let mut buf = Bytes::copy_from_slice(plaintext);
    let packets = rtcp::packet::unmarshal(&mut buf).unwrap();
    let sr = packets[0]
        .as_any()
        .downcast_ref::<SenderReport>()
        .expect("not a sender report");
    assert_eq!(sr.ssrc, AUDIO_SSRC);
    assert_eq!(sr.packet_count, 1);
    assert!(transport.poll_timeout().is_some());
}

#[test]
fn test_producer_events_reach_their_consumers() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    add_video_consumer(&mut transport);
    add_audio_consumer(&mut transport);
    connect(&mut transport);
    drain_events(&mut transport);

    let tests = vec![
        (
            ProducerEventKind::Pause,
            ConsumerEvent::ProducerPause,
            vec!["video", "audio"],
        ),
        (
            ProducerEventKind::Resume,
            ConsumerEvent::ProducerResume,
            vec!["video", "audio"],
        ),
        (
            ProducerEventKind::Close,
            ConsumerEvent::ProducerClose,
            vec!["audio"],
        ),
    ];

    for (kind, expected, remaining) in tests {
        let name = format!("{kind:?}");
        transport
            .handle_event(ProducerEvent {
                producer_id: "video-producer".to_owned(),
                kind,
            })
            .unwrap();

        let events = drain_events(&mut transport);
        assert!(
            events.contains(&TransportEvent::Consumer {
                consumer_id: "video".to_owned(),
                event: expected,
            }),
            "{name} failed: {events:?}"
        );
        assert!(
            events.iter().all(|event| !matches!(
                event,
                TransportEvent::Consumer { consumer_id, .. } if consumer_id == "audio"
            )),
            "{name} failed"
        );
        assert_eq!(transport.consumer_ids(), remaining, "{name} failed");
    }

    assert_eq!(
        transport.pause_consumer("video"),
        Err(Error::ErrConsumerNotFound("video".to_owned()))
    );
}

#[test]
fn test_consumer_registration_errors() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    add_video_consumer(&mut transport);

    assert_eq!(
        transport.consume(video_consumer_options(
            "video",
            "video-producer",
            5555,
            VIDEO_MAPPED_SSRC
        )),
        Err(Error::ErrConsumerAlreadyExists("video".to_owned()))
    );
    assert!(matches!(
        transport.consume(audio_consumer_options(
            "audio",
            "audio-producer",
            VIDEO_SSRC,
            AUDIO_MAPPED_SSRC
        )),
        Err(Error::ErrConsumerSsrcInUse(_))
    ));

    transport.close_consumer("video").unwrap();
    assert!(transport.consumer_ids().is_empty());
    // the ssrc is free again
    add_audio_consumer(&mut transport);
    assert_eq!(transport.consumer_ids(), vec!["audio"]);
}

#[test]
fn test_sctp_runs_over_dtls() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, true);
    connect(&mut transport);

    assert!(log.borrow().contains(&"sctp run".to_owned()));

    let writes = drain_writes(&mut transport);
    let app_data: Vec<_> = writes
        .iter()
        .filter(|write| write.message[0] == DTLS_APPLICATION_DATA)
        .collect();
    assert_eq!(app_data.len(), 1);
    assert_eq!(&app_data[0].message[13..], b"INIT");

    transport
        .handle_read(datagram(
            tuple(5000),
            &dtls_record(DTLS_APPLICATION_DATA, b"INIT ACK"),
        ))
        .unwrap();
    assert_eq!(log.borrow().last().unwrap(), "sctp read INIT ACK");
}

#[test]
fn test_remote_close_notify_disconnects() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    add_audio_consumer(&mut transport);
    connect(&mut transport);
    assert!(transport.consumer("audio").unwrap().is_active());

    transport
        .handle_read(datagram(
            tuple(5000),
            &dtls_record(DTLS_ALERT, b"close_notify"),
        ))
        .unwrap();
    assert!(drain_events(&mut transport)
        .contains(&TransportEvent::DtlsStateChange(DtlsTransportState::Closed)));
    assert!(!transport.is_connected());
    assert!(!transport.consumer("audio").unwrap().is_active());
}

#[test]
fn test_close_tears_down_in_order() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, true);
    add_audio_consumer(&mut transport);
    connect(&mut transport);
    drain_writes(&mut transport);
    drain_events(&mut transport);
    log.borrow_mut().clear();

    transport.close().unwrap();

    assert_eq!(
        *log.borrow(),
        vec![
            "sctp close",
            "dtls close",
            "srtp Outbound dropped",
            "srtp Inbound dropped",
        ]
    );

    // the final SCTP packet, then close_notify, both to the selected tuple
    let writes = drain_writes(&mut transport);
    let content_types: Vec<u8> = writes.iter().map(|write| write.message[0]).collect();
    assert_eq!(content_types, vec![DTLS_APPLICATION_DATA, DTLS_ALERT]);
    assert_eq!(&writes[0].message[13..], b"ABORT");
    assert!(writes
        .iter()
        .all(|write| write.transport.peer_addr == tuple(5000).peer_addr));

    assert!(transport.consumer_ids().is_empty());
    assert!(transport.poll_timeout().is_none());

    assert_eq!(
        transport.handle_read(datagram(tuple(5000), &binding_request(false))),
        Err(Error::ErrTransportClosed)
    );
    assert_eq!(
        transport.handle_event(new_rtp_stream("audio-producer", AUDIO_MAPPED_SSRC, 48000)),
        Err(Error::ErrTransportClosed)
    );
    assert!(matches!(
        transport.handle_write(OutboundMessage::Media {
            now: Instant::now(),
            producer_id: "audio-producer".to_owned(),
            packet: media_packet(AUDIO_MAPPED_SSRC, OPUS_PT, 1, 0, false),
        }),
        Err(Error::ErrTransportClosed)
    ));
    assert_eq!(
        transport.consume(audio_consumer_options(
            "audio",
            "audio-producer",
            AUDIO_SSRC,
            AUDIO_MAPPED_SSRC
        )),
        Err(Error::ErrTransportClosed)
    );
    assert_eq!(transport.restart_ice().err(), Some(Error::ErrTransportClosed));
    // closing twice is a no-op
    assert_eq!(transport.close(), Ok(()));
}

#[test]
fn test_ice_restart_keeps_transport_usable() {
    init_log();
    let log = Log::default();
    let mut transport = new_transport(&log, false);
    connect(&mut transport);

    let restarted = transport.restart_ice().unwrap();
    assert_ne!(restarted.username_fragment, LOCAL_UFRAG);
    assert_ne!(restarted.password, LOCAL_PWD);
    assert!(restarted.ice_lite);
    assert_eq!(transport.ice_parameters(), restarted);

    // checks with the previous credentials are still answered
    transport
        .handle_read(datagram(tuple(5000), &binding_request(false)))
        .unwrap();
    let writes = drain_writes(&mut transport);
    assert!(writes.iter().any(is_stun));
    assert!(transport.is_connected());
}
