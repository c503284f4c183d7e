use super::*;

#[test]
fn test_scalability_mode_parse() {
    let tests = vec![
        ("L1T1", Some((1, 1, false))),
        ("L1T3", Some((1, 3, false))),
        ("S3T3", Some((3, 3, false))),
        ("L3T3_KEY", Some((3, 3, true))),
        ("L2T2_KEY_SHIFT", Some((2, 2, true))),
        ("L0T1", None),
        ("X1T1", None),
        ("L1", None),
        ("L1T1_FOO", None),
    ];

    for (name, expected) in tests {
        let result = name.parse::<ScalabilityMode>();
        match expected {
            Some((spatial_layers, temporal_layers, ksvc)) => {
                assert_eq!(
                    result,
                    Ok(ScalabilityMode {
                        spatial_layers,
                        temporal_layers,
                        ksvc
                    }),
                    "{name} failed"
                );
            }
            None => assert!(result.is_err(), "{name} failed"),
        }
    }
}

#[test]
fn test_rtx_codec_for_encoding() {
    let params = RtpParameters {
        codecs: vec![
            RtpCodecParameters {
                mime_type: "video/VP8".to_owned(),
                payload_type: 101,
                clock_rate: 90000,
                ..Default::default()
            },
            RtpCodecParameters {
                mime_type: "video/rtx".to_owned(),
                payload_type: 102,
                clock_rate: 90000,
                parameters: [("apt".to_owned(), "101".to_owned())].into_iter().collect(),
                ..Default::default()
            },
        ],
        encodings: vec![RtpEncodingParameters {
            ssrc: 1111,
            ..Default::default()
        }],
        ..Default::default()
    };

    let encoding = &params.encodings[0];
    assert_eq!(
        params.codec_for_encoding(encoding).map(|c| c.payload_type),
        Some(101)
    );
    assert_eq!(
        params.rtx_codec_for_encoding(encoding).map(|c| c.payload_type),
        Some(102)
    );
    assert_eq!(params.media_codecs().count(), 1);
}

#[test]
fn test_rtp_parameters_from_json() -> Result<()> {
    let json = r#"{
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 101,
            "clockRate": 90000,
            "rtcpFeedback": [{"type": "nack"}, {"type": "nack", "parameter": "pli"}, {"type": "goog-remb"}]
        }],
        "encodings": [{"ssrc": 1111, "scalabilityMode": "L3T3"}],
        "rtcp": {"cname": "abcd"}
    }"#;

    let params: RtpParameters =
        serde_json::from_str(json).map_err(|err| Error::Other(err.to_string()))?;
    assert!(params.rtcp.reduced_size);
    assert_eq!(params.rtcp.cname.as_deref(), Some("abcd"));
    assert!(params.codecs[0].has_feedback("nack", ""));
    assert!(params.codecs[0].has_feedback("nack", "pli"));
    assert!(params.has_feedback("goog-remb"));
    assert_eq!(params.encodings[0].scalability()?.spatial_layers, 3);

    Ok(())
}
