use crate::error::{Error, Result};
use rand::{Rng, rng};
use std::net::{SocketAddr, ToSocketAddrs};

// match_range is a MatchFunc that accepts packets with the first byte in [lower..upper]
fn match_range(lower: u8, upper: u8) -> impl Fn(&[u8]) -> bool {
    move |buf: &[u8]| -> bool {
        if buf.is_empty() {
            return false;
        }
        let b = buf[0];
        b >= lower && b <= upper
    }
}

/// MatchFuncs as described in RFC7983
/// <https://tools.ietf.org/html/rfc7983>
///              +----------------+
///              |        [0..3] -+--> forward to STUN
///              |                |
///              |      [20..63] -+--> forward to DTLS
///              |                |
///              |    [128..191] -+--> forward to RTP/RTCP
///              +----------------+
///
/// Besides the first byte, every matcher also requires the minimum length of
/// the corresponding fixed header, so truncated datagrams never classify.
pub const STUN_HEADER_SIZE: usize = 20;
pub const RTCP_HEADER_SIZE: usize = 4;
pub const RTP_HEADER_SIZE: usize = 12;
pub const DTLS_RECORD_HEADER_SIZE: usize = 13;

/// match_stun accepts packets with a full STUN header and the first byte in [0..3]
pub fn match_stun(buf: &[u8]) -> bool {
    buf.len() >= STUN_HEADER_SIZE && match_range(0, 3)(buf)
}

/// match_dtls accepts packets with a full record header and the first byte in [20..63]
pub fn match_dtls(buf: &[u8]) -> bool {
    buf.len() >= DTLS_RECORD_HEADER_SIZE && match_range(20, 63)(buf)
}

// match_srtp_or_srtcp is a MatchFunc that accepts packets with the first byte in [128..191]
// as defied in RFC7983
pub fn match_srtp_or_srtcp(b: &[u8]) -> bool {
    match_range(128, 191)(b)
}

pub fn is_rtcp(buf: &[u8]) -> bool {
    // Not long enough to determine RTP/RTCP
    if buf.len() < RTCP_HEADER_SIZE {
        return false;
    }

    let rtcp_packet_type = buf[1];
    (192..=223).contains(&rtcp_packet_type)
}

/// match_srtp is a MatchFunc that only matches SRTP and not SRTCP
pub fn match_srtp(buf: &[u8]) -> bool {
    buf.len() >= RTP_HEADER_SIZE && match_srtp_or_srtcp(buf) && !is_rtcp(buf)
}

/// match_srtcp is a MatchFunc that only matches SRTCP and not SRTP
pub fn match_srtcp(buf: &[u8]) -> bool {
    match_srtp_or_srtcp(buf) && is_rtcp(buf)
}

/// lookup host to SocketAddr
pub fn lookup_host<T>(use_ipv4: bool, host: T) -> Result<SocketAddr>
where
    T: ToSocketAddrs,
{
    for remote_addr in host.to_socket_addrs()? {
        if (use_ipv4 && remote_addr.is_ipv4()) || (!use_ipv4 && remote_addr.is_ipv6()) {
            return Ok(remote_addr);
        }
    }

    Err(Error::ErrAddressParseFailed)
}

const RUNES_ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const RUNES_ALPHA_NUMBER: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a locally generated ICE username fragment.
pub const ICE_UFRAG_LEN: usize = 16;
/// Length of a locally generated ICE password.
pub const ICE_PWD_LEN: usize = 32;

/// math_rand_alpha generates a mathematical random alphabet sequence of the requested length.
pub fn math_rand_alpha(n: usize) -> String {
    generate_crypto_random_string(n, RUNES_ALPHA)
}

/// math_rand_alpha_number generates a random alphabet and number sequence of the requested length.
pub fn math_rand_alpha_number(n: usize) -> String {
    generate_crypto_random_string(n, RUNES_ALPHA_NUMBER)
}

/// Generates a fresh ICE username fragment.
pub fn generate_ice_ufrag() -> String {
    math_rand_alpha_number(ICE_UFRAG_LEN)
}

/// Generates a fresh ICE password.
pub fn generate_ice_pwd() -> String {
    math_rand_alpha_number(ICE_PWD_LEN)
}

pub fn generate_crypto_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = rng();

    let rand_string: String = (0..n)
        .map(|_| {
            let idx = rng.random_range(0..runes.len());
            runes[idx] as char
        })
        .collect();

    rand_string
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matchers() {
        let mut stun = vec![0u8; 20];
        stun[0] = 0x00;
        let mut rtp = vec![0u8; 12];
        rtp[0] = 0x80;
        rtp[1] = 96;
        let mut rtcp = vec![0u8; 8];
        rtcp[0] = 0x80;
        rtcp[1] = 200;
        let mut dtls = vec![0u8; 13];
        dtls[0] = 22;

        let tests = vec![
            ("stun", stun.clone(), true, false, false, false),
            ("short stun", stun[..19].to_vec(), false, false, false, false),
            ("rtp", rtp.clone(), false, true, false, false),
            ("short rtp", rtp[..11].to_vec(), false, false, false, false),
            ("rtcp", rtcp.clone(), false, false, true, false),
            ("short rtcp", rtcp[..3].to_vec(), false, false, false, false),
            ("dtls", dtls.clone(), false, false, false, true),
            ("short dtls", dtls[..12].to_vec(), false, false, false, false),
            ("empty", vec![], false, false, false, false),
        ];

        for (name, buf, is_stun, is_rtp, is_rtcp, is_dtls) in tests {
            assert_eq!(match_stun(&buf), is_stun, "{name} stun failed");
            assert_eq!(match_srtp(&buf), is_rtp, "{name} rtp failed");
            assert_eq!(match_srtcp(&buf), is_rtcp, "{name} rtcp failed");
            assert_eq!(match_dtls(&buf), is_dtls, "{name} dtls failed");
        }
    }

    #[test]
    fn test_ice_credentials() {
        let ufrag = generate_ice_ufrag();
        let pwd = generate_ice_pwd();
        assert_eq!(ufrag.len(), ICE_UFRAG_LEN);
        assert_eq!(pwd.len(), ICE_PWD_LEN);
        assert!(ufrag.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_ice_ufrag(), ufrag);
    }
}
