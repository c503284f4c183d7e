#![allow(dead_code)]

use std::io;
use std::net;
use std::num::ParseIntError;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //Consumer validation
    #[error("consumer: empty rtp_parameters.encodings")]
    ErrConsumerEmptyEncodings,
    #[error("consumer: invalid encoding.ssrc")]
    ErrConsumerInvalidSsrc,
    #[error("consumer: invalid encoding.rtx.ssrc")]
    ErrConsumerInvalidRtxSsrc,
    #[error("consumer: empty consumable_rtp_encodings")]
    ErrConsumerEmptyConsumableEncodings,
    #[error("consumer: invalid consumable encoding ssrc")]
    ErrConsumerInvalidConsumableSsrc,
    #[error("consumer: invalid header extension id")]
    ErrConsumerInvalidHeaderExtensionId,
    #[error("consumer: no media codecs")]
    ErrConsumerNoMediaCodecs,
    #[error("consumer: invalid number of consumable encodings {0}")]
    ErrConsumerInvalidConsumableEncodingsCount(usize),
    #[error("consumer: encoding spatial layers {0} do not match consumable encodings {1}")]
    ErrConsumerSpatialLayersMismatch(u8, usize),
    #[error("consumer: kind does not support {0} forwarding")]
    ErrConsumerInvalidKind(String),
    #[error("consumer: id {0} already exists")]
    ErrConsumerAlreadyExists(String),
    #[error("consumer: id {0} not found")]
    ErrConsumerNotFound(String),
    #[error("consumer: ssrc {0} already in use")]
    ErrConsumerSsrcInUse(u32),
    #[error("consumer: no registered source for spatial layer {0}")]
    ErrConsumerInvalidSpatialLayer(i16),
    #[error("consumer: no source for mapped ssrc {0}")]
    ErrConsumerUnknownMappedSsrc(u32),
    #[error("invalid scalability mode {0}")]
    ErrInvalidScalabilityMode(String),
    #[error("invalid send buffer size {0}")]
    ErrInvalidSendBufferSize(u16),

    //ICE
    #[error("ice: no selected tuple")]
    ErrIceNoSelectedTuple,
    #[error("ice: tuple not found")]
    ErrIceTupleNotFound,
    #[error("ice: invalid credentials")]
    ErrIceInvalidCredentials,

    //DTLS
    #[error("dtls: connect() already called")]
    ErrDtlsConnectAlreadyCalled,
    #[error("dtls: transport not connected")]
    ErrDtlsTransportNotConnected,
    #[error("dtls: local role not resolved")]
    ErrDtlsRoleNotResolved,
    #[error("dtls: no remote fingerprint")]
    ErrDtlsNoRemoteFingerprint,
    #[error("dtls: unsupported fingerprint algorithm {0}")]
    ErrDtlsUnsupportedFingerprintAlgorithm(String),
    #[error("dtls: invalid fingerprint value {0}")]
    ErrDtlsInvalidFingerprint(String),
    #[error("dtls: remote certificate fingerprint mismatch")]
    ErrDtlsFingerprintMismatch,
    #[error("dtls: invalid role {0}")]
    ErrDtlsInvalidRole(String),

    //SRTP
    #[error("srtp: unsupported protection profile {0}")]
    ErrSrtpUnsupportedProfile(String),
    #[error("srtp: keying material too short, expected {0} got {1}")]
    ErrSrtpKeyingMaterialTooShort(usize, usize),
    #[error("srtp: no session")]
    ErrSrtpNoSession,

    //SCTP
    #[error("sctp: association not enabled")]
    ErrSctpNotEnabled,

    //Transport
    #[error("transport: closed")]
    ErrTransportClosed,
    #[error("transport: not connected")]
    ErrTransportNotConnected,
    #[error("transport: minimum available bitrate {1} above initial bitrate {0}")]
    ErrTransportInvalidRembBitrates(u32, u32),

    #[error("parse ip: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("utf8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("address parse failed")]
    ErrAddressParseFailed,

    //Codec errors surfaced from wire crates
    #[error("rtp: {0}")]
    Rtp(String),
    #[error("rtcp: {0}")]
    Rtcp(String),
    #[error("stun: {0}")]
    Stun(String),
    #[error("dtls: {0}")]
    Dtls(String),
    #[error("srtp: {0}")]
    Srtp(String),
    #[error("sctp: {0}")]
    Sctp(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

pub fn flatten_errs(errs: Vec<impl Into<Error>>) -> Result<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        let errs_strs: Vec<String> = errs.into_iter().map(|e| e.into().to_string()).collect();
        Err(Error::Other(errs_strs.join("\n")))
    }
}
