use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use shared::error::{Error, Result};
use std::fmt;

/// Hash function of a certificate fingerprint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FingerprintAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

const FINGERPRINT_ALGORITHM_SHA256_STR: &str = "sha-256";
const FINGERPRINT_ALGORITHM_SHA384_STR: &str = "sha-384";
const FINGERPRINT_ALGORITHM_SHA512_STR: &str = "sha-512";

impl FingerprintAlgorithm {
    pub(crate) const ALL: [FingerprintAlgorithm; 3] = [
        FingerprintAlgorithm::Sha256,
        FingerprintAlgorithm::Sha384,
        FingerprintAlgorithm::Sha512,
    ];

    fn digest(&self, der: &[u8]) -> Vec<u8> {
        match self {
            FingerprintAlgorithm::Sha256 => Sha256::digest(der).to_vec(),
            FingerprintAlgorithm::Sha384 => Sha384::digest(der).to_vec(),
            FingerprintAlgorithm::Sha512 => Sha512::digest(der).to_vec(),
        }
    }

    fn digest_len(&self) -> usize {
        match self {
            FingerprintAlgorithm::Sha256 => 32,
            FingerprintAlgorithm::Sha384 => 48,
            FingerprintAlgorithm::Sha512 => 64,
        }
    }
}

impl TryFrom<&str> for FingerprintAlgorithm {
    type Error = Error;

    fn try_from(raw: &str) -> Result<Self> {
        match raw.to_lowercase().as_str() {
            FINGERPRINT_ALGORITHM_SHA256_STR => Ok(FingerprintAlgorithm::Sha256),
            FINGERPRINT_ALGORITHM_SHA384_STR => Ok(FingerprintAlgorithm::Sha384),
            FINGERPRINT_ALGORITHM_SHA512_STR => Ok(FingerprintAlgorithm::Sha512),
            _ => Err(Error::ErrDtlsUnsupportedFingerprintAlgorithm(
                raw.to_owned(),
            )),
        }
    }
}

impl fmt::Display for FingerprintAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            FingerprintAlgorithm::Sha256 => FINGERPRINT_ALGORITHM_SHA256_STR,
            FingerprintAlgorithm::Sha384 => FINGERPRINT_ALGORITHM_SHA384_STR,
            FingerprintAlgorithm::Sha512 => FINGERPRINT_ALGORITHM_SHA512_STR,
        };
        write!(f, "{s}")
    }
}

/// DTLS certificate fingerprint, e.g. `sha-256` and
/// `AB:CD:EF:...` (colon separated hex, case insensitive).
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

impl DtlsFingerprint {
    /// Fingerprint of a DER encoded certificate.
    pub fn of(algorithm: FingerprintAlgorithm, der: &[u8]) -> Self {
        let value: Vec<String> = algorithm
            .digest(der)
            .iter()
            .map(|x| format!("{x:02X}"))
            .collect();

        Self {
            algorithm: algorithm.to_string(),
            value: value.join(":"),
        }
    }

    /// Checks that the algorithm is supported and that the value has the
    /// shape of one of its digests.
    pub fn validate(&self) -> Result<FingerprintAlgorithm> {
        let algorithm = FingerprintAlgorithm::try_from(self.algorithm.as_str())?;

        let parts: Vec<&str> = self.value.split(':').collect();
        if parts.len() != algorithm.digest_len()
            || parts
                .iter()
                .any(|part| part.len() != 2 || hex::decode(part).is_err())
        {
            return Err(Error::ErrDtlsInvalidFingerprint(self.value.clone()));
        }

        Ok(algorithm)
    }

    /// Returns true if `der` hashes to this fingerprint.
    pub fn matches(&self, der: &[u8]) -> Result<bool> {
        let algorithm = self.validate()?;
        let computed = DtlsFingerprint::of(algorithm, der);
        Ok(computed.value.eq_ignore_ascii_case(&self.value))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CERT: &[u8] = b"not really a certificate";

    #[test]
    fn test_fingerprint_algorithm_from_str() {
        let tests = vec![
            ("sha-256", Some(FingerprintAlgorithm::Sha256)),
            ("SHA-384", Some(FingerprintAlgorithm::Sha384)),
            ("sha-512", Some(FingerprintAlgorithm::Sha512)),
            ("sha-1", None),
            ("md5", None),
        ];

        for (raw, expected) in tests {
            assert_eq!(
                FingerprintAlgorithm::try_from(raw).ok(),
                expected,
                "{raw} failed"
            );
        }
    }

    #[test]
    fn test_fingerprint_of() {
        let fingerprint = DtlsFingerprint::of(FingerprintAlgorithm::Sha256, CERT);
        assert_eq!(fingerprint.algorithm, "sha-256");
        assert_eq!(fingerprint.value.len(), 32 * 3 - 1);
        assert_eq!(fingerprint.value, fingerprint.value.to_uppercase());
        assert_eq!(fingerprint.validate().ok(), Some(FingerprintAlgorithm::Sha256));
    }

    #[test]
    fn test_fingerprint_matches() {
        let fingerprint = DtlsFingerprint::of(FingerprintAlgorithm::Sha512, CERT);
        let lowercase = DtlsFingerprint {
            algorithm: fingerprint.algorithm.clone(),
            value: fingerprint.value.to_lowercase(),
        };

        let tests = vec![
            ("same certificate", &fingerprint, CERT, true),
            ("lowercase value", &lowercase, CERT, true),
            ("other certificate", &fingerprint, &b"another one"[..], false),
        ];

        for (name, fingerprint, der, expected) in tests {
            assert_eq!(fingerprint.matches(der).unwrap(), expected, "{name} failed");
        }
    }

    #[test]
    fn test_fingerprint_validate_rejects() {
        let not_hex = "ZZ:".repeat(31);
        let tests = vec![
            ("unknown algorithm", "sha-1", "AB:CD"),
            ("short value", "sha-256", "AB:CD"),
            ("not hex", "sha-256", not_hex.as_str()),
        ];

        for (name, algorithm, value) in tests {
            let fingerprint = DtlsFingerprint {
                algorithm: algorithm.to_owned(),
                value: value.to_owned(),
            };
            assert!(fingerprint.validate().is_err(), "{name} failed");
        }
    }
}
