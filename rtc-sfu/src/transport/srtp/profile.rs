use serde::Serialize;
use shared::error::{Error, Result};
use std::fmt;

/// SRTP protection profile negotiated by the DTLS `use_srtp` extension.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum SrtpProtectionProfile {
    #[serde(rename = "AEAD_AES_256_GCM")]
    AeadAes256Gcm,
    #[serde(rename = "AEAD_AES_128_GCM")]
    AeadAes128Gcm,
    #[serde(rename = "AES_CM_128_HMAC_SHA1_80")]
    Aes128CmHmacSha1_80,
    #[serde(rename = "AES_CM_128_HMAC_SHA1_32")]
    Aes128CmHmacSha1_32,
}

const AEAD_AES_256_GCM_STR: &str = "AEAD_AES_256_GCM";
const AEAD_AES_128_GCM_STR: &str = "AEAD_AES_128_GCM";
const AES_CM_128_HMAC_SHA1_80_STR: &str = "AES_CM_128_HMAC_SHA1_80";
const AES_CM_128_HMAC_SHA1_32_STR: &str = "AES_CM_128_HMAC_SHA1_32";

impl SrtpProtectionProfile {
    pub fn key_len(&self) -> usize {
        match self {
            SrtpProtectionProfile::AeadAes256Gcm => 32,
            SrtpProtectionProfile::AeadAes128Gcm
            | SrtpProtectionProfile::Aes128CmHmacSha1_80
            | SrtpProtectionProfile::Aes128CmHmacSha1_32 => 16,
        }
    }

    pub fn salt_len(&self) -> usize {
        match self {
            SrtpProtectionProfile::AeadAes256Gcm | SrtpProtectionProfile::AeadAes128Gcm => 12,
            SrtpProtectionProfile::Aes128CmHmacSha1_80
            | SrtpProtectionProfile::Aes128CmHmacSha1_32 => 14,
        }
    }

    /// Bytes of keying material to export from DTLS for both directions.
    pub fn keying_material_len(&self) -> usize {
        2 * (self.key_len() + self.salt_len())
    }
}

impl TryFrom<&str> for SrtpProtectionProfile {
    type Error = Error;

    fn try_from(raw: &str) -> Result<Self> {
        match raw {
            AEAD_AES_256_GCM_STR => Ok(SrtpProtectionProfile::AeadAes256Gcm),
            AEAD_AES_128_GCM_STR => Ok(SrtpProtectionProfile::AeadAes128Gcm),
            AES_CM_128_HMAC_SHA1_80_STR => Ok(SrtpProtectionProfile::Aes128CmHmacSha1_80),
            AES_CM_128_HMAC_SHA1_32_STR => Ok(SrtpProtectionProfile::Aes128CmHmacSha1_32),
            _ => Err(Error::ErrSrtpUnsupportedProfile(raw.to_owned())),
        }
    }
}

impl fmt::Display for SrtpProtectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            SrtpProtectionProfile::AeadAes256Gcm => AEAD_AES_256_GCM_STR,
            SrtpProtectionProfile::AeadAes128Gcm => AEAD_AES_128_GCM_STR,
            SrtpProtectionProfile::Aes128CmHmacSha1_80 => AES_CM_128_HMAC_SHA1_80_STR,
            SrtpProtectionProfile::Aes128CmHmacSha1_32 => AES_CM_128_HMAC_SHA1_32_STR,
        };
        write!(f, "{s}")
    }
}

/// Master key and salt of both directions, split out of the DTLS exporter
/// output (`client key | server key | client salt | server salt`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpKeys {
    pub profile: SrtpProtectionProfile,
    /// Key followed by salt used to protect what this side sends.
    pub local_master_key: Vec<u8>,
    /// Key followed by salt used to unprotect what the peer sends.
    pub remote_master_key: Vec<u8>,
}

impl SrtpKeys {
    pub fn from_keying_material(
        profile: SrtpProtectionProfile,
        keying_material: &[u8],
        is_client: bool,
    ) -> Result<Self> {
        let expected = profile.keying_material_len();
        if keying_material.len() < expected {
            return Err(Error::ErrSrtpKeyingMaterialTooShort(
                expected,
                keying_material.len(),
            ));
        }

        let key_len = profile.key_len();
        let salt_len = profile.salt_len();

        let mut offset = 0;
        let client_key = &keying_material[offset..offset + key_len];
        offset += key_len;
        let server_key = &keying_material[offset..offset + key_len];
        offset += key_len;
        let client_salt = &keying_material[offset..offset + salt_len];
        offset += salt_len;
        let server_salt = &keying_material[offset..offset + salt_len];

        let client_master_key = [client_key, client_salt].concat();
        let server_master_key = [server_key, server_salt].concat();

        let (local_master_key, remote_master_key) = if is_client {
            (client_master_key, server_master_key)
        } else {
            (server_master_key, client_master_key)
        };

        Ok(Self {
            profile,
            local_master_key,
            remote_master_key,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_profile_lengths() {
        let tests = vec![
            (SrtpProtectionProfile::AeadAes256Gcm, "AEAD_AES_256_GCM", 32, 12),
            (SrtpProtectionProfile::AeadAes128Gcm, "AEAD_AES_128_GCM", 16, 12),
            (SrtpProtectionProfile::Aes128CmHmacSha1_80, "AES_CM_128_HMAC_SHA1_80", 16, 14),
            (SrtpProtectionProfile::Aes128CmHmacSha1_32, "AES_CM_128_HMAC_SHA1_32", 16, 14),
        ];

        for (profile, name, key_len, salt_len) in tests {
            assert_eq!(profile.to_string(), name);
            assert_eq!(SrtpProtectionProfile::try_from(name).ok(), Some(profile));
            assert_eq!(profile.key_len(), key_len, "{name} failed");
            assert_eq!(profile.salt_len(), salt_len, "{name} failed");
            assert_eq!(profile.keying_material_len(), 2 * (key_len + salt_len));
        }
    }

    #[test]
    fn test_keys_from_keying_material() {
        let profile = SrtpProtectionProfile::Aes128CmHmacSha1_80;
        let keying_material: Vec<u8> = (0..60).collect();

        let client = SrtpKeys::from_keying_material(profile, &keying_material, true).unwrap();
        let server = SrtpKeys::from_keying_material(profile, &keying_material, false).unwrap();

        let client_key: Vec<u8> = (0..16).chain(32..46).collect();
        let server_key: Vec<u8> = (16..32).chain(46..60).collect();

        assert_eq!(client.local_master_key, client_key);
        assert_eq!(client.remote_master_key, server_key);
        assert_eq!(server.local_master_key, server_key);
        assert_eq!(server.remote_master_key, client_key);
    }

    #[test]
    fn test_keys_too_short() {
        let result = SrtpKeys::from_keying_material(
            SrtpProtectionProfile::AeadAes256Gcm,
            &[0u8; 40],
            true,
        );
        assert_eq!(
            result.err(),
            Some(Error::ErrSrtpKeyingMaterialTooShort(88, 40))
        );
    }
}
