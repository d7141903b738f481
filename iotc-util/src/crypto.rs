use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng as _;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::encode::{SIGNATURE_SAFE, quote};

type HmacSha256 = Hmac<Sha256>;

/// All lowercase and uppercase letters and digits.
pub const ALPHA_NUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// The given secret is not valid base64.
///
/// Keys cannot be repaired locally, so this aborts the whole connect
/// sequence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("broken base64 secret: {0}")]
pub struct InvalidSecretFormat(String);

pub fn sha256_hex_digest<D: AsRef<[u8]>>(data: D) -> String {
    let mut hasher = Sha256::default();
    hasher.update(data.as_ref());
    let digest = hasher.finalize();
    format!("{digest:x}")
}

/// Returns a string of the given length picking characters from `charset`.
pub fn pseudorandom_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}

/// Decode a base64 secret
pub fn decode_secret(key: &str) -> Result<Vec<u8>, InvalidSecretFormat> {
    BASE64
        .decode(key.trim())
        .map_err(|err| InvalidSecretFormat(err.to_string()))
}

/// Compute the HMAC-SHA256 of `data` keyed with the base64 decoded `key`,
/// and return it base64 encoded.
pub fn sign(key: &str, data: &str) -> Result<String, InvalidSecretFormat> {
    let secret = decode_secret(key)?;
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(&secret)
        .map_err(|err| InvalidSecretFormat(err.to_string()))?;
    mac.update(data.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(BASE64.encode(digest))
}

/// Derive a per-device key from a group (enrollment) key.
///
/// ```
/// use iotc_util::crypto::derive_key;
///
/// let group_key = "r0mxLzPr9gg5DfsaxVhOwKK2+8jEHNclmCeb9iACAyb2A7yHPDrB2/+PTmwnTAetvI6oQkwarWHxYbkIVLybEg==";
/// let device_key = derive_key(group_key, "pytest").unwrap();
/// assert_eq!(device_key, "XLXPHX5ND3KBL0BU9Y4C3ZIg4/oSSv3QlYZ0eBfbQtE=");
/// ```
pub fn derive_key(group_key: &str, registration_id: &str) -> Result<String, InvalidSecretFormat> {
    sign(group_key, registration_id)
}

/// Seconds since the unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Inputs for a shared access signature
#[derive(Debug, Clone)]
pub struct SasToken<'a> {
    /// The resource the token grants access to, eg. `{hub}/devices/{id}`
    pub resource_uri: &'a str,
    /// Base64 encoded signing key
    pub key: &'a str,
    /// How long the token stays valid
    pub ttl: Duration,
    /// Optional policy name, `registration` for the provisioning service
    pub key_name: Option<&'a str>,
}

impl SasToken<'_> {
    /// Build the token, using the current system time.
    pub fn build(&self) -> Result<String, InvalidSecretFormat> {
        self.build_at(unix_now())
    }

    /// Build the token with expiry `now + ttl`.
    pub fn build_at(&self, now: u64) -> Result<String, InvalidSecretFormat> {
        let expiry = now + self.ttl.as_secs();
        let resource = quote(self.resource_uri, SIGNATURE_SAFE);
        let signature = sign(self.key, &format!("{resource}\n{expiry}"))?;
        // base64 output carries no line breaks but make sure nothing trails
        let signature = quote(signature.trim_end_matches('\n'), SIGNATURE_SAFE);

        let mut token = format!("SharedAccessSignature sr={resource}&sig={signature}&se={expiry}");
        if let Some(key_name) = self.key_name {
            token.push_str("&skn=");
            token.push_str(key_name);
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP_KEY: &str = "r0mxLzPr9gg5DfsaxVhOwKK2+8jEHNclmCeb9iACAyb2A7yHPDrB2/+PTmwnTAetvI6oQkwarWHxYbkIVLybEg==";
    const DEVICE_KEY: &str = "XLXPHX5ND3KBL0BU9Y4C3ZIg4/oSSv3QlYZ0eBfbQtE=";

    #[test]
    fn test_derive_key_matches_known_fixture() {
        assert_eq!(derive_key(GROUP_KEY, "pytest").unwrap(), DEVICE_KEY);
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let first = derive_key(GROUP_KEY, "device-1").unwrap();
        let second = derive_key(GROUP_KEY, "device-1").unwrap();
        assert_eq!(first, second);
        assert_ne!(first, derive_key(GROUP_KEY, "device-2").unwrap());
    }

    #[test]
    fn test_derive_key_with_wrong_group_key_differs() {
        let key = derive_key("XLXPHX5ND3KBL0BUg4/oSSv3QlYZ0eBfbQtE=", "pytest");
        // not a multiple of 4 characters
        assert!(key.is_err());

        let key = derive_key("ZGlmZmVyZW50LWtleQ==", "pytest").unwrap();
        assert_ne!(key, DEVICE_KEY);
    }

    #[test]
    fn test_derive_key_rejects_broken_base64() {
        let err = derive_key("not*base64", "pytest").unwrap_err();
        assert!(err.to_string().starts_with("broken base64 secret"));
    }

    #[test]
    fn test_sas_token_for_registration() {
        let token = SasToken {
            resource_uri: "0ne00000000/registrations/pytest",
            key: DEVICE_KEY,
            ttl: Duration::from_secs(3600),
            key_name: Some("registration"),
        }
        .build_at(1_699_996_400)
        .unwrap();

        assert_eq!(
            token,
            "SharedAccessSignature sr=0ne00000000%2Fregistrations%2Fpytest\
             &sig=3tXebbVcLXiVi7kX2%2FXM8SRvRC8g0a5f%2FEiHW6KoMms%3D\
             &se=1700000000&skn=registration"
        );
    }

    #[test]
    fn test_sas_token_without_key_name() {
        let token = SasToken {
            resource_uri: "hub.example.net/devices/dev1",
            key: DEVICE_KEY,
            ttl: Duration::from_secs(60),
            key_name: None,
        }
        .build_at(100)
        .unwrap();

        assert!(token.starts_with("SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdev1&sig="));
        assert!(token.ends_with("&se=160"));
        assert!(!token.contains("skn="));
    }

    #[test]
    fn test_sha256_hex_digest() {
        assert_eq!(
            sha256_hex_digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_pseudorandom_string() {
        let s = pseudorandom_string(ALPHA_NUM, 12);
        assert_eq!(s.len(), 12);
        assert!(s.bytes().all(|b| ALPHA_NUM.contains(&b)));
    }
}
