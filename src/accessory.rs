use base64::{engine::general_purpose::STANDARD as b64, Engine as _};
use p224::SecretKey;
use rand_core::CryptoRngCore;
use serde::Serialize;

use crate::{
    error::{Error, Result},
    protocol::OfflineFindingPublicKey,
};

/// Generation attempts allowed per requested key before giving up.
const ATTEMPTS_PER_KEY: u32 = 1000;

/// An accessory key pair: the P-224 secret key and the public key in its
/// offline-finding encoding.
#[derive(Clone)]
pub struct AccessoryKey {
    secret_key: SecretKey,
    public_key: OfflineFindingPublicKey,
}

impl AccessoryKey {
    /// Generate a fresh random key pair.
    pub fn random(csprng: &mut impl CryptoRngCore) -> Self {
        let secret_key = SecretKey::random(csprng);
        let public_key = OfflineFindingPublicKey::from(&secret_key);

        Self {
            secret_key,
            public_key,
        }
    }

    /// Recompute the full key pair from a stored 28-byte private scalar.
    pub fn from_private_key_bytes(bytes: &[u8]) -> Result<Self> {
        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|e| Error::Decode(format!("private scalar: {e}")))?;
        let public_key = OfflineFindingPublicKey::from(&secret_key);

        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Recompute the full key pair from a base64-encoded private scalar.
    pub fn from_private_key_base64(encoded: &str) -> Result<Self> {
        Self::from_private_key_bytes(&b64.decode(encoded)?)
    }

    /// The private scalar. Never transmitted; callers own its secrecy.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// The public key in its 28-byte offline-finding encoding.
    pub fn public_key(&self) -> &OfflineFindingPublicKey {
        &self.public_key
    }

    /// Base64 rendering of the private scalar.
    pub fn private_key_base64(&self) -> String {
        b64.encode(self.secret_key.to_bytes())
    }

    /// The server-side search identifier for this key.
    pub fn hashed_public_key_base64(&self) -> String {
        self.public_key.hash_base64()
    }
}

/// One accepted key from a [`generate_keys`] batch, with its serial number
/// and the derived advertisement material.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedKey {
    /// Sequential serial number within the batch.
    pub serial: u32,
    /// Colonless uppercase hex BLE address.
    pub mac_address: String,
    /// Uppercase hex advertisement payload.
    pub advertisement: String,
    /// Base64 SHA-256 hash of the public key.
    pub hashed_public_key: String,
    /// Base64 private scalar.
    pub private_key: String,
    /// Base64 public key bytes.
    pub public_key: String,
}

impl From<(u32, &AccessoryKey)> for GeneratedKey {
    fn from((serial, key): (u32, &AccessoryKey)) -> Self {
        Self {
            serial,
            mac_address: key.public_key.ble_address_hex(),
            advertisement: key.public_key.advertisement_hex(),
            hashed_public_key: key.hashed_public_key_base64(),
            private_key: key.private_key_base64(),
            public_key: key.public_key.to_base64(),
        }
    }
}

/// Generate `count` accessory keys, assigning serial numbers from
/// `start_serial` upward.
///
/// A candidate is accepted iff its base64 hashed public key starts with
/// `prefix` and its first seven base64 characters contain no `/`; that byte
/// pattern cannot be carried safely through the downstream BLE/URL
/// encoding. The attempt budget is `count * 1000` candidates; hitting it
/// yields [`Error::ExhaustedAttempts`], which is a soft cap the caller may
/// retry with adjusted parameters.
pub fn generate_keys(
    csprng: &mut impl CryptoRngCore,
    count: usize,
    prefix: &str,
    start_serial: u32,
) -> Result<Vec<GeneratedKey>> {
    let budget = count as u32 * ATTEMPTS_PER_KEY;
    let mut attempts = 0u32;
    let mut accepted = Vec::with_capacity(count);

    while accepted.len() < count {
        if attempts >= budget {
            return Err(Error::ExhaustedAttempts {
                attempts,
                produced: accepted.len(),
            });
        }
        attempts += 1;

        let key = AccessoryKey::random(csprng);
        let hashed = key.hashed_public_key_base64();

        if !prefix.is_empty() && !hashed.starts_with(prefix) {
            continue;
        }
        if hashed[..7].contains('/') {
            continue;
        }

        let serial = start_serial + accepted.len() as u32;
        accepted.push(GeneratedKey::from((serial, &key)));
    }

    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD as b64, Engine as _};

    use super::*;

    #[test]
    fn test_generate_single_key() {
        let keys = generate_keys(&mut rand::rngs::OsRng, 1, "", 1).unwrap();

        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].serial, 1);

        let hash = b64.decode(&keys[0].hashed_public_key).unwrap();
        assert_eq!(hash.len(), 32);
    }

    #[test]
    fn test_generated_keys_avoid_slash_in_hash_prefix() {
        let keys = generate_keys(&mut rand::rngs::OsRng, 3, "", 1).unwrap();

        for key in &keys {
            assert!(!key.hashed_public_key[..7].contains('/'));
        }
    }

    #[test]
    fn test_serials_are_sequential_from_start() {
        let keys = generate_keys(&mut rand::rngs::OsRng, 3, "", 40).unwrap();
        let serials: Vec<_> = keys.iter().map(|k| k.serial).collect();

        assert_eq!(serials, vec![40, 41, 42]);
    }

    #[test]
    fn test_prefix_filter_is_respected() {
        let keys = generate_keys(&mut rand::rngs::OsRng, 1, "A", 1).unwrap();

        assert!(keys[0].hashed_public_key.starts_with('A'));
    }

    #[test]
    fn test_impossible_prefix_exhausts_budget() {
        // '#' never occurs in base64 output, so every candidate is refused.
        let result = generate_keys(&mut rand::rngs::OsRng, 1, "#", 1);

        assert!(matches!(
            result,
            Err(Error::ExhaustedAttempts {
                attempts: 1000,
                produced: 0
            })
        ));
    }

    #[test]
    fn test_from_private_key_reproduces_generation() {
        let generated = &generate_keys(&mut rand::rngs::OsRng, 1, "", 1).unwrap()[0];
        let recovered = AccessoryKey::from_private_key_base64(&generated.private_key).unwrap();
        let rederived = GeneratedKey::from((generated.serial, &recovered));

        assert_eq!(rederived.public_key, generated.public_key);
        assert_eq!(rederived.hashed_public_key, generated.hashed_public_key);
        assert_eq!(rederived.mac_address, generated.mac_address);
        assert_eq!(rederived.advertisement, generated.advertisement);
    }

    #[test]
    fn test_from_private_key_rejects_garbage() {
        assert!(matches!(
            AccessoryKey::from_private_key_bytes(&[0u8; 5]),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            AccessoryKey::from_private_key_base64("not base64!!!"),
            Err(Error::Decode(_))
        ));
    }
}
