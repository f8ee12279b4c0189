use aes_gcm::{
    aead::{AeadMutInPlace, KeyInit},
    Key,
};
use chrono::{DateTime, Utc};
use p224::{
    elliptic_curve::{ecdh, sec1::ToEncodedPoint},
    PublicKey,
};
use rand_core::CryptoRngCore;
use sha2_pre::Sha256;

use crate::{
    error::{Error, Result},
    protocol::{Aes, EncryptedReportPayload, Location, OfflineFindingPublicKey},
};

/// A finder device: observes an accessory's advertisement and publishes an
/// encrypted location report for it.
pub struct FinderDevice();

impl FinderDevice {
    /// Encrypt a location report for the accessory broadcasting
    /// `accessory_public_key`.
    pub fn encrypt_report(
        &self,
        csprng: &mut impl CryptoRngCore,
        accessory_public_key: &OfflineFindingPublicKey,
        timestamp: DateTime<Utc>,
        location: &Location,
    ) -> Result<EncryptedReportPayload> {
        // Fresh ephemeral key per report, ECDH against the advertised key.
        let finder_secret = ecdh::EphemeralSecret::random(csprng);
        let advertised_public_key = PublicKey::from(accessory_public_key);
        let shared_secret = finder_secret.diffie_hellman(&advertised_public_key);

        let finder_public_key_point = finder_secret.public_key().to_encoded_point(false);
        let finder_public_key: [u8; 57] = finder_public_key_point
            .as_bytes()
            .try_into()
            .expect("an uncompressed P224 point is 57 bytes long");

        let mut symmetric_key = [0u8; 32];
        ansi_x963_kdf::derive_key_into::<Sha256>(
            shared_secret.raw_secret_bytes().as_slice(),
            &finder_public_key,
            &mut symmetric_key,
        )
        .map_err(|e| Error::Decode(format!("key derivation: {e}")))?;

        // First 16 bytes are the AES key, the rest the IV.
        let (encryption_key, iv) = symmetric_key.split_at(16);

        let key = Key::<Aes>::from_slice(encryption_key);
        let mut cipher = Aes::new(key);

        let mut encrypted_location = location.to_bytes();
        let tag = cipher
            .encrypt_in_place_detached(iv.into(), &[], &mut encrypted_location)
            .map_err(|e| Error::Decode(format!("report encryption: {e}")))?;

        Ok(EncryptedReportPayload {
            timestamp,
            confidence: location.confidence,
            finder_public_key,
            encrypted_location,
            tag: tag.into(),
        })
    }
}
