use aes_gcm::{
    aead::{AeadMutInPlace, KeyInit},
    Key,
};
use p224::{elliptic_curve::ecdh, PublicKey, SecretKey};
use sha2_pre::Sha256;

use crate::{
    error::{Error, Result},
    protocol::{Aes, EncryptedReportPayload, Location},
};

/// The owner side of the report exchange: holds nothing, decrypts reports
/// with the accessory private key the caller supplies.
pub struct OwnerDevice();

impl OwnerDevice {
    /// Decrypt one location report.
    ///
    /// Performs ECDH between the accessory private key and the finder's
    /// ephemeral public key, derives the AES key and IV with a one-block
    /// ANSI X9.63 KDF keyed on the exact wire encoding of the ephemeral
    /// key, and opens the AES-128-GCM ciphertext. A tag mismatch is a hard
    /// failure; no partial plaintext is ever returned.
    pub fn decrypt_report(
        &self,
        accessory_private_key: &SecretKey,
        encrypted_report: &EncryptedReportPayload,
    ) -> Result<Location> {
        let finder_public_key = PublicKey::from_sec1_bytes(&encrypted_report.finder_public_key)
            .map_err(|e| Error::Decode(format!("finder ephemeral public key: {e}")))?;

        let shared_secret = ecdh::diffie_hellman(
            accessory_private_key.to_nonzero_scalar(),
            finder_public_key.as_affine(),
        );

        // One 32-byte block with the counter fixed at 1:
        // SHA-256(secret || 0x00000001 || ephemeral public key bytes).
        let mut symmetric_key = [0u8; 32];
        ansi_x963_kdf::derive_key_into::<Sha256>(
            shared_secret.raw_secret_bytes(),
            &encrypted_report.finder_public_key,
            &mut symmetric_key,
        )
        .map_err(|e| Error::Decode(format!("key derivation: {e}")))?;

        let (encryption_key, iv) = symmetric_key.split_at(16);

        let key = Key::<Aes>::from_slice(encryption_key);
        let mut cipher = Aes::new(key);

        let mut decrypted_location = encrypted_report.encrypted_location; // bytes are `Copy`'ed here
        cipher
            .decrypt_in_place_detached(
                iv.into(),
                &[],
                &mut decrypted_location,
                (&encrypted_report.tag).into(),
            )
            .map_err(|_| Error::AuthenticationFailure)?;

        Ok(Location::from_bytes(&decrypted_location))
    }
}
