use base64::{engine::general_purpose::STANDARD as b64, Engine as _};
use p224::{
    elliptic_curve::sec1::{CompressedPoint, Tag, ToEncodedPoint},
    NistP224, PublicKey, SecretKey,
};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Marks a BLE address as static-random.
const TWO_MOST_SIGNIFICANT_BITS_MASK: u8 = 0b1100_0000;

/// Apple manufacturer-data prefix of an offline-finding advertisement:
/// company ID 0x004C, type 0x12 (offline finding), length 0x19.
pub const ADVERTISEMENT_PREFIX: [u8; 4] = [0x4c, 0x00, 0x12, 0x19];

/// Default accessory state byte carried in the advertisement.
pub const DEFAULT_STATE_BYTE: u8 = 0x20;

/// The X coordinate of an accessory's P-224 public key, as broadcast over
/// BLE and hashed into the server-side search identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineFindingPublicKey(pub [u8; 28]);

impl OfflineFindingPublicKey {
    /// Parse a public key from raw bytes.
    ///
    /// Inputs shorter than 28 bytes are rejected; longer inputs are
    /// truncated to their first 28 bytes with a warning, as some key
    /// exports carry trailing material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 28 {
            return Err(Error::InvalidKeyLength {
                actual: bytes.len(),
            });
        }
        if bytes.len() > 28 {
            tracing::warn!(
                len = bytes.len(),
                "public key longer than 28 bytes, using the first 28"
            );
        }

        Ok(Self(bytes[..28].try_into().expect("length checked above")))
    }

    /// Parse a public key from its base64 encoding.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        Self::from_bytes(&b64.decode(encoded)?)
    }

    /// SHA-256 digest of the key bytes, used as the report search
    /// identifier on Apple's servers.
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.0).into()
    }

    /// Base64 rendering of [`Self::hash`].
    pub fn hash_base64(&self) -> String {
        b64.encode(self.hash())
    }

    /// The BLE static-random address an accessory broadcasting this key
    /// uses, in big-endian byte order.
    pub fn to_ble_address_bytes_be(&self) -> [u8; 6] {
        let mut addr_bytes_be: [u8; 6] = self.0[..6]
            .try_into()
            .expect("there are exactly six elements in the slice");
        addr_bytes_be[0] |= TWO_MOST_SIGNIFICANT_BITS_MASK;

        addr_bytes_be
    }

    /// Colonless uppercase hex rendering of the BLE address.
    pub fn ble_address_hex(&self) -> String {
        hex::encode_upper(self.to_ble_address_bytes_be())
    }

    /// The manufacturer-data bytes of the offline-finding advertisement.
    ///
    /// Layout: the fixed Apple prefix, one state byte, the 22 key bytes the
    /// BLE address cannot carry, the top two bits of the first key byte,
    /// and the sixth key byte.
    pub fn to_ble_advertisement_data(&self, state: u8) -> [u8; 29] {
        let mut data = [0u8; 29];
        data[0..4].copy_from_slice(&ADVERTISEMENT_PREFIX);
        data[4] = state;
        data[5..27].copy_from_slice(&self.0[6..28]);
        data[27] = (self.0[0] >> 6) & 0x03;
        data[28] = self.0[5];

        data
    }

    /// Uppercase hex rendering of the advertisement payload with the
    /// default state byte.
    pub fn advertisement_hex(&self) -> String {
        hex::encode_upper(self.to_ble_advertisement_data(DEFAULT_STATE_BYTE))
    }

    /// Base64 rendering of the key bytes.
    pub fn to_base64(&self) -> String {
        b64.encode(self.0)
    }
}

impl From<&SecretKey> for OfflineFindingPublicKey {
    fn from(value: &SecretKey) -> Self {
        Self::from(&value.public_key())
    }
}

impl From<&PublicKey> for OfflineFindingPublicKey {
    fn from(value: &PublicKey) -> Self {
        let point = value.to_encoded_point(true);
        let key: [u8; 28] = point
            .x()
            .expect("the encoded point of a public key is never the identity")
            .as_slice()
            .try_into()
            .expect("the x coordinate of a P224 point is 28 bytes long");

        Self(key)
    }
}

impl From<&OfflineFindingPublicKey> for PublicKey {
    fn from(value: &OfflineFindingPublicKey) -> Self {
        let mut data = [0u8; 29];
        data[0] = Tag::CompressedEvenY.into(); // `Tag::CompressedOddY` would also work fine
        data[1..29].copy_from_slice(&value.0);

        let compressed_point: CompressedPoint<NistP224> = data.into();

        PublicKey::try_from(compressed_point)
            .expect("assuming the original public key was valid, the new one should also be valid")
    }
}
