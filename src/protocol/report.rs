use core::fmt::Debug;

use base64::{engine::general_purpose::STANDARD as b64, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// Seconds between the Unix epoch and Apple's reference date,
/// 2001-01-01T00:00:00Z. Report timestamps are seconds since the latter.
pub const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

/// Length of a serialized report payload once normalized.
const PAYLOAD_LEN: usize = 88;

/// The location information carried inside a report's ciphertext.
#[derive(PartialEq, Debug, Clone, Serialize)]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Confidence in the fix, 0-255.
    pub confidence: u8,
    /// Status byte of the accessory, as included in the BLE advertisement.
    pub status: u8,
}

impl Location {
    /// Serialize the location into FindMy's canonical 10-byte
    /// representation: two big-endian fixed-point coordinates scaled by
    /// `1e7`, then the confidence and status bytes.
    pub fn to_bytes(&self) -> [u8; 10] {
        let mut output = [0u8; 10];
        output[0..4].copy_from_slice(&((self.latitude * 1e7).round() as i32).to_be_bytes());
        output[4..8].copy_from_slice(&((self.longitude * 1e7).round() as i32).to_be_bytes());
        output[8] = self.confidence;
        output[9] = self.status;

        output
    }

    /// Deserialize the location from FindMy's canonical 10-byte
    /// representation.
    pub fn from_bytes(bytes: &[u8; 10]) -> Self {
        let latitude =
            i32::from_be_bytes(bytes[0..4].try_into().expect("correctly-sized slice"));
        let longitude =
            i32::from_be_bytes(bytes[4..8].try_into().expect("correctly-sized slice"));

        Self {
            latitude: f64::from(latitude) / 1e7,
            longitude: f64::from(longitude) / 1e7,
            confidence: bytes[8],
            status: bytes[9],
        }
    }
}

/// A location report as fetched from Apple's servers, before decryption.
///
/// Wire layout after normalization: a 4-byte big-endian Apple-epoch
/// timestamp, one status/confidence byte, the finder's 57-byte uncompressed
/// SEC1 ephemeral public key, 10 bytes of ciphertext and a 16-byte GCM tag.
#[derive(Clone)]
pub struct EncryptedReportPayload {
    /// When the finder observed the accessory.
    pub timestamp: DateTime<Utc>,
    /// The byte at offset 4 of the wire payload; not covered by the
    /// ciphertext and not interpreted here.
    pub confidence: u8,
    /// The finder's ephemeral public key, kept in its exact wire encoding
    /// because it feeds the key derivation verbatim.
    pub finder_public_key: [u8; 57],
    /// AES-128-GCM ciphertext of the 10-byte location encoding.
    pub encrypted_location: [u8; 10],
    /// GCM authentication tag.
    pub tag: [u8; 16],
}

impl EncryptedReportPayload {
    /// Parse a report payload from its wire bytes.
    ///
    /// Payloads longer than 88 bytes carry one extra length/flags byte at
    /// offset 4; exactly that byte is removed before any other offset math.
    /// Anything that does not end up at 88 bytes is rejected.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let bytes = Self::normalize(data);
        if bytes.len() != PAYLOAD_LEN {
            return Err(Error::Decode(format!(
                "report payload must normalize to {PAYLOAD_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let seconds = u32::from_be_bytes(bytes[0..4].try_into().expect("correctly-sized slice"));
        let timestamp = Utc
            .timestamp_opt(i64::from(seconds) + APPLE_EPOCH_OFFSET, 0)
            .single()
            .ok_or_else(|| Error::Decode("report timestamp out of range".into()))?;

        Ok(Self {
            timestamp,
            confidence: bytes[4],
            finder_public_key: bytes[5..62].try_into().expect("correctly-sized slice"),
            encrypted_location: bytes[62..72].try_into().expect("correctly-sized slice"),
            tag: bytes[72..88].try_into().expect("correctly-sized slice"),
        })
    }

    /// Parse a report payload from its base64 encoding.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        Self::deserialize(&b64.decode(encoded)?)
    }

    /// Strip the extra byte at offset 4 present in the extended wire form.
    fn normalize(data: &[u8]) -> Vec<u8> {
        if data.len() > PAYLOAD_LEN {
            let mut bytes = Vec::with_capacity(data.len() - 1);
            bytes.extend_from_slice(&data[..4]);
            bytes.extend_from_slice(&data[5..]);
            bytes
        } else {
            data.to_vec()
        }
    }

    /// Serialize the payload into its 88-byte legacy wire form.
    pub fn serialize(&self) -> [u8; 88] {
        let seconds =
            u32::try_from(self.timestamp.timestamp() - APPLE_EPOCH_OFFSET).unwrap_or(0);

        let mut output = [0u8; 88];
        output[0..4].copy_from_slice(&seconds.to_be_bytes());
        output[4] = self.confidence;
        output[5..62].copy_from_slice(&self.finder_public_key);
        output[62..72].copy_from_slice(&self.encrypted_location);
        output[72..88].copy_from_slice(&self.tag);

        output
    }
}

impl Debug for EncryptedReportPayload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EncryptedReportPayload")
            .field("timestamp", &self.timestamp)
            .field("confidence", &self.confidence)
            .field("finder_public_key", &b64.encode(self.finder_public_key))
            .field(
                "encrypted_location",
                &hex::encode_upper(self.encrypted_location),
            )
            .field("tag", &hex::encode_upper(self.tag))
            .finish()
    }
}

/// A decrypted location fix, ready for presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationReport {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Confidence in the fix, as carried in the ciphertext.
    pub confidence: u8,
    /// Accessory status byte.
    pub status: u8,
    /// When the finder observed the accessory, as a Unix timestamp.
    pub timestamp: i64,
    /// ISO-8601 rendering of [`Self::timestamp`].
    pub isodatetime: String,
    /// Base64 SHA-256 hash of the accessory public key this report was
    /// published under.
    pub hashed_public_key: String,
}

impl LocationReport {
    /// Combine a decrypted location with its report metadata.
    pub fn new(
        location: Location,
        observed_at: DateTime<Utc>,
        hashed_public_key: String,
    ) -> Self {
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
            confidence: location.confidence,
            status: location.status,
            timestamp: observed_at.timestamp(),
            isodatetime: observed_at.to_rfc3339(),
            hashed_public_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> [u8; 88] {
        let mut payload = [0u8; 88];
        payload[0..4].copy_from_slice(&0x0102_0304u32.to_be_bytes());
        payload[4] = 0xaa;
        for (i, byte) in payload[5..62].iter_mut().enumerate() {
            *byte = i as u8;
        }
        payload[62..72].copy_from_slice(&[0xbb; 10]);
        payload[72..88].copy_from_slice(&[0xcc; 16]);
        payload
    }

    #[test]
    fn test_location_roundtrip() {
        let location = Location {
            latitude: 37.0,
            longitude: -73.5,
            confidence: 5,
            status: 0,
        };

        assert_eq!(location, Location::from_bytes(&location.to_bytes()));
    }

    #[test]
    fn test_location_fixed_point_scale() {
        let location = Location {
            latitude: 1.0,
            longitude: -1.0,
            confidence: 0,
            status: 0,
        };

        let bytes = location.to_bytes();
        assert_eq!(&bytes[0..4], &10_000_000i32.to_be_bytes());
        assert_eq!(&bytes[4..8], &(-10_000_000i32).to_be_bytes());
    }

    #[test]
    fn test_deserialize_legacy_payload() {
        let payload = sample_payload();
        let report = EncryptedReportPayload::deserialize(&payload).unwrap();

        assert_eq!(
            report.timestamp.timestamp(),
            0x0102_0304 + APPLE_EPOCH_OFFSET
        );
        assert_eq!(report.confidence, 0xaa);
        assert_eq!(report.finder_public_key[0], 0);
        assert_eq!(report.finder_public_key[56], 56);
        assert_eq!(report.encrypted_location, [0xbb; 10]);
        assert_eq!(report.tag, [0xcc; 16]);
    }

    #[test]
    fn test_deserialize_extended_payload_drops_byte_at_offset_four() {
        let payload = sample_payload();
        let mut extended = Vec::with_capacity(89);
        extended.extend_from_slice(&payload[..4]);
        extended.push(0xff); // length/flags byte of the extended form
        extended.extend_from_slice(&payload[4..]);
        assert_eq!(extended.len(), 89);

        let report = EncryptedReportPayload::deserialize(&extended).unwrap();
        let reference = EncryptedReportPayload::deserialize(&payload).unwrap();

        assert_eq!(report.timestamp, reference.timestamp);
        assert_eq!(report.confidence, reference.confidence);
        assert_eq!(report.finder_public_key, reference.finder_public_key);
        assert_eq!(report.encrypted_location, reference.encrypted_location);
        assert_eq!(report.tag, reference.tag);
    }

    #[test]
    fn test_deserialize_92_byte_payload_removes_exactly_one_byte() {
        // 92 bytes is still one byte over after normalization: reject, but
        // only after removing exactly one byte at offset 4.
        let mut oversized = vec![0u8; 92];
        oversized[4] = 0xff;
        let result = EncryptedReportPayload::deserialize(&oversized);

        assert!(matches!(result, Err(Error::Decode(ref msg)) if msg.contains("91")));
    }

    #[test]
    fn test_deserialize_short_payload_is_rejected_without_normalization() {
        let result = EncryptedReportPayload::deserialize(&[0u8; 85]);
        assert!(matches!(result, Err(Error::Decode(ref msg)) if msg.contains("85")));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let payload = sample_payload();
        let report = EncryptedReportPayload::deserialize(&payload).unwrap();

        assert_eq!(report.serialize(), payload);
    }
}
