//! A client-side implementation of Apple's FindMy offline-finding protocol.
//!
//! The crate covers the three cryptographic surfaces of the protocol: P-224
//! accessory key material and its BLE advertisement encoding
//! ([`accessory`]), the GSA SRP authentication handshake ([`server::gsa`]),
//! and the per-report decryption pipeline ([`owner`], [`protocol`]).
//! Fetching crowd-sourced reports from Apple's servers is composed on top in
//! [`server::apple`].

/// Accessory key generation and recovery.
pub mod accessory;
/// The error taxonomy shared by every component.
pub mod error;
/// A finder device that encrypts location reports, as observers of an
/// accessory's advertisement do.
pub mod finder;
/// An owner device that decrypts location reports fetched from the server.
pub mod owner;
/// Structs that capture the wire formats of the FindMy protocol.
pub mod protocol;
/// Tools for interfacing with Apple's servers: authentication, second
/// factors, anisette attestation and report fetching.
pub mod server;

pub use error::{Error, Result};
pub use p224;
