//! wvlicense - client side of the Widevine license protocol.
//!
//! This crate provides:
//! - Widevine protection header lookup in DASH manifests and PSSH parsing.
//! - Device identities from PEM/DER keys or `.wvd` files, with optional
//!   service certificates for privacy mode.
//! - Signed license request construction.
//! - License response processing into decrypted content keys.
//!
//! Feature flags:
//! - `cli`: build the `wvlicense` command-line binary.
#![allow(clippy::result_large_err)]

/// Symmetric primitives: padding, AES-CBC, CMAC key derivation.
pub mod crypto;
/// Device identity and service certificates.
pub mod device;
/// Common error types and Result alias.
pub mod error;
/// Decrypted key representation.
pub mod key;
/// License protocol message definitions.
pub mod license_protocol;
/// Protection header lookup in DASH manifests.
pub mod mpd;
/// PSSH parsing.
pub mod pssh;
/// License request construction.
pub mod request;
/// License response processing.
pub mod response;
/// License sessions.
pub mod session;

#[cfg(test)]
mod fixtures;

pub use device::{DeviceIdentity, ServiceCertificate};
pub use error::{Error, Result};
pub use key::ContentKey;
pub use pssh::ProtectionHeader;
pub use request::{LicenseChallenge, LicenseRequestBuilder};
pub use response::{extract_keys, LicenseResponseProcessor};
pub use session::Session;
