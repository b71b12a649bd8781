//! Error types for wvlicense.

use thiserror::Error;

/// Main error type for wvlicense operations.
///
/// Every variant is terminal for the license attempt that produced it; nothing
/// in the library retries.
#[derive(Debug, Error)]
pub enum Error {
    /// The private key could not be decoded as PKCS#1 or PKCS#8.
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    /// The manifest carries no Widevine protection header.
    #[error("No Widevine protection header found")]
    NotFound,

    /// The manifest is not well-formed XML.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Privacy mode was requested but no service certificate is installed.
    #[error("Privacy mode unavailable: no service certificate installed")]
    PrivacyModeUnavailable,

    /// The service certificate is undecodable or only partially populated.
    #[error("Invalid service certificate: {0}")]
    InvalidCertificate(String),

    /// The Widevine Cenc Header Data is invalid or empty.
    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    /// A license exchange envelope or record is invalid. Covers the response
    /// and the retained request it is matched against.
    #[error("Malformed license response: {0}")]
    MalformedResponse(String),

    /// The session key in the response could not be decrypted.
    #[error("Failed to recover session key: {0}")]
    SessionKeyRecoveryFailed(String),

    /// A signing, encryption, decryption or derivation primitive failed.
    #[error("Crypto failure: {0}")]
    CryptoFailure(String),

    /// The Signature did not match.
    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    /// Invalid WVD file.
    #[error("Invalid WVD file: {0}")]
    InvalidWvdFile(String),

    /// Failed to decode data.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Failed to parse protobuf message.
    #[error("Protobuf decode error: {0}")]
    ProtobufDecodeError(#[from] prost::DecodeError),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<rsa::Error> for Error {
    fn from(err: rsa::Error) -> Self {
        Error::CryptoFailure(err.to_string())
    }
}

/// Result type alias for wvlicense operations.
pub type Result<T> = std::result::Result<T, Error>;
