//! License response processing.
//!
//! The session key in a license is RSA-OAEP wrapped for the device key. Key
//! records are AES-128-CBC encrypted under a key derived from that session key
//! and the exact inner bytes of the request the license answers.

use hmac::{Hmac, Mac};
use prost::Message;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::crypto;
use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::key::{ContentKey, Padding};
use crate::license_protocol::signed_message::MessageType;
use crate::license_protocol::{License, SignedMessage};

type HmacSha256 = Hmac<Sha256>;

/// Decrypt the keys of `response`, a license answering `original_request`.
///
/// `original_request` is the serialized request envelope that was sent.
pub fn extract_keys(
    original_request: &[u8],
    response: &[u8],
    identity: &DeviceIdentity,
) -> Result<Vec<ContentKey>> {
    LicenseResponseProcessor::new(identity).extract_keys(original_request, response)
}

/// Configurable license response processing.
#[derive(Debug, Clone)]
pub struct LicenseResponseProcessor<'a> {
    identity: &'a DeviceIdentity,
    padding: Padding,
    verify_signature: bool,
}

impl<'a> LicenseResponseProcessor<'a> {
    pub fn new(identity: &'a DeviceIdentity) -> Self {
        Self {
            identity,
            padding: Padding::Lenient,
            verify_signature: false,
        }
    }

    /// Require well-formed PKCS#7 padding on every key record.
    pub fn strict_padding(mut self, strict: bool) -> Self {
        self.padding = if strict {
            Padding::Strict
        } else {
            Padding::Lenient
        };
        self
    }

    /// Check the license HMAC-SHA256 signature before decrypting keys.
    pub fn verify_signature(mut self, verify: bool) -> Self {
        self.verify_signature = verify;
        self
    }

    /// Decrypt the keys of `response` given the request envelope that was sent.
    pub fn extract_keys(&self, original_request: &[u8], response: &[u8]) -> Result<Vec<ContentKey>> {
        let (signed, license) = decode_license(response)?;
        let context = request_context(original_request)?;
        self.extract(&signed, &license, &context)
    }

    /// Decrypt the keys of `response` given the inner request bytes directly.
    pub fn extract_keys_with_context(&self, context: &[u8], response: &[u8]) -> Result<Vec<ContentKey>> {
        let (signed, license) = decode_license(response)?;
        self.extract(&signed, &license, context)
    }

    fn extract(
        &self,
        signed: &SignedMessage,
        license: &License,
        context: &[u8],
    ) -> Result<Vec<ContentKey>> {
        let wrapped = signed
            .session_key
            .as_deref()
            .ok_or_else(|| Error::MalformedResponse("Missing session key".to_string()))?;
        let session_key = self
            .identity
            .decrypt_oaep(wrapped)
            .map_err(|e| Error::SessionKeyRecoveryFailed(e.to_string()))?;

        if self.verify_signature {
            verify_license_signature(signed, &session_key, context)?;
        }

        let enc_key = crypto::derive_encryption_key(&session_key, context)?;

        let keys = license
            .key
            .iter()
            .map(|container| ContentKey::from_key_container(container, enc_key, self.padding))
            .collect::<Result<Vec<_>>>()?;

        debug!(count = keys.len(), "Decrypted license keys");
        Ok(keys)
    }
}

fn decode_license(response: &[u8]) -> Result<(SignedMessage, License)> {
    let signed = SignedMessage::decode(response).map_err(|e| {
        Error::MalformedResponse(format!("Failed to parse SignedMessage: {}", e))
    })?;

    if let Some(kind) = signed.r#type {
        if kind != MessageType::License as i32 {
            let name = MessageType::try_from(kind)
                .map(|t| t.as_str_name().to_string())
                .unwrap_or_else(|_| kind.to_string());
            return Err(Error::MalformedResponse(format!(
                "Expected LICENSE message, got {}",
                name
            )));
        }
    }

    let msg = signed
        .msg
        .as_deref()
        .ok_or_else(|| Error::MalformedResponse("Missing license message".to_string()))?;
    let license = License::decode(msg)
        .map_err(|e| Error::MalformedResponse(format!("Failed to parse License: {}", e)))?;

    Ok((signed, license))
}

/// The inner request bytes of a request envelope, taken verbatim.
fn request_context(original_request: &[u8]) -> Result<Vec<u8>> {
    let envelope = SignedMessage::decode(original_request).map_err(|e| {
        Error::MalformedResponse(format!("Failed to parse license request: {}", e))
    })?;
    match envelope.msg {
        Some(msg) if !msg.is_empty() => Ok(msg),
        _ => Err(Error::MalformedResponse(
            "License request has no message".to_string(),
        )),
    }
}

fn verify_license_signature(
    signed: &SignedMessage,
    session_key: &[u8],
    context: &[u8],
) -> Result<()> {
    let signature = signed
        .signature
        .as_deref()
        .ok_or_else(|| Error::SignatureMismatch("License has no signature".to_string()))?;
    let (server_key, _) = crypto::derive_mac_keys(session_key, context)?;

    let mut mac = HmacSha256::new_from_slice(&server_key)
        .map_err(|e| Error::CryptoFailure(format!("Invalid HMAC key: {}", e)))?;
    if let Some(core) = signed.oemcrypto_core_message.as_deref() {
        mac.update(core);
    }
    mac.update(signed.msg.as_deref().unwrap_or_default());

    mac.verify_slice(signature).map_err(|_| {
        warn!("License signature does not match");
        Error::SignatureMismatch("License signature does not match".to_string())
    })
}
