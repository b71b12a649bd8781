//! Decrypted content keys.
//!
//! Keys are recovered from the key containers of a License message by
//! AES-128-CBC decryption under the derived encryption key.

use std::fmt;

use uuid::Uuid;

use crate::crypto;
use crate::error::{Error, Result};
use crate::license_protocol::license::key_container::KeyType;
use crate::license_protocol::license::KeyContainer;
use crate::pssh::parse_key_id_bytes;

/// How trailing padding is removed from decrypted key records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    /// Strip as many bytes as the final byte says, without checking them.
    #[default]
    Lenient,
    /// Require well-formed PKCS#7 padding.
    Strict,
}

/// A decrypted key from a license.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentKey {
    /// Key id bytes as sent by the server (empty when absent).
    pub kid: Vec<u8>,
    pub key_type: KeyType,
    /// Decrypted key bytes.
    pub key: Vec<u8>,
    /// Permissions for OPERATOR_SESSION keys.
    pub permissions: Vec<String>,
}

impl ContentKey {
    /// Decrypt a key container with the derived encryption key.
    pub fn from_key_container(
        container: &KeyContainer,
        enc_key: [u8; 16],
        padding: Padding,
    ) -> Result<Self> {
        let key_type = container
            .r#type
            .and_then(|v| KeyType::try_from(v).ok())
            .ok_or_else(|| Error::MalformedResponse("Missing key type".to_string()))?;

        let encrypted = container
            .key
            .as_deref()
            .ok_or_else(|| Error::MalformedResponse("Missing key bytes".to_string()))?;
        let iv = container
            .iv
            .as_deref()
            .ok_or_else(|| Error::MalformedResponse("Missing key IV".to_string()))?;

        let decrypted = crypto::aes_cbc_decrypt(enc_key, iv, encrypted)?;
        let key = match padding {
            Padding::Lenient => crypto::unpad(&decrypted).to_vec(),
            Padding::Strict => crypto::unpad_strict(&decrypted)?.to_vec(),
        };

        let mut permissions = Vec::new();
        if key_type == KeyType::OperatorSession {
            if let Some(perms) = container.operator_session_key_permissions.as_ref() {
                let flags = [
                    ("allow_encrypt", perms.allow_encrypt),
                    ("allow_decrypt", perms.allow_decrypt),
                    ("allow_sign", perms.allow_sign),
                    ("allow_signature_verify", perms.allow_signature_verify),
                ];
                permissions.extend(
                    flags
                        .into_iter()
                        .filter(|(_, allowed)| allowed.unwrap_or(false))
                        .map(|(name, _)| name.to_string()),
                );
            }
        }

        Ok(Self {
            kid: container.id.clone().unwrap_or_default(),
            key_type,
            key,
            permissions,
        })
    }

    /// The key id as a UUID. An empty key id maps to the nil UUID.
    pub fn kid_uuid(&self) -> Uuid {
        if self.kid.is_empty() {
            return Uuid::nil();
        }
        parse_key_id_bytes(&self.kid)
    }

    pub fn kid_hex(&self) -> String {
        hex::encode(&self.kid)
    }

    pub fn key_hex(&self) -> String {
        hex::encode(&self.key)
    }
}

impl fmt::Display for ContentKey {
    /// `kid:key` in lowercase hex, the form decryption tools take.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kid_hex(), self.key_hex())
    }
}
