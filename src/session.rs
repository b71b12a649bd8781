//! License sessions.
//!
//! A session only carries the request id that ties a license request to the
//! license issued for it.

use std::fmt;

use rsa::rand_core::{OsRng, RngCore};

use crate::error::{Error, Result};

const SESSION_ID_CHARSET: &[u8; 16] = b"ABCDEF0123456789";

/// Length of a session id in bytes.
pub const SESSION_ID_LEN: usize = 32;

/// A Widevine license session.
///
/// Session ids are 32 ASCII bytes: 16 random characters from
/// `ABCDEF0123456789`, then `01`, then fourteen `0`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Session {
    id: [u8; SESSION_ID_LEN],
}

impl Session {
    /// Create a session with a fresh random id.
    pub fn new() -> Self {
        let mut random = [0u8; 16];
        OsRng.fill_bytes(&mut random);

        let mut id = [b'0'; SESSION_ID_LEN];
        for (slot, byte) in id.iter_mut().zip(random.iter()) {
            *slot = SESSION_ID_CHARSET[(byte & 0x0f) as usize];
        }
        id[16] = b'0';
        id[17] = b'1';

        Self { id }
    }

    /// Rebuild a session from a previously issued id.
    pub fn from_id(id: &[u8]) -> Result<Self> {
        let id: [u8; SESSION_ID_LEN] = id.try_into().map_err(|_| {
            Error::DecodeError(format!(
                "Session id must be {} bytes, got {}",
                SESSION_ID_LEN,
                id.len()
            ))
        })?;
        Ok(Self { id })
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &String::from_utf8_lossy(&self.id))
            .finish()
    }
}
