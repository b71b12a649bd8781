//! Widevine protection header (PSSH) parsing.
//!
//! A protection header arrives either as a full `pssh` box or as the bare
//! `WidevinePsshData` record that a box carries. Either way the record bytes
//! are kept verbatim, since they are embedded unchanged into license requests.
use std::str::FromStr;

use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use prost::Message;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::license_protocol::WidevinePsshData;

/// Widevine DRM system id.
pub const WIDEVINE_SYSTEM_ID: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);

/// A parsed, read-only Widevine protection header.
#[derive(Debug, Clone)]
pub struct ProtectionHeader {
    version: u8,
    flags: u32,
    key_ids: Vec<Uuid>,
    init_data: Vec<u8>,
    data: WidevinePsshData,
}

impl ProtectionHeader {
    /// Parse a `pssh` box or a bare `WidevinePsshData` record.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidInitData("Data must not be empty".to_string()));
        }

        match parse_pssh_box(data) {
            Ok(header) => Ok(header),
            Err(box_err) => Self::from_init_data(0, 0, Vec::new(), data.to_vec()).map_err(|_| box_err),
        }
    }

    /// Parse a base64 encoded `pssh` box or `WidevinePsshData` record.
    pub fn from_base64(data_b64: &str) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD.decode(data_b64.trim())?;
        Self::from_bytes(&data)
    }

    fn from_init_data(version: u8, flags: u32, key_ids: Vec<Uuid>, init_data: Vec<u8>) -> Result<Self> {
        let data = WidevinePsshData::decode(init_data.as_slice()).map_err(|e| {
            Error::InvalidInitData(format!("Failed to parse WidevinePsshData: {}", e))
        })?;

        Ok(Self {
            version,
            flags,
            key_ids,
            init_data,
            data,
        })
    }

    /// Box version (0 when parsed from a bare record).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// The `WidevinePsshData` bytes exactly as received.
    pub fn init_data(&self) -> &[u8] {
        &self.init_data
    }

    /// The decoded `WidevinePsshData` record.
    pub fn data(&self) -> &WidevinePsshData {
        &self.data
    }

    /// Key ids from the v1 box header, or from the record when the box has none.
    pub fn key_ids(&self) -> Vec<Uuid> {
        if !self.key_ids.is_empty() {
            return self.key_ids.clone();
        }
        self.data
            .key_ids
            .iter()
            .map(|kid| parse_key_id_bytes(kid))
            .collect()
    }

    /// Serialize as a full `pssh` box.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_pssh_box(self)
    }

    /// Serialize as a base64 `pssh` box.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }
}

impl FromStr for ProtectionHeader {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProtectionHeader::from_base64(s)
    }
}

fn parse_pssh_box(data: &[u8]) -> Result<ProtectionHeader> {
    if data.len() < 8 {
        return Err(Error::InvalidInitData("Data too short".to_string()));
    }

    let mut offset = 0;
    let size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
    offset += 4;
    let box_type = &data[offset..offset + 4];
    offset += 4;

    if box_type != b"pssh" {
        return Err(Error::InvalidInitData("Not a PSSH box".to_string()));
    }

    let mut actual_size = size;
    if size == 1 {
        if data.len() < 16 {
            return Err(Error::InvalidInitData("Data too short".to_string()));
        }
        actual_size = BigEndian::read_u64(&data[offset..offset + 8]) as usize;
        offset += 8;
    } else if size == 0 {
        actual_size = data.len();
    }

    if actual_size > data.len() {
        return Err(Error::InvalidInitData("PSSH size exceeds data length".to_string()));
    }

    if data.len() < offset + 4 + 16 {
        return Err(Error::InvalidInitData("PSSH header incomplete".to_string()));
    }

    let version = data[offset];
    let flags = BigEndian::read_u24(&data[offset + 1..offset + 4]);
    offset += 4;

    let system_id = Uuid::from_slice(&data[offset..offset + 16])
        .map_err(|_| Error::InvalidInitData("Invalid system ID".to_string()))?;
    offset += 16;

    if system_id != WIDEVINE_SYSTEM_ID {
        return Err(Error::InvalidInitData(format!(
            "Unsupported system ID {}",
            system_id
        )));
    }

    let mut key_ids = Vec::new();
    if version == 1 {
        if data.len() < offset + 4 {
            return Err(Error::InvalidInitData("Missing KID count".to_string()));
        }
        let kid_count = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
        offset += 4;

        let required = kid_count
            .checked_mul(16)
            .and_then(|n| n.checked_add(offset))
            .ok_or_else(|| Error::InvalidInitData("KID count overflow".to_string()))?;
        if data.len() < required {
            return Err(Error::InvalidInitData("Missing KIDs".to_string()));
        }
        for chunk in data[offset..required].chunks_exact(16) {
            key_ids.push(Uuid::from_slice(chunk).unwrap_or_else(|_| Uuid::nil()));
        }
        offset = required;
    } else if version != 0 {
        return Err(Error::InvalidInitData(format!(
            "Invalid version: {}",
            version
        )));
    }

    if data.len() < offset + 4 {
        return Err(Error::InvalidInitData("Missing init data length".to_string()));
    }
    let data_size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
    offset += 4;
    if data.len() < offset + data_size {
        return Err(Error::InvalidInitData("Missing init data".to_string()));
    }
    let init_data = data[offset..offset + data_size].to_vec();

    ProtectionHeader::from_init_data(version, flags, key_ids, init_data)
}

fn build_pssh_box(header: &ProtectionHeader) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(header.version);
    let mut flags = [0u8; 3];
    BigEndian::write_u24(&mut flags, header.flags);
    body.extend_from_slice(&flags);
    body.extend_from_slice(WIDEVINE_SYSTEM_ID.as_bytes());

    if header.version == 1 {
        body.extend_from_slice(&(header.key_ids.len() as u32).to_be_bytes());
        for kid in header.key_ids.iter() {
            body.extend_from_slice(kid.as_bytes());
        }
    }

    body.extend_from_slice(&(header.init_data.len() as u32).to_be_bytes());
    body.extend_from_slice(&header.init_data);

    let size = (body.len() + 8) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(b"pssh");
    out.extend_from_slice(&body);
    out
}

/// Normalize a key id to a UUID.
///
/// 16 bytes are used as-is, 32 bytes of hex text are parsed, anything else is
/// right-aligned into 16 bytes.
pub(crate) fn parse_key_id_bytes(key_id: &[u8]) -> Uuid {
    if key_id.len() == 16 {
        return Uuid::from_slice(key_id).unwrap_or_else(|_| Uuid::nil());
    }

    if key_id.len() == 32 {
        if let Ok(s) = std::str::from_utf8(key_id) {
            if let Ok(uuid) = Uuid::parse_str(s) {
                return uuid;
            }
        }
    }

    let mut buf = [0u8; 16];
    if key_id.len() >= 16 {
        buf.copy_from_slice(&key_id[key_id.len() - 16..]);
    } else {
        buf[16 - key_id.len()..].copy_from_slice(key_id);
    }
    Uuid::from_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PSSH_B64: &str = "AAAAW3Bzc2gAAAAA7e+LqXnWSs6jyCfc1R0h7QAAADsIARIQ62dqu8s0Xpa7z2FmMPGj2hoNd2lkZXZpbmVfdGVzdCIQZmtqM2xqYVNkZmFsa3IzaioCSEQyAA==";

    #[test]
    fn parses_v0_box() {
        let header = ProtectionHeader::from_base64(TEST_PSSH_B64).expect("parse pssh");
        assert_eq!(header.version(), 0);
        assert_eq!(header.flags(), 0);
        assert_eq!(header.init_data().len(), 0x3b);
        assert_eq!(header.data().provider.as_deref(), Some("widevine_test"));
        assert_eq!(
            header.key_ids(),
            vec![Uuid::parse_str("eb676abbcb345e96bbcf616630f1a3da").unwrap()]
        );
    }

    #[test]
    fn box_roundtrip_is_byte_identical() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(TEST_PSSH_B64)
            .unwrap();
        let header = ProtectionHeader::from_bytes(&bytes).expect("parse pssh");
        assert_eq!(header.to_bytes(), bytes);
        assert_eq!(header.to_base64(), TEST_PSSH_B64);
    }

    #[test]
    fn parses_bare_record() {
        let kid = Uuid::new_v4();
        let record = WidevinePsshData {
            key_ids: vec![kid.as_bytes().to_vec()],
            content_id: Some(b"content".to_vec()),
            ..Default::default()
        };
        let init_data = record.encode_to_vec();

        let header = ProtectionHeader::from_bytes(&init_data).expect("parse record");
        assert_eq!(header.init_data(), init_data.as_slice());
        assert_eq!(header.key_ids(), vec![kid]);
        assert_eq!(header.data().content_id.as_deref(), Some(&b"content"[..]));
    }

    #[test]
    fn v1_box_key_ids_take_precedence() {
        let box_kid = Uuid::new_v4();
        let record_kid = Uuid::new_v4();
        let init_data = WidevinePsshData {
            key_ids: vec![record_kid.as_bytes().to_vec()],
            ..Default::default()
        }
        .encode_to_vec();

        let mut data = Vec::new();
        data.push(1);
        data.extend_from_slice(&[0, 0, 0]);
        data.extend_from_slice(WIDEVINE_SYSTEM_ID.as_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(box_kid.as_bytes());
        data.extend_from_slice(&(init_data.len() as u32).to_be_bytes());
        data.extend_from_slice(&init_data);
        let mut boxed = ((data.len() + 8) as u32).to_be_bytes().to_vec();
        boxed.extend_from_slice(b"pssh");
        boxed.extend_from_slice(&data);

        let header = ProtectionHeader::from_bytes(&boxed).expect("parse v1 box");
        assert_eq!(header.version(), 1);
        assert_eq!(header.key_ids(), vec![box_kid]);
        assert_eq!(header.to_bytes(), boxed);
    }

    #[test]
    fn rejects_foreign_system_id() {
        let mut bytes = base64::engine::general_purpose::STANDARD
            .decode(TEST_PSSH_B64)
            .unwrap();
        bytes[12..28].copy_from_slice(&[0x9a; 16]);
        let err = ProtectionHeader::from_bytes(&bytes).expect_err("foreign system id");
        assert!(format!("{}", err).contains("system ID"));
    }

    #[test]
    fn empty_input_is_error() {
        let err = ProtectionHeader::from_base64("").expect_err("empty input should fail");
        assert!(format!("{}", err).contains("empty"));
    }

    #[test]
    fn short_key_ids_are_right_aligned() {
        let uuid = parse_key_id_bytes(&[0x01, 0x02]);
        assert_eq!(uuid.as_bytes()[14..], [0x01, 0x02]);
        assert!(uuid.as_bytes()[..14].iter().all(|&b| b == 0));
    }
}
