//! Symmetric primitives shared by the request builder and response processor.
//!
//! Covers PKCS#7 padding, AES-128-CBC without implicit padding, the AES-CMAC
//! key derivation used by the license protocol, and CSPRNG helpers.
use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cmac::{Cmac, Mac};
use rsa::rand_core::{OsRng, RngCore};

use crate::error::{Error, Result};

type CmacAes128 = Cmac<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Label of the key-record encryption key derivation.
pub const ENCRYPTION_LABEL: &[u8] = b"ENCRYPTION";
/// Label of the MAC key derivation.
pub const AUTHENTICATION_LABEL: &[u8] = b"AUTHENTICATION";

/// PKCS#7-pad `data` to a 16-byte boundary.
///
/// Already aligned input (including empty input) gets a full extra block.
#[must_use]
pub fn pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.resize(data.len() + pad_len, pad_len as u8);
    out
}

/// Strip padding by reading the final byte as a count.
///
/// The padding bytes themselves are not checked. A count larger than the
/// buffer yields an empty slice.
#[must_use]
pub fn unpad(data: &[u8]) -> &[u8] {
    match data.last() {
        Some(&count) => &data[..data.len().saturating_sub(count as usize)],
        None => data,
    }
}

/// Strip PKCS#7 padding, rejecting anything that is not well-formed padding.
pub fn unpad_strict(data: &[u8]) -> Result<&[u8]> {
    let count = *data
        .last()
        .ok_or_else(|| Error::CryptoFailure("Cannot unpad an empty buffer".to_string()))?
        as usize;
    if count == 0 || count > BLOCK_SIZE || count > data.len() {
        return Err(Error::CryptoFailure(format!(
            "Invalid padding length {}",
            count
        )));
    }

    let (body, padding) = data.split_at(data.len() - count);
    if padding.iter().any(|&b| b as usize != count) {
        return Err(Error::CryptoFailure("Inconsistent padding bytes".to_string()));
    }
    Ok(body)
}

/// Build a CMAC derivation input block.
///
/// Layout: `counter ‖ label ‖ 0x00 ‖ context ‖ output_bits (u32, big endian)`.
#[must_use]
pub fn derivation_input(label: &[u8], counter: u8, context: &[u8], output_bits: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + label.len() + 1 + context.len() + 4);
    out.push(counter);
    out.extend_from_slice(label);
    out.push(0);
    out.extend_from_slice(context);
    out.extend_from_slice(&output_bits.to_be_bytes());
    out
}

/// Derive the 128-bit key that decrypts the key records of a license.
///
/// `context` is the serialized inner license request exactly as it was signed.
/// Only a single CMAC block is produced.
pub fn derive_encryption_key(session_key: &[u8], context: &[u8]) -> Result<[u8; 16]> {
    let input = derivation_input(ENCRYPTION_LABEL, 1, context, 128);
    cmac_aes128(session_key, &input)
}

/// Derive the server and client MAC keys (32 bytes each).
///
/// The server key is counters 1 and 2, the client key counters 3 and 4, all
/// over the AUTHENTICATION context with a 512-bit output length.
pub fn derive_mac_keys(session_key: &[u8], context: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let block = |counter: u8| {
        cmac_aes128(
            session_key,
            &derivation_input(AUTHENTICATION_LABEL, counter, context, 512),
        )
    };

    let mut server = [0u8; 32];
    server[..16].copy_from_slice(&block(1)?);
    server[16..].copy_from_slice(&block(2)?);

    let mut client = [0u8; 32];
    client[..16].copy_from_slice(&block(3)?);
    client[16..].copy_from_slice(&block(4)?);

    Ok((server, client))
}

fn cmac_aes128(key: &[u8], data: &[u8]) -> Result<[u8; 16]> {
    let mut mac = CmacAes128::new_from_slice(key)
        .map_err(|e| Error::CryptoFailure(format!("Invalid CMAC key: {}", e)))?;
    mac.update(data);

    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// AES-128-CBC encrypt block-aligned `plaintext`.
pub fn aes_cbc_encrypt(key: [u8; 16], iv: [u8; 16], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = plaintext.to_vec();
    let len = buffer.len();
    Aes128CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut buffer, len)
        .map_err(|e| Error::CryptoFailure(format!("AES-CBC encryption failed: {}", e)))?;
    Ok(buffer)
}

/// AES-128-CBC decrypt `ciphertext`, leaving any padding in place.
pub fn aes_cbc_decrypt(key: [u8; 16], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let iv: [u8; 16] = iv.try_into().map_err(|_| {
        Error::CryptoFailure(format!(
            "Invalid IV length: expected 16, got {}",
            iv.len()
        ))
    })?;

    let mut buffer = ciphertext.to_vec();
    Aes128CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|_| {
            Error::CryptoFailure(format!(
                "Ciphertext length {} is not a multiple of {}",
                ciphertext.len(),
                BLOCK_SIZE
            ))
        })?;
    Ok(buffer)
}

/// Fill an array from the OS CSPRNG.
#[must_use]
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[must_use]
pub fn random_u32() -> u32 {
    OsRng.next_u32()
}
