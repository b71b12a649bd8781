//! Device identity: the RSA key and client identification of a license client.
//!
//! The identity signs license requests, unwraps session keys, and optionally
//! holds a service certificate. Installing a certificate switches the identity
//! into privacy mode, where the client identification is sent encrypted under
//! the service key.
//!
//! Identities can be built from a PEM or DER private key plus a serialized
//! `ClientIdentification`, or loaded from a `.wvd` device file (v1 or v2).

use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;

use base64::Engine;
use byteorder::{BigEndian, ReadBytesExt};
use prost::Message;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{Error, Result};
use crate::license_protocol::signed_message::MessageType;
use crate::license_protocol::{
    ClientIdentification, DrmCertificate, SignedDrmCertificate, SignedMessage,
};

/// Smallest accepted device key, in bits.
pub const MIN_KEY_BITS: usize = 2048;

const WVD_MAGIC: &[u8; 3] = b"WVD";

/// Widevine root `SignedDrmCertificate` (base64). Its public key signs
/// production service certificates.
pub const WIDEVINE_ROOT_CERT: &str = concat!(
    "CpwDCAASAQAY3ZSIiwUijgMwggGKAoIBgQC0/jnDZZAD2zwRlwnoaM3yw16b8ud",
    "NI7EQ24dl39z7nzWgVwNTTPZtNX2meNuzNtI/nECplSZyf7i+Zt/FIZh4FRZoXS9",
    "GDkPLioQ5q/uwNYAivjQji6tTW3LsS7VIaVM+R1/9Cf2ndhOPD5LWTN+udqm62SI",
    "QqZ1xRdbX4RklhZxTmpfrhNfMqIiCIHAmIP1+QFAn4iWTb7w+cqD6wb0ptE2CXMG",
    "0y5xyfrDpihc+GWP8/YJIK7eyM7l97Eu6iR8nuJuISISqGJIOZfXIbBH/azbkdDT",
    "KjDOx+biOtOYS4AKYeVJeRTP/Edzrw1O6fGAaET0A+9K3qjD6T15Id1sX3HXvb9I",
    "Zbdy+f7B4j9yCYEy/5CkGXmmMOROtFCXtGbLynwGCDVZEiMg17B8RsyTgWQ035Ec",
    "86kt/lzEcgXyUikx9aBWE/6UI/Rjn5yvkRycSEbgj7FiTPKwS0ohtQT3F/hzcufj",
    "UUT4H5QNvpxLoEve1zqaWVT94tGSCUNIzX5ECAwEAARKAA1jx1k0ECXvf1+9dOwI",
    "5F/oUNnVKOGeFVxKnFO41FtU9v0KG9mkAds2T9Hyy355EzUzUrgkYU0Qy7OBhG+X",
    "aE9NVxd0ay5AeflvG6Q8in76FAv6QMcxrA4S9IsRV+vXyCM1lQVjofSnaBFiC9Td",
    "pvPNaV4QXezKHcLKwdpyywxXRESYqI3WZPrl3IjINvBoZwdVlkHZVdA8OaU1fTY8",
    "Zr9/WFjGUqJJfT7x6Mfiujq0zt+kw0IwKimyDNfiKgbL+HIisKmbF/73mF9BiC9",
    "yKRfewPlrIHkokL2yl4xyIFIPVxe9enz2FRXPia1BSV0z7kmxmdYrWDRuu8+yvUS",
    "IDXQouY5OcCwEgqKmELhfKrnPsIht5rvagcizfB0fbiIYwFHghESKIrNdUdPnzJs",
    "KlVshWTwApHQh7evuVicPumFSePGuUBRMS9nG5qxPDDJtGCHs9Mmpoyh6ckGLF7R",
    "C5HxclzpC5bc3ERvWjYhN0AqdipPpV2d7PouaAdFUGSdUCDA=="
);

/// Device types found in `.wvd` files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceType {
    Chrome = 1,
    Android = 2,
}

impl TryFrom<u8> for DeviceType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(DeviceType::Chrome),
            2 => Ok(DeviceType::Android),
            _ => Err(Error::InvalidWvdFile(format!(
                "Invalid device type: {}",
                value
            ))),
        }
    }
}

/// A parsed service (privacy) certificate.
///
/// Only fully populated certificates exist: public key, service id and serial
/// number are all present.
#[derive(Debug, Clone)]
pub struct ServiceCertificate {
    public_key: RsaPublicKey,
    service_id: String,
    serial_number: Vec<u8>,
    signed: SignedDrmCertificate,
}

impl ServiceCertificate {
    /// Parse a certificate from a `SignedMessage` envelope or a bare
    /// `SignedDrmCertificate`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let signed = decode_signed_drm_certificate(data)?;

        let cert_bytes = signed
            .drm_certificate
            .as_deref()
            .ok_or_else(|| Error::InvalidCertificate("Missing DRM certificate".to_string()))?;
        let cert = DrmCertificate::decode(cert_bytes).map_err(|e| {
            Error::InvalidCertificate(format!("Failed to parse DrmCertificate: {}", e))
        })?;

        let public_key_der = non_empty(cert.public_key.as_deref())
            .ok_or_else(|| Error::InvalidCertificate("Missing public key".to_string()))?;
        let service_id = cert
            .provider_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidCertificate("Missing provider id".to_string()))?;
        let serial_number = non_empty(cert.serial_number.as_deref())
            .ok_or_else(|| Error::InvalidCertificate("Missing serial number".to_string()))?
            .to_vec();

        let public_key = RsaPublicKey::from_pkcs1_der(public_key_der).map_err(|e| {
            Error::InvalidCertificate(format!("Failed to parse public key: {}", e))
        })?;

        Ok(Self {
            public_key,
            service_id,
            serial_number,
            signed,
        })
    }

    /// Service (provider) id, e.g. `license.widevine.com`.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn serial_number(&self) -> &[u8] {
        &self.serial_number
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// The signed certificate this was parsed from.
    pub fn signed_certificate(&self) -> &SignedDrmCertificate {
        &self.signed
    }

    /// Check the RSA-PSS/SHA-1 signature over the certificate body against
    /// `signer`.
    pub fn verify_signature(&self, signer: &RsaPublicKey) -> Result<()> {
        let cert_bytes = self
            .signed
            .drm_certificate
            .as_deref()
            .ok_or_else(|| Error::InvalidCertificate("Missing DRM certificate".to_string()))?;
        let signature = non_empty(self.signed.signature.as_deref())
            .ok_or_else(|| Error::SignatureMismatch("Certificate has no signature".to_string()))?;

        signer
            .verify(Pss::new::<Sha1>(), &Sha1::digest(cert_bytes), signature)
            .map_err(|_| {
                Error::SignatureMismatch(format!(
                    "Signature mismatch on certificate for {}",
                    self.service_id
                ))
            })
    }

    /// Check the certificate against the Widevine root key.
    pub fn verify_widevine_root(&self) -> Result<()> {
        self.verify_signature(&widevine_root_key()?)
    }
}

/// Public key of [`WIDEVINE_ROOT_CERT`].
pub fn widevine_root_key() -> Result<RsaPublicKey> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(WIDEVINE_ROOT_CERT)?;
    let signed = SignedDrmCertificate::decode(bytes.as_slice())?;
    let cert = DrmCertificate::decode(signed.drm_certificate.unwrap_or_default().as_slice())?;
    let public_key = non_empty(cert.public_key.as_deref())
        .ok_or_else(|| Error::InvalidCertificate("Root certificate has no public key".to_string()))?;
    RsaPublicKey::from_pkcs1_der(public_key)
        .map_err(|e| Error::InvalidCertificate(format!("Failed to parse root public key: {}", e)))
}

/// The key material and identity of a license client.
///
/// The private key never leaves this type; callers get signing and
/// decryption primitives instead.
pub struct DeviceIdentity {
    private_key: RsaPrivateKey,
    client_id_blob: Vec<u8>,
    service_certificate: Option<ServiceCertificate>,
    device_type: Option<DeviceType>,
    security_level: Option<u8>,
}

impl DeviceIdentity {
    /// Create an identity from a private key and a serialized
    /// `ClientIdentification`.
    pub fn new(private_key: RsaPrivateKey, client_id_blob: Vec<u8>) -> Result<Self> {
        let bits = private_key.size() * 8;
        if bits < MIN_KEY_BITS {
            return Err(Error::InvalidKey(format!(
                "RSA key must be at least {} bits, got {}",
                MIN_KEY_BITS, bits
            )));
        }

        Ok(Self {
            private_key,
            client_id_blob,
            service_certificate: None,
            device_type: None,
            security_level: None,
        })
    }

    /// Create an identity from a PEM private key (PKCS#1, then PKCS#8).
    pub fn from_pem(private_key_pem: &[u8], client_id_blob: Vec<u8>) -> Result<Self> {
        let pem = std::str::from_utf8(private_key_pem)
            .map_err(|e| Error::InvalidKey(format!("PEM is not valid UTF-8: {}", e)))?;

        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| Error::InvalidKey(format!("Not a PKCS#1 or PKCS#8 RSA key: {}", e)))?;

        Self::new(private_key, client_id_blob)
    }

    /// Create an identity from a DER private key (PKCS#1, then PKCS#8).
    pub fn from_der(private_key_der: &[u8], client_id_blob: Vec<u8>) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs1_der(private_key_der)
            .or_else(|_| RsaPrivateKey::from_pkcs8_der(private_key_der))
            .map_err(|e| Error::InvalidKey(format!("Not a PKCS#1 or PKCS#8 RSA key: {}", e)))?;

        Self::new(private_key, client_id_blob)
    }

    /// Load an identity from a `.wvd` device file.
    pub fn from_wvd_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_wvd_bytes(&data)
    }

    /// Load an identity from `.wvd` bytes.
    ///
    /// v1 files carry VMP data after the client id; it is merged into the
    /// client identification when that has none of its own.
    pub fn from_wvd_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);

        let mut magic = [0u8; 3];
        reader.read_exact(&mut magic).map_err(truncated)?;
        if &magic != WVD_MAGIC {
            return Err(Error::InvalidWvdFile("Invalid magic bytes".to_string()));
        }

        let version = reader.read_u8().map_err(truncated)?;
        if version != 1 && version != 2 {
            return Err(Error::InvalidWvdFile(format!(
                "Unsupported version: {}",
                version
            )));
        }

        let device_type = DeviceType::try_from(reader.read_u8().map_err(truncated)?)?;
        let security_level = reader.read_u8().map_err(truncated)?;
        let _flags = reader.read_u8().map_err(truncated)?;

        let private_key_der = read_u16_prefixed(&mut reader)?;
        let private_key = RsaPrivateKey::from_pkcs1_der(&private_key_der)
            .or_else(|_| RsaPrivateKey::from_pkcs8_der(&private_key_der))
            .map_err(|e| Error::InvalidWvdFile(format!("Failed to parse RSA key: {}", e)))?;

        let mut client_id_blob = read_u16_prefixed(&mut reader)?;

        if version == 1 {
            let vmp = read_u16_prefixed(&mut reader)?;
            if !vmp.is_empty() {
                let mut client_id = ClientIdentification::decode(client_id_blob.as_slice())
                    .map_err(|e| {
                        Error::DecodeError(format!("Failed to parse ClientIdentification: {}", e))
                    })?;
                if client_id.vmp_data.as_ref().map_or(true, |d| d.is_empty()) {
                    client_id.vmp_data = Some(vmp);
                    client_id_blob = client_id.encode_to_vec();
                }
            }
        }

        debug!(
            version,
            ?device_type,
            security_level,
            "Loaded WVD device"
        );

        let mut identity = Self::new(private_key, client_id_blob)?;
        identity.device_type = Some(device_type);
        identity.security_level = Some(security_level);
        Ok(identity)
    }

    /// Install a service certificate and switch into privacy mode.
    ///
    /// Accepts a `SignedMessage` envelope or a bare `SignedDrmCertificate`.
    /// Any previous certificate is replaced. Returns the service id.
    pub fn install_service_certificate(&mut self, certificate: &[u8]) -> Result<String> {
        let certificate = ServiceCertificate::from_bytes(certificate)?;
        let service_id = certificate.service_id.clone();
        debug!(service_id = %service_id, "Installed service certificate");
        self.service_certificate = Some(certificate);
        Ok(service_id)
    }

    /// Like [`install_service_certificate`](Self::install_service_certificate),
    /// but the certificate must carry a valid signature from the Widevine
    /// root. Nothing is installed on failure.
    pub fn install_verified_service_certificate(&mut self, certificate: &[u8]) -> Result<String> {
        let certificate = ServiceCertificate::from_bytes(certificate)?;
        certificate.verify_widevine_root()?;
        let service_id = certificate.service_id.clone();
        debug!(service_id = %service_id, "Installed verified service certificate");
        self.service_certificate = Some(certificate);
        Ok(service_id)
    }

    /// Remove the service certificate, returning to plain mode.
    pub fn clear_service_certificate(&mut self) -> Option<ServiceCertificate> {
        self.service_certificate.take()
    }

    pub fn service_certificate(&self) -> Option<&ServiceCertificate> {
        self.service_certificate.as_ref()
    }

    pub fn is_privacy_mode(&self) -> bool {
        self.service_certificate.is_some()
    }

    /// The serialized `ClientIdentification`, as supplied.
    pub fn client_id_blob(&self) -> &[u8] {
        &self.client_id_blob
    }

    /// Decode the client id blob.
    pub fn client_identification(&self) -> Result<ClientIdentification> {
        ClientIdentification::decode(self.client_id_blob.as_slice()).map_err(|e| {
            Error::DecodeError(format!("Failed to parse ClientIdentification: {}", e))
        })
    }

    /// System id from the DRM certificate in the client id token, if any.
    pub fn system_id(&self) -> Option<u32> {
        let client_id = self.client_identification().ok()?;
        let signed = SignedDrmCertificate::decode(client_id.token?.as_slice()).ok()?;
        let cert = DrmCertificate::decode(signed.drm_certificate?.as_slice()).ok()?;
        cert.system_id
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        self.device_type
    }

    pub fn security_level(&self) -> Option<u8> {
        self.security_level
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// RSA-PSS sign the SHA-1 digest of `message` (salt length 20).
    pub fn sign_pss(&self, message: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha1::digest(message);
        let signature = self
            .private_key
            .sign_with_rng(&mut OsRng, Pss::new::<Sha1>(), &digest)?;
        Ok(signature)
    }

    /// RSA-OAEP/SHA-1 decrypt with the device key.
    pub fn decrypt_oaep(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self.private_key.decrypt(Oaep::new::<Sha1>(), ciphertext)?;
        Ok(plaintext)
    }

    /// RSA-OAEP/SHA-1 encrypt under the installed service key.
    pub fn encrypt_oaep_with_service_key(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let certificate = self
            .service_certificate
            .as_ref()
            .ok_or(Error::PrivacyModeUnavailable)?;
        let ciphertext =
            certificate
                .public_key
                .encrypt(&mut OsRng, Oaep::new::<Sha1>(), plaintext)?;
        Ok(ciphertext)
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("key_bits", &(self.private_key.size() * 8))
            .field("client_id_len", &self.client_id_blob.len())
            .field(
                "service_id",
                &self.service_certificate.as_ref().map(|c| c.service_id()),
            )
            .field("device_type", &self.device_type)
            .field("security_level", &self.security_level)
            .finish()
    }
}

fn non_empty(value: Option<&[u8]>) -> Option<&[u8]> {
    value.filter(|v| !v.is_empty())
}

fn truncated(_: std::io::Error) -> Error {
    Error::InvalidWvdFile("Data too short".to_string())
}

fn read_u16_prefixed(reader: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = reader.read_u16::<BigEndian>().map_err(truncated)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn decode_signed_drm_certificate(data: &[u8]) -> Result<SignedDrmCertificate> {
    // A SignedMessage starts with a varint type, a SignedDrmCertificate with a
    // length-delimited field, so at most one of the two decodes succeeds.
    if let Ok(message) = SignedMessage::decode(data) {
        if let Some(kind) = message.r#type {
            if kind != MessageType::ServiceCertificate as i32 {
                return Err(Error::InvalidCertificate(format!(
                    "Unexpected message type {}",
                    kind
                )));
            }
        }
        let msg = message
            .msg
            .ok_or_else(|| Error::InvalidCertificate("SignedMessage missing msg".to_string()))?;
        return SignedDrmCertificate::decode(msg.as_slice()).map_err(|e| {
            Error::InvalidCertificate(format!("Failed to parse SignedDrmCertificate: {}", e))
        });
    }

    SignedDrmCertificate::decode(data).map_err(|e| {
        Error::InvalidCertificate(format!("Failed to parse SignedDrmCertificate: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::request::{COMMON_PRIVACY_CERT, STAGING_PRIVACY_CERT};
    use base64::Engine;
    use rsa::pkcs1::EncodeRsaPublicKey;

    fn b64(data: &str) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD.decode(data).unwrap()
    }

    #[test]
    fn pkcs1_and_pkcs8_pem_load_same_key() {
        let a = DeviceIdentity::from_pem(fixtures::DEVICE_PKCS1_PEM.as_bytes(), vec![1]).unwrap();
        let b = DeviceIdentity::from_pem(fixtures::DEVICE_PKCS8_PEM.as_bytes(), vec![1]).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert!(!a.is_privacy_mode());
    }

    #[test]
    fn garbage_key_is_invalid_key() {
        let err = DeviceIdentity::from_pem(b"not a key", vec![]).expect_err("garbage key");
        assert!(matches!(err, Error::InvalidKey(_)));

        let err = DeviceIdentity::from_der(&[0x30, 0x03, 0x02, 0x01, 0x00], vec![])
            .expect_err("garbage der");
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[test]
    fn short_keys_are_rejected() {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let err = DeviceIdentity::new(key, vec![]).expect_err("1024-bit key");
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[test]
    fn installs_well_known_certificates() {
        let mut identity = fixtures::device_identity();

        let service_id = identity
            .install_service_certificate(&b64(COMMON_PRIVACY_CERT))
            .unwrap();
        assert_eq!(service_id, "license.widevine.com");
        assert!(identity.is_privacy_mode());

        let service_id = identity
            .install_service_certificate(&b64(STAGING_PRIVACY_CERT))
            .unwrap();
        assert_eq!(service_id, "staging.google.com");
        assert_eq!(
            identity.service_certificate().map(|c| c.service_id()),
            Some("staging.google.com")
        );

        assert!(identity.clear_service_certificate().is_some());
        assert!(!identity.is_privacy_mode());
    }

    #[test]
    fn common_certificate_is_signed_by_widevine_root() {
        let cert = ServiceCertificate::from_bytes(&b64(COMMON_PRIVACY_CERT)).unwrap();
        cert.verify_widevine_root().expect("root signature");

        let mut identity = fixtures::device_identity();
        let service_id = identity
            .install_verified_service_certificate(&b64(COMMON_PRIVACY_CERT))
            .unwrap();
        assert_eq!(service_id, "license.widevine.com");
    }

    #[test]
    fn certificate_signature_is_checked_against_signer() {
        let signer = fixtures::device_private_key();
        let cert =
            ServiceCertificate::from_bytes(&fixtures::signed_service_certificate(&signer)).unwrap();
        cert.verify_signature(&signer.to_public_key()).expect("signed by device key");

        let err = cert
            .verify_signature(&fixtures::service_private_key().to_public_key())
            .expect_err("wrong signer");
        assert!(matches!(err, Error::SignatureMismatch(_)));
    }

    #[test]
    fn unverified_certificate_is_not_installed() {
        let mut identity = fixtures::device_identity();
        let err = identity
            .install_verified_service_certificate(&fixtures::service_certificate())
            .expect_err("fixture is not root-signed");
        assert!(matches!(err, Error::SignatureMismatch(_)));
        assert!(!identity.is_privacy_mode());

        // Unverified installs still accept it.
        identity
            .install_service_certificate(&fixtures::service_certificate())
            .unwrap();
        assert!(identity.is_privacy_mode());
    }

    #[test]
    fn bare_signed_drm_certificate_is_accepted() {
        let message = SignedMessage::decode(fixtures::service_certificate().as_slice()).unwrap();
        let bare = message.msg.unwrap();

        let certificate = ServiceCertificate::from_bytes(&bare).unwrap();
        assert_eq!(certificate.service_id(), fixtures::SERVICE_ID);
        assert_eq!(certificate.serial_number(), fixtures::SERVICE_SERIAL);
        assert_eq!(
            certificate.public_key(),
            &fixtures::service_private_key().to_public_key()
        );
    }

    #[test]
    fn partial_certificates_are_rejected() {
        let public_key = fixtures::service_private_key()
            .to_public_key()
            .to_pkcs1_der()
            .unwrap()
            .as_bytes()
            .to_vec();
        let full = DrmCertificate {
            r#type: Some(crate::license_protocol::drm_certificate::Type::Service as i32),
            serial_number: Some(fixtures::SERVICE_SERIAL.to_vec()),
            public_key: Some(public_key),
            provider_id: Some(fixtures::SERVICE_ID.to_string()),
            ..Default::default()
        };

        let partials = [
            DrmCertificate { public_key: None, ..full.clone() },
            DrmCertificate { provider_id: None, ..full.clone() },
            DrmCertificate { serial_number: Some(vec![]), ..full.clone() },
            DrmCertificate { public_key: Some(vec![1, 2, 3]), ..full.clone() },
        ];

        let mut identity = fixtures::device_identity();
        for cert in partials {
            let signed = SignedDrmCertificate {
                drm_certificate: Some(cert.encode_to_vec()),
                ..Default::default()
            };
            let err = identity
                .install_service_certificate(&signed.encode_to_vec())
                .expect_err("partial certificate");
            assert!(matches!(err, Error::InvalidCertificate(_)));
            assert!(!identity.is_privacy_mode());
        }
    }

    #[test]
    fn wrong_envelope_type_is_rejected() {
        let message = SignedMessage {
            r#type: Some(MessageType::License as i32),
            msg: Some(vec![]),
            ..Default::default()
        };
        let err = ServiceCertificate::from_bytes(&message.encode_to_vec()).expect_err("license");
        assert!(matches!(err, Error::InvalidCertificate(_)));
    }

    #[test]
    fn sign_and_decrypt_primitives() {
        let identity = fixtures::device_identity();

        let signature = identity.sign_pss(b"message").unwrap();
        identity
            .public_key()
            .verify(Pss::new::<Sha1>(), &Sha1::digest(b"message"), &signature)
            .expect("signature verifies");

        let ciphertext = identity
            .public_key()
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), b"session key")
            .unwrap();
        assert_eq!(identity.decrypt_oaep(&ciphertext).unwrap(), b"session key");
    }

    #[test]
    fn service_key_encryption_requires_certificate() {
        let mut identity = fixtures::device_identity();
        let err = identity
            .encrypt_oaep_with_service_key(b"key")
            .expect_err("no certificate");
        assert!(matches!(err, Error::PrivacyModeUnavailable));

        identity
            .install_service_certificate(&fixtures::service_certificate())
            .unwrap();
        let wrapped = identity.encrypt_oaep_with_service_key(b"key").unwrap();
        let unwrapped = fixtures::service_private_key()
            .decrypt(Oaep::new::<Sha1>(), &wrapped)
            .unwrap();
        assert_eq!(unwrapped, b"key");
    }

    #[test]
    fn system_id_from_client_token() {
        let identity = fixtures::device_identity();
        assert_eq!(identity.system_id(), Some(fixtures::SYSTEM_ID));

        let opaque = DeviceIdentity::from_pem(fixtures::DEVICE_PKCS1_PEM.as_bytes(), vec![0xff])
            .unwrap();
        assert_eq!(opaque.system_id(), None);
    }

    fn wvd(version: u8, client_id: &[u8], vmp: Option<&[u8]>) -> Vec<u8> {
        use rsa::pkcs1::EncodeRsaPrivateKey;

        let key = RsaPrivateKey::from_pkcs1_pem(fixtures::DEVICE_PKCS1_PEM).unwrap();
        let key_der = key.to_pkcs1_der().unwrap();
        let key_der = key_der.as_bytes();

        let mut out = b"WVD".to_vec();
        out.extend_from_slice(&[version, 2, 3, 0]);
        out.extend_from_slice(&(key_der.len() as u16).to_be_bytes());
        out.extend_from_slice(key_der);
        out.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
        out.extend_from_slice(client_id);
        if let Some(vmp) = vmp {
            out.extend_from_slice(&(vmp.len() as u16).to_be_bytes());
            out.extend_from_slice(vmp);
        }
        out
    }

    #[test]
    fn loads_wvd_v2() {
        let blob = fixtures::client_id_blob();
        let identity = DeviceIdentity::from_wvd_bytes(&wvd(2, &blob, None)).unwrap();
        assert_eq!(identity.client_id_blob(), blob.as_slice());
        assert_eq!(identity.device_type(), Some(DeviceType::Android));
        assert_eq!(identity.security_level(), Some(3));
        assert_eq!(identity.system_id(), Some(fixtures::SYSTEM_ID));
    }

    #[test]
    fn wvd_v1_merges_vmp() {
        let blob = fixtures::client_id_blob();
        let identity = DeviceIdentity::from_wvd_bytes(&wvd(1, &blob, Some(b"vmp"))).unwrap();
        let client_id = identity.client_identification().unwrap();
        assert_eq!(client_id.vmp_data.as_deref(), Some(&b"vmp"[..]));
    }

    #[test]
    fn truncated_wvd_is_rejected() {
        let blob = fixtures::client_id_blob();
        let data = wvd(2, &blob, None);
        let err = DeviceIdentity::from_wvd_bytes(&data[..data.len() - 1]).expect_err("truncated");
        assert!(matches!(err, Error::InvalidWvdFile(_)));

        let err = DeviceIdentity::from_wvd_bytes(b"XYZ\x02").expect_err("magic");
        assert!(matches!(err, Error::InvalidWvdFile(_)));
    }

    #[test]
    fn identity_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DeviceIdentity>();
    }
}
