//! Shared test fixtures: fixed RSA keys and protobuf blobs built around them.
use prost::Message;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::rand_core::OsRng;
use rsa::{Pss, RsaPrivateKey};
use sha1::{Digest, Sha1};

use crate::device::DeviceIdentity;
use crate::license_protocol::client_identification::{NameValue, TokenType};
use crate::license_protocol::signed_message::MessageType;
use crate::license_protocol::{
    drm_certificate, ClientIdentification, DrmCertificate, SignedDrmCertificate, SignedMessage,
};

pub(crate) const DEVICE_PKCS1_PEM: &str = include_str!("testdata/device_pkcs1.pem");
pub(crate) const DEVICE_PKCS8_PEM: &str = include_str!("testdata/device_pkcs8.pem");
pub(crate) const SERVICE_PKCS1_PEM: &str = include_str!("testdata/service_pkcs1.pem");

pub(crate) const SYSTEM_ID: u32 = 22590;
pub(crate) const SERVICE_ID: &str = "license.example.com";
pub(crate) const SERVICE_SERIAL: &[u8] = &[0x11; 16];

pub(crate) fn device_private_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs1_pem(DEVICE_PKCS1_PEM).unwrap()
}

pub(crate) fn service_private_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs1_pem(SERVICE_PKCS1_PEM).unwrap()
}

pub(crate) fn client_identification() -> ClientIdentification {
    let public_key = device_private_key()
        .to_public_key()
        .to_pkcs1_der()
        .unwrap()
        .as_bytes()
        .to_vec();
    let device_cert = DrmCertificate {
        r#type: Some(drm_certificate::Type::Device as i32),
        serial_number: Some(vec![0x22; 16]),
        creation_time_seconds: Some(1_600_000_000),
        public_key: Some(public_key),
        system_id: Some(SYSTEM_ID),
        ..Default::default()
    };
    let token = SignedDrmCertificate {
        drm_certificate: Some(device_cert.encode_to_vec()),
        signature: Some(vec![0x33; 256]),
        signer: None,
    };

    ClientIdentification {
        r#type: Some(TokenType::DrmDeviceCertificate as i32),
        token: Some(token.encode_to_vec()),
        client_info: vec![
            NameValue {
                name: Some("company_name".to_string()),
                value: Some("example".to_string()),
            },
            NameValue {
                name: Some("model_name".to_string()),
                value: Some("test-device".to_string()),
            },
        ],
        ..Default::default()
    }
}

pub(crate) fn client_id_blob() -> Vec<u8> {
    client_identification().encode_to_vec()
}

pub(crate) fn device_identity() -> DeviceIdentity {
    DeviceIdentity::new(device_private_key(), client_id_blob()).unwrap()
}

/// A `SignedMessage` carrying a service certificate for the service key.
pub(crate) fn service_certificate() -> Vec<u8> {
    wrap_service_certificate(service_drm_certificate(), vec![0x44; 256])
}

/// Like [`service_certificate`], signed by `signer` with RSA-PSS/SHA-1.
pub(crate) fn signed_service_certificate(signer: &RsaPrivateKey) -> Vec<u8> {
    let cert = service_drm_certificate();
    let signature = signer
        .sign_with_rng(&mut OsRng, Pss::new::<Sha1>(), &Sha1::digest(&cert))
        .unwrap();
    wrap_service_certificate(cert, signature)
}

fn service_drm_certificate() -> Vec<u8> {
    let public_key = service_private_key()
        .to_public_key()
        .to_pkcs1_der()
        .unwrap()
        .as_bytes()
        .to_vec();
    let cert = DrmCertificate {
        r#type: Some(drm_certificate::Type::Service as i32),
        serial_number: Some(SERVICE_SERIAL.to_vec()),
        creation_time_seconds: Some(1_600_000_000),
        public_key: Some(public_key),
        provider_id: Some(SERVICE_ID.to_string()),
        ..Default::default()
    };
    cert.encode_to_vec()
}

fn wrap_service_certificate(cert: Vec<u8>, signature: Vec<u8>) -> Vec<u8> {
    let signed = SignedDrmCertificate {
        drm_certificate: Some(cert),
        signature: Some(signature),
        signer: None,
    };

    SignedMessage {
        r#type: Some(MessageType::ServiceCertificate as i32),
        msg: Some(signed.encode_to_vec()),
        ..Default::default()
    }
    .encode_to_vec()
}
