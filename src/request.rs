//! License request construction.
//!
//! A request embeds the protection header init data verbatim, identifies the
//! client either in the clear or encrypted under a service certificate, and is
//! signed with RSA-PSS/SHA-1 by the device key. The serialized inner request
//! is kept alongside the envelope since the response keys are derived from
//! exactly those bytes.

use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use tracing::{debug, warn};

use crate::crypto;
use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::key::ContentKey;
use crate::license_protocol::license_request::content_identification::{
    ContentIdVariant, WidevinePsshData as WidevinePsshDataRequest,
};
use crate::license_protocol::license_request::{ContentIdentification, RequestType};
use crate::license_protocol::signed_message::MessageType;
use crate::license_protocol::{
    ClientIdentification, EncryptedClientIdentification, LicenseRequest, LicenseType,
    ProtocolVersion, SignedMessage,
};
use crate::pssh::ProtectionHeader;
use crate::response::LicenseResponseProcessor;
use crate::session::Session;

/// Body of a service certificate request (`SignedMessage` with type
/// SERVICE_CERTIFICATE_REQUEST).
pub const SERVICE_CERTIFICATE_CHALLENGE: &[u8] = b"\x08\x04";

/// Service certificate of the common Widevine license server, base64.
pub const COMMON_PRIVACY_CERT: &str = concat!(
    "CAUSxwUKwQIIAxIQFwW5F8wSBIaLBjM6L3cqjBiCtIKSBSKOAjCCAQoCggEBAJntWzsy",
    "fateJO/DtiqVtZhSCtW8yzdQPgZFuBTYdrjfQFEEQa2M462xG7iMTnJaXkqeB5Up",
    "HVhYQCOn4a8OOKkSeTkwCGELbxWMh4x+Ib/7/up34QGeHleB6KRfRiY9FOYOgFioY",
    "Hrc4E+shFexN6jWfM3rM3BdmDoh+07svUoQykdJDKR+ql1DghjduvHK3jOS8T1v+",
    "2RC/THhv0CwxgTRxLpMlSCkv5fuvWCSmvzu9Vu69WTi0Ods18Vcc6CCuZYSC4NZ7",
    "c4kcHCCaA1vZ8bYLErF8xNEkKdO7DevSy8BDFnoKEPiWC8La59dsPxebt9k+9MI",
    "tHEbzxJQAZyfWgkCAwEAAToUbGljZW5zZS53aWRldmluZS5jb20SgAOuNHMUtag1",
    "KX8nE4j7e7jLUnfSSYI83dHaMLkzOVEes8y96gS5RLknwSE0bv296snUE5F+bsF2",
    "oQQ4RgpQO8GVK5uk5M4PxL/CCpgIqq9L/NGcHc/N9XTMrCjRtBBBbPneiAQwHL2z",
    "NMr80NQJeEI6ZC5UYT3wr8+WykqSSdhV5Cs6cD7xdn9qm9Nta/gr52u/DLpP3lnS",
    "q8x2/rZCR7hcQx+8pSJmthn8NpeVQ/ypy727+voOGlXnVaPHvOZV+WRvWCq5z3Cq",
    "CLl5+Gf2Ogsrf9s2LFvE7NVV2FvKqcWTw4PIV9Sdqrd+QLeFHd/SSZiAjjWyWOdd",
    "eOrAyhb3BHMEwg2T7eTo/xxvF+YkPj89qPwXCYcOxF+6gjomPwzvofcJOxkJkoMm",
    "MzcFBDopvab5tDQsyN9UPLGhGC98X/8z8QSQ+spbJTYLdgFenFoGq47gLwDS6NWY",
    "YQSqzE3Udf2W7pzk4ybyG4PHBYV3s4cyzdq8amvtE/sNSdOKReuHpfQ="
);

/// Service certificate of the staging Widevine license server, base64.
pub const STAGING_PRIVACY_CERT: &str = concat!(
    "CAUSxQUKvwIIAxIQKHA0VMAI9jYYredEPbbEyBiL5/mQBSKOAjCCAQoCggEBALUhEr",
    "jQXQI/zF2V4sJRwcZJtBd82NK+7zVbsGdD3mYePSq8MYK3mUbVX9wI3+lUB4Femm",
    "J0syKix/XgZ7tfCsB6idRa6pSyUW8HW2bvgR0NJuG5priU8rmFeWKqFxxPZmMNPk",
    "xgJxiJf14e+baq9a1Nuip+FBdt8TSh0xhbWiGKwFpMQfCB7/+Ao6BAxQsJu8dA7t",
    "zY8U1nWpGYD5LKfdxkagatrVEB90oOSYzAHwBTK6wheFC9kF6QkjZWt9/v70JIZ2",
    "fzPvYoPU9CVKtyWJOQvuVYCPHWaAgNRdiTwryi901goMDQoJk87wFgRwMzTDY4E5",
    "SGvJ2vJP1noH+a2UMCAwEAAToSc3RhZ2luZy5nb29nbGUuY29tEoADmD4wNSZ19A",
    "unFfwkm9rl1KxySaJmZSHkNlVzlSlyH/iA4KrvxeJ7yYDa6tq/P8OG0ISgLIJTeE",
    "jMdT/0l7ARp9qXeIoA4qprhM19ccB6SOv2FgLMpaPzIDCnKVww2pFbkdwYubyVk7",
    "jei7UPDe3BKTi46eA5zd4Y+oLoG7AyYw/pVdhaVmzhVDAL9tTBvRJpZjVrKH1lex",
    "jOY9Dv1F/FJp6X6rEctWPlVkOyb/SfEJwhAa/K81uDLyiPDZ1Flg4lnoX7XSTb0s",
    "+Cdkxd2b9yfvvpyGH4aTIfat4YkF9Nkvmm2mU224R1hx0WjocLsjA89wxul4TJPS",
    "3oRa2CYr5+DU4uSgdZzvgtEJ0lksckKfjAF0K64rPeytvDPD5fS69eFuy3Tq26/L",
    "fGcF96njtvOUA4P5xRFtICogySKe6WnCUZcYMDtQ0BMMM1LgawFNg4VA+KDCJ8AB",
    "Hg9bOOTimO0sswHrRWSWX1XF15dXolCk65yEqz5lOfa2/fVomeopkU"
);

/// How the client identifies itself in a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientIdentity {
    Plain(ClientIdentification),
    Encrypted(EncryptedClientIdentification),
}

/// Builds signed license requests for one device identity.
#[derive(Debug, Clone)]
pub struct LicenseRequestBuilder<'a> {
    identity: &'a DeviceIdentity,
    license_type: LicenseType,
    privacy_mode: Option<bool>,
    request_time: Option<i64>,
    nonce: Option<u32>,
}

impl<'a> LicenseRequestBuilder<'a> {
    pub fn new(identity: &'a DeviceIdentity) -> Self {
        Self {
            identity,
            license_type: LicenseType::Streaming,
            privacy_mode: None,
            request_time: None,
            nonce: None,
        }
    }

    /// Requested license type, STREAMING by default.
    pub fn license_type(mut self, license_type: LicenseType) -> Self {
        self.license_type = license_type;
        self
    }

    /// Force privacy mode on or off. Defaults to the identity's mode.
    pub fn privacy_mode(mut self, enabled: bool) -> Self {
        self.privacy_mode = Some(enabled);
        self
    }

    /// Fix the request time (unix seconds) instead of using the clock.
    pub fn request_time(mut self, seconds: i64) -> Self {
        self.request_time = Some(seconds);
        self
    }

    /// Fix the key control nonce instead of drawing a random one.
    pub fn nonce(mut self, nonce: u32) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Build and sign a request for `header` within `session`.
    pub fn build(&self, header: &ProtectionHeader, session: &Session) -> Result<LicenseChallenge> {
        let content_id = ContentIdentification {
            content_id_variant: Some(ContentIdVariant::WidevinePsshData(
                WidevinePsshDataRequest {
                    pssh_data: vec![header.init_data().to_vec()],
                    license_type: Some(self.license_type as i32),
                    request_id: Some(session.id().to_vec()),
                },
            )),
        };

        let request_time = self.request_time.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default()
        });
        let nonce = self.nonce.unwrap_or_else(crypto::random_u32);

        let privacy_mode = self
            .privacy_mode
            .unwrap_or_else(|| self.identity.is_privacy_mode());
        let client = if privacy_mode {
            ClientIdentity::Encrypted(encrypt_client_id(self.identity)?)
        } else {
            ClientIdentity::Plain(plain_client_id(self.identity)?)
        };
        let (client_id, encrypted_client_id) = match client {
            ClientIdentity::Plain(id) => (Some(id), None),
            ClientIdentity::Encrypted(id) => (None, Some(id)),
        };

        let request = LicenseRequest {
            client_id,
            content_id: Some(content_id),
            r#type: Some(RequestType::New as i32),
            request_time: Some(request_time),
            key_control_nonce_deprecated: None,
            protocol_version: Some(ProtocolVersion::Version21 as i32),
            key_control_nonce: Some(nonce),
            encrypted_client_id,
        };

        let message = request.encode_to_vec();
        let signature = self.identity.sign_pss(&message)?;

        let signed = SignedMessage {
            r#type: Some(MessageType::LicenseRequest as i32),
            msg: Some(message.clone()),
            signature: Some(signature),
            ..Default::default()
        }
        .encode_to_vec();

        debug!(
            privacy_mode,
            license_type = self.license_type.as_str_name(),
            request_len = message.len(),
            "Built license request"
        );

        Ok(LicenseChallenge {
            request,
            message,
            signed,
        })
    }
}

/// A built license request.
#[derive(Debug, Clone)]
pub struct LicenseChallenge {
    request: LicenseRequest,
    message: Vec<u8>,
    signed: Vec<u8>,
}

impl LicenseChallenge {
    pub fn request(&self) -> &LicenseRequest {
        &self.request
    }

    /// The serialized inner `LicenseRequest`, exactly as signed.
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// The serialized `SignedMessage` to POST to the license server.
    pub fn signed(&self) -> &[u8] {
        &self.signed
    }

    pub fn into_signed(self) -> Vec<u8> {
        self.signed
    }

    /// Decrypt the keys of a license issued for this request.
    pub fn extract_keys(&self, response: &[u8], identity: &DeviceIdentity) -> Result<Vec<ContentKey>> {
        LicenseResponseProcessor::new(identity).extract_keys_with_context(&self.message, response)
    }
}

fn plain_client_id(identity: &DeviceIdentity) -> Result<ClientIdentification> {
    let client_id = identity.client_identification()?;
    if client_id.encode_to_vec() != identity.client_id_blob() {
        warn!("Client ID was only partially parsed; unknown fields are dropped");
    }
    Ok(client_id)
}

fn encrypt_client_id(identity: &DeviceIdentity) -> Result<EncryptedClientIdentification> {
    let certificate = identity
        .service_certificate()
        .ok_or(Error::PrivacyModeUnavailable)?;

    let privacy_key = crypto::random_bytes::<16>();
    let privacy_iv = crypto::random_bytes::<16>();

    let padded = crypto::pad(identity.client_id_blob());
    let encrypted_client_id = crypto::aes_cbc_encrypt(privacy_key, privacy_iv, &padded)?;
    let encrypted_privacy_key = identity.encrypt_oaep_with_service_key(&privacy_key)?;

    Ok(EncryptedClientIdentification {
        provider_id: Some(certificate.service_id().to_string()),
        service_certificate_serial_number: Some(certificate.serial_number().to_vec()),
        encrypted_client_id: Some(encrypted_client_id),
        encrypted_client_id_iv: Some(privacy_iv.to_vec()),
        encrypted_privacy_key: Some(encrypted_privacy_key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use base64::Engine;
    use rsa::Oaep;
    use sha1::{Digest, Sha1};

    fn header() -> ProtectionHeader {
        ProtectionHeader::from_base64(
            "AAAAW3Bzc2gAAAAA7e+LqXnWSs6jyCfc1R0h7QAAADsIARIQ62dqu8s0Xpa7z2FmMPGj2hoNd2lkZXZpbmVfdGVzdCIQZmtqM2xqYVNkZmFsa3IzaioCSEQyAA==",
        )
        .unwrap()
    }

    fn pssh_data(request: &LicenseRequest) -> &WidevinePsshDataRequest {
        match request
            .content_id
            .as_ref()
            .and_then(|c| c.content_id_variant.as_ref())
        {
            Some(ContentIdVariant::WidevinePsshData(data)) => data,
            None => panic!("missing content id"),
        }
    }

    #[test]
    fn plain_request_fields() {
        let identity = fixtures::device_identity();
        let session = Session::new();
        let header = header();

        let challenge = LicenseRequestBuilder::new(&identity)
            .build(&header, &session)
            .unwrap();
        let request = challenge.request();

        let data = pssh_data(request);
        assert_eq!(data.pssh_data, vec![header.init_data().to_vec()]);
        assert_eq!(data.license_type, Some(1));
        assert_eq!(data.request_id.as_deref(), Some(session.id()));

        assert_eq!(request.r#type, Some(RequestType::New as i32));
        assert_eq!(request.protocol_version, Some(21));
        assert!(request.request_time.is_some());
        assert!(request.key_control_nonce.is_some());
        assert_eq!(request.client_id, Some(fixtures::client_identification()));
        assert!(request.encrypted_client_id.is_none());

        assert_eq!(LicenseRequest::decode(challenge.message()).unwrap(), *request);
    }

    #[test]
    fn fixed_inputs_give_identical_messages() {
        let identity = fixtures::device_identity();
        let session = Session::new();
        let header = header();
        let builder = LicenseRequestBuilder::new(&identity)
            .request_time(1_700_000_000)
            .nonce(0);

        let a = builder.build(&header, &session).unwrap();
        let b = builder.build(&header, &session).unwrap();
        assert_eq!(a.message(), b.message());
        assert_eq!(a.request().key_control_nonce, Some(0));
    }

    #[test]
    fn zero_scalars_are_serialized() {
        let identity = fixtures::device_identity();
        let challenge = LicenseRequestBuilder::new(&identity)
            .request_time(0)
            .nonce(0)
            .build(&header(), &Session::new())
            .unwrap();

        let decoded = LicenseRequest::decode(challenge.message()).unwrap();
        assert_eq!(decoded.request_time, Some(0));
        assert_eq!(decoded.key_control_nonce, Some(0));

        // type NEW then request_time 0; protocol_version 21 then nonce 0.
        let message = challenge.message();
        assert!(message.windows(4).any(|w| w == [0x18, 0x01, 0x20, 0x00]));
        assert!(message.windows(4).any(|w| w == [0x30, 0x15, 0x38, 0x00]));
    }

    #[test]
    fn envelope_carries_signed_message() {
        let identity = fixtures::device_identity();
        let challenge = LicenseRequestBuilder::new(&identity)
            .build(&header(), &Session::new())
            .unwrap();

        let envelope = SignedMessage::decode(challenge.signed()).unwrap();
        assert_eq!(envelope.r#type, Some(MessageType::LicenseRequest as i32));
        assert_eq!(envelope.msg.as_deref(), Some(challenge.message()));

        let signature = envelope.signature.unwrap();
        identity
            .public_key()
            .verify(
                rsa::Pss::new::<Sha1>(),
                &Sha1::digest(challenge.message()),
                &signature,
            )
            .expect("request signature verifies");
    }

    #[test]
    fn privacy_mode_encrypts_client_id() {
        let mut identity = fixtures::device_identity();
        identity
            .install_service_certificate(&fixtures::service_certificate())
            .unwrap();

        let challenge = LicenseRequestBuilder::new(&identity)
            .build(&header(), &Session::new())
            .unwrap();
        let request = challenge.request();
        assert!(request.client_id.is_none());

        let encrypted = request.encrypted_client_id.as_ref().unwrap();
        assert_eq!(encrypted.provider_id.as_deref(), Some(fixtures::SERVICE_ID));
        assert_eq!(
            encrypted.service_certificate_serial_number.as_deref(),
            Some(fixtures::SERVICE_SERIAL)
        );

        let privacy_key: [u8; 16] = fixtures::service_private_key()
            .decrypt(
                Oaep::new::<Sha1>(),
                encrypted.encrypted_privacy_key.as_ref().unwrap(),
            )
            .unwrap()
            .try_into()
            .unwrap();
        let decrypted = crypto::aes_cbc_decrypt(
            privacy_key,
            encrypted.encrypted_client_id_iv.as_ref().unwrap(),
            encrypted.encrypted_client_id.as_ref().unwrap(),
        )
        .unwrap();
        assert_eq!(crypto::unpad(&decrypted), identity.client_id_blob());
    }

    #[test]
    fn privacy_mode_can_be_overridden() {
        let mut identity = fixtures::device_identity();
        identity
            .install_service_certificate(&fixtures::service_certificate())
            .unwrap();

        let challenge = LicenseRequestBuilder::new(&identity)
            .privacy_mode(false)
            .build(&header(), &Session::new())
            .unwrap();
        assert!(challenge.request().client_id.is_some());
        assert!(challenge.request().encrypted_client_id.is_none());
    }

    #[test]
    fn privacy_without_certificate_fails() {
        let identity = fixtures::device_identity();
        let err = LicenseRequestBuilder::new(&identity)
            .privacy_mode(true)
            .build(&header(), &Session::new())
            .expect_err("no certificate");
        assert!(matches!(err, Error::PrivacyModeUnavailable));
    }

    #[test]
    fn undecodable_client_id_fails_in_plain_mode() {
        let identity =
            DeviceIdentity::from_pem(fixtures::DEVICE_PKCS1_PEM.as_bytes(), vec![0xff, 0xff])
                .unwrap();
        let err = LicenseRequestBuilder::new(&identity)
            .build(&header(), &Session::new())
            .expect_err("bad client id");
        assert!(matches!(err, Error::DecodeError(_)));
    }

    #[test]
    fn offline_license_type() {
        let identity = fixtures::device_identity();
        let challenge = LicenseRequestBuilder::new(&identity)
            .license_type(LicenseType::Offline)
            .build(&header(), &Session::new())
            .unwrap();
        assert_eq!(pssh_data(challenge.request()).license_type, Some(2));
    }

    #[test]
    fn certificate_challenge_is_a_request_envelope() {
        let message = SignedMessage::decode(SERVICE_CERTIFICATE_CHALLENGE).unwrap();
        assert_eq!(
            message.r#type,
            Some(MessageType::ServiceCertificateRequest as i32)
        );
    }

    #[test]
    fn well_known_certificates_decode() {
        for cert in [COMMON_PRIVACY_CERT, STAGING_PRIVACY_CERT] {
            let bytes = base64::engine::general_purpose::STANDARD.decode(cert).unwrap();
            let message = SignedMessage::decode(bytes.as_slice()).unwrap();
            assert_eq!(message.r#type, Some(MessageType::ServiceCertificate as i32));
        }
    }
}
