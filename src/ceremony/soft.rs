//! In-process platform authenticator with resident P-256 credentials.
//! Backs the integration tests and any headless client of the ceremony
//! module; speaks the same byte formats as a hardware authenticator.

use std::collections::HashMap;
use std::sync::Mutex;

use ciborium::value::Value;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{
    decode_b64_any, AssertionOutput, AttestationOutput, AuthenticatorError, CreationOptions,
    PlatformAuthenticator, RequestOptions,
};

const FLAG_USER_PRESENT: u8 = 0x01;
const FLAG_USER_VERIFIED: u8 = 0x04;
const FLAG_ATTESTED_DATA: u8 = 0x40;

struct SoftCredential {
    rp_id: String,
    key: SigningKey,
    sign_count: u32,
}

pub struct SoftwareAuthenticator {
    credentials: Mutex<HashMap<Vec<u8>, SoftCredential>>,
    /// Counter increment per assertion; 0 models authenticators that
    /// never increment their signature counter.
    counter_step: u32,
    fail_with: Mutex<Option<AuthenticatorError>>,
}

impl SoftwareAuthenticator {
    pub fn new() -> Self {
        Self::with_counter_step(1)
    }

    pub fn with_counter_step(counter_step: u32) -> Self {
        Self {
            credentials: Mutex::new(HashMap::new()),
            counter_step,
            fail_with: Mutex::new(None),
        }
    }

    /// Make the next ceremony fail with the given error.
    pub fn fail_next(&self, err: AuthenticatorError) {
        if let Ok(mut slot) = self.fail_with.lock() {
            *slot = Some(err);
        }
    }

    /// Rewind or advance a stored credential's counter, for exercising
    /// clone-detection paths.
    pub fn force_counter(&self, credential_id: &str, value: u32) {
        let Ok(raw) = decode_b64_any(credential_id) else {
            return;
        };
        if let Ok(mut credentials) = self.credentials.lock() {
            if let Some(credential) = credentials.get_mut(&raw) {
                credential.sign_count = value;
            }
        }
    }

    fn take_failure(&self) -> Option<AuthenticatorError> {
        self.fail_with.lock().ok().and_then(|mut slot| slot.take())
    }

    fn client_data(kind: &str, challenge: &str, origin: &str) -> Vec<u8> {
        serde_json::json!({
            "type": kind,
            "challenge": challenge,
            "origin": origin,
        })
        .to_string()
        .into_bytes()
    }

    fn cose_key(key: &SigningKey) -> Result<Vec<u8>, AuthenticatorError> {
        let point = key.verifying_key().to_encoded_point(false);
        let bytes = point.as_bytes(); // 0x04 || x || y
        let map = Value::Map(vec![
            (Value::Integer(1.into()), Value::Integer(2.into())), // kty: EC2
            (Value::Integer(3.into()), Value::Integer((-7).into())), // alg: ES256
            (Value::Integer((-1).into()), Value::Integer(1.into())), // crv: P-256
            (Value::Integer((-2).into()), Value::Bytes(bytes[1..33].to_vec())),
            (Value::Integer((-3).into()), Value::Bytes(bytes[33..65].to_vec())),
        ]);
        let mut out = Vec::new();
        ciborium::ser::into_writer(&map, &mut out).map_err(|_| AuthenticatorError::Unavailable)?;
        Ok(out)
    }
}

impl Default for SoftwareAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformAuthenticator for SoftwareAuthenticator {
    fn create(&self, options: &CreationOptions) -> Result<AttestationOutput, AuthenticatorError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let mut credential_id = vec![0u8; 16];
        OsRng.fill_bytes(&mut credential_id);
        let key = SigningKey::random(&mut OsRng);

        // rpIdHash || flags || signCount || aaguid || credIdLen || credId || COSE key
        let mut auth_data = Vec::new();
        auth_data.extend_from_slice(&Sha256::digest(options.rp.id.as_bytes()));
        auth_data.push(FLAG_USER_PRESENT | FLAG_USER_VERIFIED | FLAG_ATTESTED_DATA);
        auth_data.extend_from_slice(&0u32.to_be_bytes());
        auth_data.extend_from_slice(&[0u8; 16]);
        auth_data.extend_from_slice(&(credential_id.len() as u16).to_be_bytes());
        auth_data.extend_from_slice(&credential_id);
        auth_data.extend_from_slice(&Self::cose_key(&key)?);

        // Self-attestation: fmt "none" with an empty statement
        let attestation = Value::Map(vec![
            (Value::Text("fmt".into()), Value::Text("none".into())),
            (Value::Text("attStmt".into()), Value::Map(Vec::new())),
            (Value::Text("authData".into()), Value::Bytes(auth_data)),
        ]);
        let mut attestation_object = Vec::new();
        ciborium::ser::into_writer(&attestation, &mut attestation_object)
            .map_err(|_| AuthenticatorError::Unavailable)?;

        let client_data_json =
            Self::client_data("webauthn.create", &options.challenge, &options.rp.origin);

        let mut credentials = self
            .credentials
            .lock()
            .map_err(|_| AuthenticatorError::Unavailable)?;
        credentials.insert(
            credential_id.clone(),
            SoftCredential {
                rp_id: options.rp.id.clone(),
                key,
                sign_count: 0,
            },
        );

        Ok(AttestationOutput {
            credential_id,
            client_data_json,
            attestation_object,
        })
    }

    fn assert(&self, options: &RequestOptions) -> Result<AssertionOutput, AuthenticatorError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let mut credentials = self
            .credentials
            .lock()
            .map_err(|_| AuthenticatorError::Unavailable)?;

        let allow: Vec<Vec<u8>> = options
            .allow_credentials
            .iter()
            .filter_map(|id| decode_b64_any(id).ok())
            .collect();

        let credential_id = credentials
            .iter()
            .find(|(id, credential)| {
                credential.rp_id == options.rp_id && (allow.is_empty() || allow.contains(id))
            })
            .map(|(id, _)| id.clone())
            .ok_or(AuthenticatorError::NoMatchingCredential)?;

        let credential = credentials
            .get_mut(&credential_id)
            .ok_or(AuthenticatorError::NoMatchingCredential)?;
        credential.sign_count = credential.sign_count.wrapping_add(self.counter_step);

        let mut authenticator_data = Vec::with_capacity(37);
        authenticator_data.extend_from_slice(&Sha256::digest(options.rp_id.as_bytes()));
        authenticator_data.push(FLAG_USER_PRESENT | FLAG_USER_VERIFIED);
        authenticator_data.extend_from_slice(&credential.sign_count.to_be_bytes());

        let client_data_json =
            Self::client_data("webauthn.get", &options.challenge, &options.origin);

        let mut signed = authenticator_data.clone();
        signed.extend_from_slice(&Sha256::digest(&client_data_json));
        let signature: Signature = credential.key.sign(&signed);

        Ok(AssertionOutput {
            credential_id,
            client_data_json,
            authenticator_data,
            signature: signature.to_der().as_bytes().to_vec(),
        })
    }
}
