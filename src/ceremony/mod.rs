//! Client-side ceremony coordination for the platform authenticator.
//!
//! This module builds ceremony input from server-issued challenge
//! parameters, invokes the local authenticator behind the
//! [`PlatformAuthenticator`] seam, and serializes the result into
//! transport-safe envelopes. It holds no secrets and verifies nothing;
//! all verification happens server-side.

pub mod soft;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// COSE algorithm identifiers offered to authenticators.
pub const ALG_ES256: i64 = -7;
pub const ALG_RS256: i64 = -257;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelyingParty {
    pub id: String,
    pub name: String,
    pub origin: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserVerification {
    Required,
    Preferred,
    Discouraged,
}

/// Parameters for a registration (create) ceremony. `challenge` is the
/// base64url nonce issued by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationOptions {
    pub rp: RelyingParty,
    pub user_handle: String,
    pub user_name: String,
    pub challenge: String,
    pub algorithms: Vec<i64>,
    /// Credential ids (base64url) already enrolled for this account, so
    /// an authenticator does not register the same key twice.
    pub exclude_credentials: Vec<String>,
    pub user_verification: UserVerification,
    pub timeout_ms: u64,
}

/// Parameters for an authentication (assert) ceremony.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub rp_id: String,
    pub origin: String,
    pub challenge: String,
    pub allow_credentials: Vec<String>,
    pub user_verification: UserVerification,
    pub timeout_ms: u64,
}

/// Raw authenticator output for a registration ceremony.
#[derive(Debug, Clone)]
pub struct AttestationOutput {
    pub credential_id: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub attestation_object: Vec<u8>,
}

/// Raw authenticator output for an authentication ceremony.
#[derive(Debug, Clone)]
pub struct AssertionOutput {
    pub credential_id: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Client-side ceremony failures. All of these are recoverable by
/// retrying with a fresh challenge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthenticatorError {
    #[error("no platform authenticator is available")]
    Unavailable,
    #[error("the user cancelled the ceremony")]
    Cancelled,
    #[error("no credential on this authenticator matches the relying party")]
    NoMatchingCredential,
    #[error("the ceremony timed out")]
    Timeout,
}

/// The local authenticator seam. Implementations perform the actual
/// create/assert interaction (biometric prompt, key generation, signing).
pub trait PlatformAuthenticator {
    fn create(&self, options: &CreationOptions) -> Result<AttestationOutput, AuthenticatorError>;
    fn assert(&self, options: &RequestOptions) -> Result<AssertionOutput, AuthenticatorError>;
}

/// Transport envelope for a registration response, all fields base64url.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedAttestation {
    pub credential_id: String,
    pub client_data_json: String,
    pub attestation_object: String,
}

impl SerializedAttestation {
    pub fn from_output(output: &AttestationOutput) -> Self {
        Self {
            credential_id: encode_b64url(&output.credential_id),
            client_data_json: encode_b64url(&output.client_data_json),
            attestation_object: encode_b64url(&output.attestation_object),
        }
    }
}

/// Transport envelope for an authentication response, all fields base64url.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedAssertion {
    pub credential_id: String,
    pub client_data_json: String,
    pub authenticator_data: String,
    pub signature: String,
}

impl SerializedAssertion {
    pub fn from_output(output: &AssertionOutput) -> Self {
        Self {
            credential_id: encode_b64url(&output.credential_id),
            client_data_json: encode_b64url(&output.client_data_json),
            authenticator_data: encode_b64url(&output.authenticator_data),
            signature: encode_b64url(&output.signature),
        }
    }
}

/// Coordinator state. The ceremony advances only through [`advance`];
/// there is no hidden mutable state.
#[derive(Debug, Clone, PartialEq)]
pub enum CeremonyState {
    Idle,
    AwaitingCreate(CreationOptions),
    AwaitingAssert(RequestOptions),
    Registered(SerializedAttestation),
    Asserted(SerializedAssertion),
    Failed(AuthenticatorError),
}

#[derive(Debug, Clone)]
pub enum CeremonyEvent {
    BeginRegistration(CreationOptions),
    BeginAuthentication(RequestOptions),
    CreateCompleted(AttestationOutput),
    AssertCompleted(AssertionOutput),
    AuthenticatorFailed(AuthenticatorError),
}

/// Side effects the caller must execute after a transition.
#[derive(Debug, Clone)]
pub enum CeremonyEffect {
    InvokeCreate(CreationOptions),
    InvokeAssert(RequestOptions),
    SubmitAttestation(SerializedAttestation),
    SubmitAssertion(SerializedAssertion),
}

#[derive(Debug)]
pub struct Transition {
    pub state: CeremonyState,
    pub effects: Vec<CeremonyEffect>,
}

/// Pure transition function for the ceremony. Out-of-order events leave
/// the state unchanged and produce no effects.
pub fn advance(state: CeremonyState, event: CeremonyEvent) -> Transition {
    match (state, event) {
        (CeremonyState::Idle, CeremonyEvent::BeginRegistration(options)) => Transition {
            state: CeremonyState::AwaitingCreate(options.clone()),
            effects: vec![CeremonyEffect::InvokeCreate(options)],
        },
        (CeremonyState::Idle, CeremonyEvent::BeginAuthentication(options)) => Transition {
            state: CeremonyState::AwaitingAssert(options.clone()),
            effects: vec![CeremonyEffect::InvokeAssert(options)],
        },
        (CeremonyState::AwaitingCreate(_), CeremonyEvent::CreateCompleted(output)) => {
            let envelope = SerializedAttestation::from_output(&output);
            Transition {
                state: CeremonyState::Registered(envelope.clone()),
                effects: vec![CeremonyEffect::SubmitAttestation(envelope)],
            }
        }
        (CeremonyState::AwaitingAssert(_), CeremonyEvent::AssertCompleted(output)) => {
            let envelope = SerializedAssertion::from_output(&output);
            Transition {
                state: CeremonyState::Asserted(envelope.clone()),
                effects: vec![CeremonyEffect::SubmitAssertion(envelope)],
            }
        }
        (
            CeremonyState::AwaitingCreate(_) | CeremonyState::AwaitingAssert(_),
            CeremonyEvent::AuthenticatorFailed(err),
        ) => Transition {
            state: CeremonyState::Failed(err),
            effects: Vec::new(),
        },
        (state, _) => Transition {
            state,
            effects: Vec::new(),
        },
    }
}

/// Drive a full registration ceremony against an authenticator and
/// return the transport envelope.
pub fn run_registration<A: PlatformAuthenticator>(
    authenticator: &A,
    options: CreationOptions,
) -> Result<SerializedAttestation, AuthenticatorError> {
    let begun = advance(CeremonyState::Idle, CeremonyEvent::BeginRegistration(options));
    let event = match begun.effects.into_iter().next() {
        Some(CeremonyEffect::InvokeCreate(options)) => match authenticator.create(&options) {
            Ok(output) => CeremonyEvent::CreateCompleted(output),
            Err(err) => CeremonyEvent::AuthenticatorFailed(err),
        },
        _ => return Err(AuthenticatorError::Unavailable),
    };
    match advance(begun.state, event).state {
        CeremonyState::Registered(envelope) => Ok(envelope),
        CeremonyState::Failed(err) => Err(err),
        _ => Err(AuthenticatorError::Unavailable),
    }
}

/// Drive a full authentication ceremony against an authenticator.
pub fn run_authentication<A: PlatformAuthenticator>(
    authenticator: &A,
    options: RequestOptions,
) -> Result<SerializedAssertion, AuthenticatorError> {
    let begun = advance(CeremonyState::Idle, CeremonyEvent::BeginAuthentication(options));
    let event = match begun.effects.into_iter().next() {
        Some(CeremonyEffect::InvokeAssert(options)) => match authenticator.assert(&options) {
            Ok(output) => CeremonyEvent::AssertCompleted(output),
            Err(err) => CeremonyEvent::AuthenticatorFailed(err),
        },
        _ => return Err(AuthenticatorError::Unavailable),
    };
    match advance(begun.state, event).state {
        CeremonyState::Asserted(envelope) => Ok(envelope),
        CeremonyState::Failed(err) => Err(err),
        _ => Err(AuthenticatorError::Unavailable),
    }
}

pub fn encode_b64url(bytes: &[u8]) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64 in any of the encodings seen from client stacks:
/// url-safe with or without padding, or standard.
pub fn decode_b64_any(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let s = input.trim();
    if let Ok(v) = general_purpose::URL_SAFE_NO_PAD.decode(s) {
        return Ok(v);
    }
    if let Ok(v) = general_purpose::URL_SAFE.decode(s) {
        return Ok(v);
    }
    general_purpose::STANDARD.decode(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creation_options() -> CreationOptions {
        CreationOptions {
            rp: RelyingParty {
                id: "localhost".to_string(),
                name: "EduStep".to_string(),
                origin: "http://localhost:3000".to_string(),
            },
            user_handle: "acct-1".to_string(),
            user_name: "acct-1".to_string(),
            challenge: encode_b64url(b"0123456789abcdef0123456789abcdef"),
            algorithms: vec![ALG_ES256],
            exclude_credentials: Vec::new(),
            user_verification: UserVerification::Preferred,
            timeout_ms: 60_000,
        }
    }

    #[test]
    fn begin_registration_emits_invoke_effect() {
        let options = creation_options();
        let t = advance(
            CeremonyState::Idle,
            CeremonyEvent::BeginRegistration(options.clone()),
        );
        assert_eq!(t.state, CeremonyState::AwaitingCreate(options.clone()));
        assert!(matches!(
            t.effects.as_slice(),
            [CeremonyEffect::InvokeCreate(o)] if *o == options
        ));
    }

    #[test]
    fn authenticator_failure_is_terminal() {
        let options = creation_options();
        let t = advance(
            CeremonyState::Idle,
            CeremonyEvent::BeginRegistration(options),
        );
        let t = advance(
            t.state,
            CeremonyEvent::AuthenticatorFailed(AuthenticatorError::Cancelled),
        );
        assert_eq!(t.state, CeremonyState::Failed(AuthenticatorError::Cancelled));
        assert!(t.effects.is_empty());
    }

    #[test]
    fn out_of_order_events_are_ignored() {
        let output = AssertionOutput {
            credential_id: vec![1],
            client_data_json: vec![2],
            authenticator_data: vec![3],
            signature: vec![4],
        };
        let t = advance(CeremonyState::Idle, CeremonyEvent::AssertCompleted(output));
        assert_eq!(t.state, CeremonyState::Idle);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn decode_accepts_url_safe_and_standard_base64() {
        let bytes: &[u8] = b"\xfb\xef\xbe\x01\x02";
        assert_eq!(decode_b64_any(&encode_b64url(bytes)).unwrap(), bytes);
        assert_eq!(
            decode_b64_any(&general_purpose::URL_SAFE.encode(bytes)).unwrap(),
            bytes
        );
        assert_eq!(
            decode_b64_any(&general_purpose::STANDARD.encode(bytes)).unwrap(),
            bytes
        );
        assert!(decode_b64_any("not base64 at all!").is_err());
    }
}
