use std::io::Cursor;

use chrono::Utc;
use ciborium::value::Value as CborValue;
use p256::ecdsa::{
    signature::Verifier as _, Signature as P256Signature, VerifyingKey as P256VerifyingKey,
};
use rsa::pkcs1v15::{Signature as RsaSignature, VerifyingKey as RsaVerifyingKey};
use rsa::{BigUint, RsaPublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ceremony::{decode_b64_any, encode_b64url, SerializedAssertion, SerializedAttestation};
use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{ChallengePurpose, Credential};
use crate::services::{BackupCodeService, ChallengeService};

const FLAG_USER_PRESENT: u8 = 0x01;
const FLAG_ATTESTED_DATA: u8 = 0x40;

/// Server-side verification of registration and authentication
/// ceremonies. Every failure is terminal for its challenge; retrying
/// needs a fresh one.
pub struct VerifierService;

struct ParsedAuthData {
    rp_id_hash: [u8; 32],
    flags: u8,
    sign_count: u32,
    credential_id: Option<Vec<u8>>,
    public_key_cose: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct ClientData {
    #[serde(rename = "type")]
    typ: String,
    challenge: String,
    origin: String,
}

enum CredentialVerifyingKey {
    P256(P256VerifyingKey),
    Rsa(RsaPublicKey),
}

impl CredentialVerifyingKey {
    fn verify(&self, signed_data: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            CredentialVerifyingKey::P256(vk) => {
                let sig = P256Signature::from_der(signature)
                    .map_err(|_| AppError::SignatureInvalid)?;
                vk.verify(signed_data, &sig)
                    .map_err(|_| AppError::SignatureInvalid)
            }
            CredentialVerifyingKey::Rsa(rsa_key) => {
                // RS256: RSASSA-PKCS1-v1_5 with SHA-256
                let vk = RsaVerifyingKey::<Sha256>::new(rsa_key.clone());
                let sig = RsaSignature::try_from(signature)
                    .map_err(|_| AppError::SignatureInvalid)?;
                vk.verify(signed_data, &sig)
                    .map_err(|_| AppError::SignatureInvalid)
            }
        }
    }
}

impl VerifierService {
    /// Verify a registration ceremony response and persist the new
    /// credential. When this is the account's first enrollment, the
    /// backup-code batch is generated and the clear codes returned.
    pub async fn register(
        db: &Database,
        config: &Config,
        account_id: &str,
        device_label: Option<String>,
        challenge_id: &str,
        envelope: &SerializedAttestation,
    ) -> Result<(Credential, Option<Vec<String>>)> {
        let challenge =
            ChallengeService::consume(db, challenge_id, ChallengePurpose::Register).await?;
        if challenge.account_id.as_deref() != Some(account_id) {
            return Err(AppError::Forbidden(
                "Challenge belongs to another account".to_string(),
            ));
        }

        let client_data_raw = decode_field(&envelope.client_data_json)?;
        check_client_data(
            &client_data_raw,
            "webauthn.create",
            &challenge.nonce,
            &config.relying_party.rp_origin,
        )?;

        let attestation_object = decode_field(&envelope.attestation_object)?;
        let parsed = parse_attestation_object(&attestation_object)?;
        check_rp_id_hash(&config.relying_party.rp_id, &parsed.rp_id_hash)?;
        if parsed.flags & FLAG_USER_PRESENT == 0 {
            return Err(AppError::BadRequest("User presence required".to_string()));
        }

        let credential_id = parsed
            .credential_id
            .ok_or_else(|| AppError::BadRequest("Missing credential id".to_string()))?;
        let public_key_cose = parsed
            .public_key_cose
            .ok_or_else(|| AppError::BadRequest("Missing credential public key".to_string()))?;
        // The key must parse with a supported algorithm before we store it
        parse_cose_public_key(&public_key_cose)?;

        let envelope_id = decode_field(&envelope.credential_id)?;
        if envelope_id != credential_id {
            return Err(AppError::BadRequest(
                "Credential id does not match attestation".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let inserted = sqlx::query(
            r#"
            INSERT INTO credentials
                (id, account_id, credential_id, public_key_cose, sign_count, device_label, revoked, flagged_at, created_at, last_used_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?, NULL)
            "#,
        )
        .bind(&id)
        .bind(account_id)
        .bind(encode_b64url(&credential_id))
        .bind(encode_b64url(&public_key_cose))
        .bind(parsed.sign_count as i64)
        .bind(device_label.as_deref())
        .bind(&now)
        .execute(db.pool())
        .await;

        if let Err(e) = inserted {
            if e.as_database_error()
                .map(|d| d.is_unique_violation())
                .unwrap_or(false)
            {
                return Err(AppError::Conflict(
                    "Credential is already registered".to_string(),
                ));
            }
            return Err(e.into());
        }

        let backup_codes = if BackupCodeService::has_codes(db, account_id).await? {
            None
        } else {
            Some(
                BackupCodeService::generate(
                    db,
                    account_id,
                    config.stepup.backup_code_count,
                    config.stepup.backup_code_length,
                )
                .await?,
            )
        };

        let credential: Credential = sqlx::query_as("SELECT * FROM credentials WHERE id = ?")
            .bind(&id)
            .fetch_one(db.pool())
            .await?;

        Ok((credential, backup_codes))
    }

    /// Verify an authentication ceremony response: challenge binding,
    /// origin, signature, and the replay counter.
    pub async fn authenticate(
        db: &Database,
        config: &Config,
        challenge_id: &str,
        envelope: &SerializedAssertion,
    ) -> Result<Credential> {
        let challenge =
            ChallengeService::consume(db, challenge_id, ChallengePurpose::Authenticate).await?;

        let credential_id = encode_b64url(&decode_field(&envelope.credential_id)?);
        let credential: Option<Credential> =
            sqlx::query_as("SELECT * FROM credentials WHERE credential_id = ?")
                .bind(&credential_id)
                .fetch_optional(db.pool())
                .await?;
        let mut credential = match credential {
            Some(c) if !c.is_revoked() && !c.is_flagged() => c,
            _ => return Err(AppError::UnknownOrRevokedCredential),
        };
        if let Some(owner) = challenge.account_id.as_deref() {
            if owner != credential.account_id {
                return Err(AppError::UnknownOrRevokedCredential);
            }
        }

        let client_data_raw = decode_field(&envelope.client_data_json)?;
        check_client_data(
            &client_data_raw,
            "webauthn.get",
            &challenge.nonce,
            &config.relying_party.rp_origin,
        )?;

        let authenticator_data = decode_field(&envelope.authenticator_data)?;
        let parsed = parse_auth_data(&authenticator_data, false)?;
        check_rp_id_hash(&config.relying_party.rp_id, &parsed.rp_id_hash)?;
        if parsed.flags & FLAG_USER_PRESENT == 0 {
            return Err(AppError::BadRequest("User presence required".to_string()));
        }

        let public_key_cose = decode_field(&credential.public_key_cose)?;
        let key = parse_cose_public_key(&public_key_cose)?;

        let signature = decode_field(&envelope.signature)?;
        let mut signed_data = Vec::with_capacity(authenticator_data.len() + 32);
        signed_data.extend_from_slice(&authenticator_data);
        signed_data.extend_from_slice(&Sha256::digest(&client_data_raw));
        key.verify(&signed_data, &signature)?;

        // Replay defense. A counter that fails to advance means a second
        // authenticator holds the same key; both zero is the one legal
        // exception (authenticators that never increment).
        let new_count = parsed.sign_count as i64;
        let old_count = credential.sign_count;
        let now = Utc::now().to_rfc3339();

        if new_count == 0 && old_count == 0 {
            sqlx::query("UPDATE credentials SET last_used_at = ? WHERE id = ? AND revoked = 0")
                .bind(&now)
                .bind(&credential.id)
                .execute(db.pool())
                .await?;
        } else if new_count > old_count {
            // CAS on the stored counter: a lost race means another
            // assertion spent this counter value first.
            let affected = sqlx::query(
                r#"
                UPDATE credentials
                SET sign_count = ?, last_used_at = ?
                WHERE id = ? AND sign_count = ? AND revoked = 0
                "#,
            )
            .bind(new_count)
            .bind(&now)
            .bind(&credential.id)
            .bind(old_count)
            .execute(db.pool())
            .await?
            .rows_affected();

            if affected == 0 {
                Self::flag_credential(db, &credential.id).await?;
                return Err(AppError::PossibleCloneDetected(credential.id));
            }
        } else {
            Self::flag_credential(db, &credential.id).await?;
            return Err(AppError::PossibleCloneDetected(credential.id));
        }

        credential.sign_count = new_count;
        credential.last_used_at = Some(now);
        Ok(credential)
    }

    /// A counter regression never grants access; the credential is held
    /// for review instead of failing as a generic invalid response.
    async fn flag_credential(db: &Database, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE credentials SET flagged_at = ? WHERE id = ? AND flagged_at IS NULL")
            .bind(&now)
            .bind(id)
            .execute(db.pool())
            .await?;
        tracing::warn!(credential = %id, "credential flagged for review after counter regression");
        Ok(())
    }
}

fn decode_field(input: &str) -> Result<Vec<u8>> {
    decode_b64_any(input).map_err(|_| AppError::BadRequest("Invalid base64 payload".to_string()))
}

fn check_client_data(
    raw: &[u8],
    expected_type: &str,
    expected_nonce: &str,
    expected_origin: &str,
) -> Result<()> {
    let client_data: ClientData = serde_json::from_slice(raw)
        .map_err(|_| AppError::BadRequest("Invalid client data".to_string()))?;

    if client_data.typ != expected_type {
        return Err(AppError::BadRequest(format!(
            "Invalid ceremony type (expected {})",
            expected_type
        )));
    }

    let expected = decode_field(expected_nonce)?;
    let actual = decode_field(&client_data.challenge)?;
    if expected != actual {
        return Err(AppError::ChallengeMismatch);
    }

    if normalize_origin(&client_data.origin) != normalize_origin(expected_origin) {
        return Err(AppError::OriginMismatch {
            expected: expected_origin.to_string(),
            got: client_data.origin,
        });
    }

    Ok(())
}

fn check_rp_id_hash(rp_id: &str, rp_id_hash: &[u8; 32]) -> Result<()> {
    let expected = Sha256::digest(rp_id.as_bytes());
    if expected.as_slice() == rp_id_hash {
        Ok(())
    } else {
        Err(AppError::BadRequest("Relying party mismatch".to_string()))
    }
}

/// Lowercase scheme and authority, strip trailing slashes and default
/// ports, so textually different spellings of one origin compare equal.
fn normalize_origin(origin: &str) -> String {
    let trimmed = origin.trim().trim_end_matches('/');
    let Some((scheme, remainder)) = trimmed.split_once("://") else {
        return trimmed.to_ascii_lowercase();
    };
    let scheme = scheme.to_ascii_lowercase();
    let authority = remainder
        .split('/')
        .next()
        .unwrap_or(remainder)
        .to_ascii_lowercase();

    let default_port = match scheme.as_str() {
        "http" => Some(":80"),
        "https" => Some(":443"),
        _ => None,
    };
    let authority = match default_port {
        Some(port) => authority
            .strip_suffix(port)
            .unwrap_or(&authority)
            .to_string(),
        None => authority,
    };

    format!("{scheme}://{authority}")
}

fn parse_attestation_object(bytes: &[u8]) -> Result<ParsedAuthData> {
    let value: CborValue = ciborium::de::from_reader(Cursor::new(bytes))
        .map_err(|_| AppError::BadRequest("Invalid attestation object".to_string()))?;
    let map = value
        .as_map()
        .ok_or_else(|| AppError::BadRequest("Invalid attestation object".to_string()))?;
    let auth_data = map_get_text(map, "authData")
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| AppError::BadRequest("Invalid attestation object".to_string()))?;

    // The attestation statement itself is ignored: self-attestation
    // posture, no certificate chain evaluation.
    parse_auth_data(auth_data, true)
}

fn parse_auth_data(data: &[u8], expect_attested_data: bool) -> Result<ParsedAuthData> {
    if data.len() < 37 {
        return Err(AppError::BadRequest(
            "Invalid authenticator data".to_string(),
        ));
    }

    let mut rp_id_hash = [0u8; 32];
    rp_id_hash.copy_from_slice(&data[..32]);
    let flags = data[32];
    let sign_count = u32::from_be_bytes([data[33], data[34], data[35], data[36]]);

    let mut credential_id = None;
    let mut public_key_cose = None;
    if expect_attested_data {
        if flags & FLAG_ATTESTED_DATA == 0 {
            return Err(AppError::BadRequest(
                "Attested credential data missing".to_string(),
            ));
        }
        let mut offset = 37usize;
        if data.len() < offset + 18 {
            return Err(AppError::BadRequest(
                "Invalid attested credential data".to_string(),
            ));
        }
        offset += 16; // aaguid
        let cred_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;

        if data.len() < offset + cred_len {
            return Err(AppError::BadRequest("Invalid credential id".to_string()));
        }
        credential_id = Some(data[offset..offset + cred_len].to_vec());
        offset += cred_len;

        // The COSE key is the remaining CBOR item; record exactly the
        // bytes the parser consumed.
        let mut cursor = Cursor::new(&data[offset..]);
        let _key: CborValue = ciborium::de::from_reader(&mut cursor)
            .map_err(|_| AppError::BadRequest("Invalid credential public key".to_string()))?;
        let used = cursor.position() as usize;
        if used == 0 || offset + used > data.len() {
            return Err(AppError::BadRequest(
                "Invalid credential public key".to_string(),
            ));
        }
        public_key_cose = Some(data[offset..offset + used].to_vec());
    }

    Ok(ParsedAuthData {
        rp_id_hash,
        flags,
        sign_count,
        credential_id,
        public_key_cose,
    })
}

fn parse_cose_public_key(cose_key_bytes: &[u8]) -> Result<CredentialVerifyingKey> {
    let value: CborValue = ciborium::de::from_reader(Cursor::new(cose_key_bytes))
        .map_err(|_| AppError::BadRequest("Invalid credential public key".to_string()))?;
    let map = value
        .as_map()
        .ok_or_else(|| AppError::BadRequest("Invalid credential public key".to_string()))?;

    let kty = map_get_int(map, 1)
        .ok_or_else(|| AppError::BadRequest("Invalid credential public key".to_string()))?;
    let alg = map_get_int(map, 3)
        .ok_or_else(|| AppError::BadRequest("Invalid credential public key".to_string()))?;

    match (kty, alg) {
        // EC2 (kty=2) with ES256 (alg=-7)
        (2, -7) => {
            let crv = map_get_int(map, -1)
                .ok_or_else(|| AppError::BadRequest("Invalid credential public key".to_string()))?;
            if crv != 1 {
                return Err(AppError::BadRequest("Unsupported curve".to_string()));
            }

            let x = map_get_bytes(map, -2)
                .ok_or_else(|| AppError::BadRequest("Invalid credential public key".to_string()))?;
            let y = map_get_bytes(map, -3)
                .ok_or_else(|| AppError::BadRequest("Invalid credential public key".to_string()))?;
            if x.len() != 32 || y.len() != 32 {
                return Err(AppError::BadRequest(
                    "Invalid credential public key length".to_string(),
                ));
            }

            let mut encoded = Vec::with_capacity(65);
            encoded.push(0x04);
            encoded.extend_from_slice(x);
            encoded.extend_from_slice(y);

            let vk = P256VerifyingKey::from_sec1_bytes(&encoded)
                .map_err(|_| AppError::BadRequest("Invalid credential public key".to_string()))?;
            Ok(CredentialVerifyingKey::P256(vk))
        }
        // RSA (kty=3) with RS256 (alg=-257)
        (3, -257) => {
            let n = map_get_bytes(map, -1)
                .ok_or_else(|| AppError::BadRequest("Invalid RSA public key".to_string()))?;
            let e = map_get_bytes(map, -2)
                .ok_or_else(|| AppError::BadRequest("Invalid RSA public key".to_string()))?;

            let rsa_key = RsaPublicKey::new(BigUint::from_bytes_be(n), BigUint::from_bytes_be(e))
                .map_err(|_| AppError::BadRequest("Invalid RSA public key".to_string()))?;
            Ok(CredentialVerifyingKey::Rsa(rsa_key))
        }
        _ => Err(AppError::BadRequest(format!(
            "Unsupported public key type: kty={}, alg={}",
            kty, alg
        ))),
    }
}

fn map_get_text<'a>(map: &'a [(CborValue, CborValue)], key: &str) -> Option<&'a CborValue> {
    map.iter().find_map(|(k, v)| match k {
        CborValue::Text(t) if t == key => Some(v),
        _ => None,
    })
}

fn map_get_int(map: &[(CborValue, CborValue)], key: i128) -> Option<i128> {
    map.iter().find_map(|(k, v)| match (k, v) {
        (CborValue::Integer(ki), CborValue::Integer(vi)) if i128::from(*ki) == key => {
            Some(i128::from(*vi))
        }
        _ => None,
    })
}

fn map_get_bytes(map: &[(CborValue, CborValue)], key: i128) -> Option<&[u8]> {
    map.iter().find_map(|(k, v)| match (k, v) {
        (CborValue::Integer(ki), CborValue::Bytes(b)) if i128::from(*ki) == key => {
            Some(b.as_slice())
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceremony::soft::SoftwareAuthenticator;
    use crate::ceremony::{
        run_registration, CreationOptions, PlatformAuthenticator, RelyingParty, RequestOptions,
        UserVerification, ALG_ES256,
    };

    fn creation_options(challenge: &str) -> CreationOptions {
        CreationOptions {
            rp: RelyingParty {
                id: "localhost".to_string(),
                name: "EduStep".to_string(),
                origin: "http://localhost:3000".to_string(),
            },
            user_handle: "acct-1".to_string(),
            user_name: "acct-1".to_string(),
            challenge: challenge.to_string(),
            algorithms: vec![ALG_ES256],
            exclude_credentials: Vec::new(),
            user_verification: UserVerification::Preferred,
            timeout_ms: 60_000,
        }
    }

    #[test]
    fn auth_data_shorter_than_header_is_rejected() {
        assert!(parse_auth_data(&[0u8; 36], false).is_err());
    }

    #[test]
    fn soft_authenticator_attestation_parses_end_to_end() {
        let authenticator = SoftwareAuthenticator::new();
        let nonce = encode_b64url(b"0123456789abcdef0123456789abcdef");
        let envelope = run_registration(&authenticator, creation_options(&nonce)).unwrap();

        let attestation = decode_field(&envelope.attestation_object).unwrap();
        let parsed = parse_attestation_object(&attestation).unwrap();
        assert_eq!(parsed.sign_count, 0);
        assert!(parsed.flags & FLAG_USER_PRESENT != 0);
        check_rp_id_hash("localhost", &parsed.rp_id_hash).unwrap();

        let key = parse_cose_public_key(&parsed.public_key_cose.unwrap()).unwrap();
        assert!(matches!(key, CredentialVerifyingKey::P256(_)));
    }

    #[test]
    fn assertion_signature_verifies_and_tampering_fails() {
        let authenticator = SoftwareAuthenticator::new();
        let nonce = encode_b64url(b"0123456789abcdef0123456789abcdef");
        let envelope = run_registration(&authenticator, creation_options(&nonce)).unwrap();

        let attestation = decode_field(&envelope.attestation_object).unwrap();
        let parsed = parse_attestation_object(&attestation).unwrap();
        let key = parse_cose_public_key(&parsed.public_key_cose.unwrap()).unwrap();

        let assertion = authenticator
            .assert(&RequestOptions {
                rp_id: "localhost".to_string(),
                origin: "http://localhost:3000".to_string(),
                challenge: nonce,
                allow_credentials: Vec::new(),
                user_verification: UserVerification::Preferred,
                timeout_ms: 60_000,
            })
            .unwrap();

        let mut signed_data = assertion.authenticator_data.clone();
        signed_data.extend_from_slice(&Sha256::digest(&assertion.client_data_json));
        key.verify(&signed_data, &assertion.signature).unwrap();

        signed_data[0] ^= 0xff;
        assert!(matches!(
            key.verify(&signed_data, &assertion.signature),
            Err(AppError::SignatureInvalid)
        ));
    }

    #[test]
    fn client_data_binding_catches_nonce_and_origin_mismatches() {
        let nonce = encode_b64url(b"0123456789abcdef0123456789abcdef");
        let other = encode_b64url(b"ffffffffffffffffffffffffffffffff");
        let raw = serde_json::json!({
            "type": "webauthn.get",
            "challenge": nonce,
            "origin": "http://localhost:3000",
        })
        .to_string()
        .into_bytes();

        check_client_data(&raw, "webauthn.get", &nonce, "http://localhost:3000").unwrap();

        assert!(matches!(
            check_client_data(&raw, "webauthn.get", &other, "http://localhost:3000"),
            Err(AppError::ChallengeMismatch)
        ));
        assert!(matches!(
            check_client_data(&raw, "webauthn.get", &nonce, "https://edustep.example"),
            Err(AppError::OriginMismatch { .. })
        ));
        assert!(check_client_data(&raw, "webauthn.create", &nonce, "http://localhost:3000").is_err());
    }

    #[test]
    fn origin_normalization_strips_default_ports_and_case() {
        assert_eq!(
            normalize_origin("HTTPS://EduStep.example:443/"),
            normalize_origin("https://edustep.example")
        );
        assert_eq!(
            normalize_origin("http://localhost:80"),
            normalize_origin("http://localhost")
        );
        assert_ne!(
            normalize_origin("http://localhost:3000"),
            normalize_origin("http://localhost")
        );
    }
}
