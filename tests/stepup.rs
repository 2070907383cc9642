use std::sync::Arc;

use edustep::ceremony::soft::SoftwareAuthenticator;
use edustep::ceremony::{
    run_authentication, run_registration, CreationOptions, RelyingParty, RequestOptions,
    UserVerification, ALG_ES256, ALG_RS256,
};
use edustep::config::Config;
use edustep::db::Database;
use edustep::error::AppError;
use edustep::models::{ChallengePurpose, Credential, SecondFactorMethod, PURPOSE_GRANT};
use edustep::services::{
    BackupCodeService, ChallengeService, DeviceService, LoginService, PendingLoginStore,
    StartOutcome, TokenService, TotpService, VerifierService,
};
use tempfile::TempDir;
use totp_rs::TOTP;

struct TestEnv {
    // keeps the database directory alive for the test's duration
    _dir: TempDir,
    db: Database,
    config: Config,
}

async fn setup() -> TestEnv {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("stepup.db");
    let db = Database::new(path.to_str().expect("utf8 path")).await.expect("db");
    db.run_migrations().await.expect("migrations");

    let mut config = Config::default();
    config.tokens.secret = "integration-test-secret".to_string();

    TestEnv {
        _dir: dir,
        db,
        config,
    }
}

fn creation_options(config: &Config, account_id: &str, nonce: &str, exclude: Vec<String>) -> CreationOptions {
    let rp = &config.relying_party;
    CreationOptions {
        rp: RelyingParty {
            id: rp.rp_id.clone(),
            name: rp.rp_name.clone(),
            origin: rp.rp_origin.clone(),
        },
        user_handle: account_id.to_string(),
        user_name: account_id.to_string(),
        challenge: nonce.to_string(),
        algorithms: vec![ALG_ES256, ALG_RS256],
        exclude_credentials: exclude,
        user_verification: UserVerification::Preferred,
        timeout_ms: 60_000,
    }
}

fn request_options(config: &Config, nonce: &str, allow: Vec<String>) -> RequestOptions {
    let rp = &config.relying_party;
    RequestOptions {
        rp_id: rp.rp_id.clone(),
        origin: rp.rp_origin.clone(),
        challenge: nonce.to_string(),
        allow_credentials: allow,
        user_verification: UserVerification::Preferred,
        timeout_ms: 60_000,
    }
}

/// Register a credential for the account and return it with the clear
/// backup codes (if this was the first enrollment).
async fn enroll_passkey(
    env: &TestEnv,
    authenticator: &SoftwareAuthenticator,
    account_id: &str,
) -> (Credential, Option<Vec<String>>) {
    let challenge = ChallengeService::issue(
        &env.db,
        ChallengePurpose::Register,
        Some(account_id),
        env.config.stepup.challenge_ttl_secs,
    )
    .await
    .expect("issue register challenge");

    let exclude = DeviceService::usable_credential_ids(&env.db, account_id)
        .await
        .expect("exclude list");
    let options = creation_options(&env.config, account_id, &challenge.nonce, exclude);
    let envelope = run_registration(authenticator, options).expect("ceremony");

    VerifierService::register(
        &env.db,
        &env.config,
        account_id,
        Some("integration test device".to_string()),
        &challenge.id,
        &envelope,
    )
    .await
    .expect("register")
}

/// Run one authentication ceremony for the account and verify it.
async fn login_once(
    env: &TestEnv,
    authenticator: &SoftwareAuthenticator,
    account_id: &str,
) -> Result<Credential, AppError> {
    let challenge = ChallengeService::issue(
        &env.db,
        ChallengePurpose::Authenticate,
        Some(account_id),
        env.config.stepup.challenge_ttl_secs,
    )
    .await?;
    let allow = DeviceService::usable_credential_ids(&env.db, account_id).await?;
    let envelope = run_authentication(
        authenticator,
        request_options(&env.config, &challenge.nonce, allow),
    )
    .expect("assertion ceremony");
    VerifierService::authenticate(&env.db, &env.config, &challenge.id, &envelope).await
}

#[tokio::test]
async fn challenge_is_consumed_exactly_once() {
    let env = setup().await;
    let challenge = ChallengeService::issue(
        &env.db,
        ChallengePurpose::Register,
        Some("acct-1"),
        300,
    )
    .await
    .unwrap();

    ChallengeService::consume(&env.db, &challenge.id, ChallengePurpose::Register)
        .await
        .unwrap();
    let err = ChallengeService::consume(&env.db, &challenge.id, ChallengePurpose::Register)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ChallengeInvalid(_)));
}

#[tokio::test]
async fn concurrent_consumers_race_to_exactly_one_success() {
    let env = setup().await;
    let challenge = ChallengeService::issue(
        &env.db,
        ChallengePurpose::Authenticate,
        None,
        300,
    )
    .await
    .unwrap();

    let db = Arc::new(env.db.clone());
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        let id = challenge.id.clone();
        tasks.push(tokio::spawn(async move {
            ChallengeService::consume(&db, &id, ChallengePurpose::Authenticate).await
        }));
    }

    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn challenges_are_bound_to_purpose_and_ttl() {
    let env = setup().await;

    let register = ChallengeService::issue(&env.db, ChallengePurpose::Register, None, 300)
        .await
        .unwrap();
    let err = ChallengeService::consume(&env.db, &register.id, ChallengePurpose::Authenticate)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ChallengeInvalid(ref r) if r.contains("purpose")));

    let expired = ChallengeService::issue(&env.db, ChallengePurpose::Register, None, -1)
        .await
        .unwrap();
    let err = ChallengeService::consume(&env.db, &expired.id, ChallengePurpose::Register)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ChallengeInvalid(ref r) if r.contains("expired")));

    // the expired row was eagerly deleted
    let err = ChallengeService::consume(&env.db, &expired.id, ChallengePurpose::Register)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ChallengeInvalid(ref r) if r.contains("unknown")));
}

#[tokio::test]
async fn registration_round_trip_then_counter_advancing_login() {
    let env = setup().await;
    let authenticator = SoftwareAuthenticator::new();

    let (credential, codes) = enroll_passkey(&env, &authenticator, "acct-1").await;
    assert_eq!(credential.sign_count, 0);
    assert_eq!(codes.expect("first enrollment emits codes").len(), 10);

    // second enrollment must not reissue the batch
    let (_, codes) = enroll_passkey(&env, &authenticator, "acct-1").await;
    assert!(codes.is_none());

    let verified = login_once(&env, &authenticator, "acct-1").await.unwrap();
    assert_eq!(verified.account_id, "acct-1");
    assert!(verified.sign_count > 0);

    let again = login_once(&env, &authenticator, "acct-1").await.unwrap();
    assert!(again.sign_count > verified.sign_count);
}

#[tokio::test]
async fn replayed_assertion_is_rejected() {
    let env = setup().await;
    let authenticator = SoftwareAuthenticator::new();
    enroll_passkey(&env, &authenticator, "acct-1").await;

    let challenge = ChallengeService::issue(
        &env.db,
        ChallengePurpose::Authenticate,
        Some("acct-1"),
        300,
    )
    .await
    .unwrap();
    let allow = DeviceService::usable_credential_ids(&env.db, "acct-1").await.unwrap();
    let envelope = run_authentication(
        &authenticator,
        request_options(&env.config, &challenge.nonce, allow),
    )
    .unwrap();

    VerifierService::authenticate(&env.db, &env.config, &challenge.id, &envelope)
        .await
        .unwrap();

    // byte-for-byte replay: the challenge is already spent
    let err = VerifierService::authenticate(&env.db, &env.config, &challenge.id, &envelope)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ChallengeInvalid(_)));
}

#[tokio::test]
async fn counter_regression_flags_the_credential() {
    let env = setup().await;
    let authenticator = SoftwareAuthenticator::new();
    let (credential, _) = enroll_passkey(&env, &authenticator, "acct-1").await;

    login_once(&env, &authenticator, "acct-1").await.unwrap();

    // a cloned authenticator re-plays an old counter value
    authenticator.force_counter(&credential.credential_id, 0);
    let err = login_once(&env, &authenticator, "acct-1").await.unwrap_err();
    assert!(matches!(err, AppError::PossibleCloneDetected(_)));

    // the flagged credential is held for review: even a well-formed
    // assertion is refused now
    authenticator.force_counter(&credential.credential_id, 100);
    let err = login_once(&env, &authenticator, "acct-1").await.unwrap_err();
    assert!(matches!(err, AppError::UnknownOrRevokedCredential));
}

#[tokio::test]
async fn zero_counter_authenticators_stay_valid() {
    let env = setup().await;
    let authenticator = SoftwareAuthenticator::with_counter_step(0);
    enroll_passkey(&env, &authenticator, "acct-1").await;

    // 0 -> 0 is the documented exception for authenticators that never
    // increment; consecutive logins keep working
    login_once(&env, &authenticator, "acct-1").await.unwrap();
    login_once(&env, &authenticator, "acct-1").await.unwrap();
}

#[tokio::test]
async fn revoke_is_idempotent_and_blocks_login() {
    let env = setup().await;
    let authenticator = SoftwareAuthenticator::new();
    let (credential, _) = enroll_passkey(&env, &authenticator, "acct-1").await;

    assert_eq!(DeviceService::list(&env.db, "acct-1").await.unwrap().len(), 1);

    DeviceService::revoke(&env.db, "acct-1", &credential.id).await.unwrap();
    DeviceService::revoke(&env.db, "acct-1", &credential.id).await.unwrap();

    assert!(DeviceService::list(&env.db, "acct-1").await.unwrap().is_empty());

    // the soft authenticator still holds the key; the server must refuse
    let challenge = ChallengeService::issue(
        &env.db,
        ChallengePurpose::Authenticate,
        Some("acct-1"),
        300,
    )
    .await
    .unwrap();
    let envelope = run_authentication(
        &authenticator,
        request_options(&env.config, &challenge.nonce, Vec::new()),
    )
    .unwrap();
    let err = VerifierService::authenticate(&env.db, &env.config, &challenge.id, &envelope)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UnknownOrRevokedCredential));

    // revoking the passkey left the backup codes alone
    assert_eq!(BackupCodeService::remaining(&env.db, "acct-1").await.unwrap(), 10);
}

#[tokio::test]
async fn totp_enrollment_and_backup_codes_end_to_end() {
    let env = setup().await;

    let (secret, url) = TotpService::begin_enrollment(&env.db, &env.config, "acct-1")
        .await
        .unwrap();
    let totp = TOTP::from_url(&url).expect("provisioning uri");
    assert_eq!(totp.get_secret_base32(), secret);

    // a wrong code never enables the factor
    let err = TotpService::confirm_enrollment(&env.db, &env.config, "acct-1", "000000")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTotpCode));
    assert!(!TotpService::is_enabled(&env.db, "acct-1").await.unwrap());

    let code = totp.generate_current().unwrap();
    let codes = TotpService::confirm_enrollment(&env.db, &env.config, "acct-1", &code)
        .await
        .unwrap()
        .expect("first enrollment emits codes");
    assert_eq!(codes.len(), 10);
    assert!(TotpService::is_enabled(&env.db, "acct-1").await.unwrap());

    // spend one code, then try to spend it again
    let remaining = BackupCodeService::consume(&env.db, "acct-1", &codes[0])
        .await
        .unwrap();
    assert_eq!(remaining, 9);
    let err = BackupCodeService::consume(&env.db, "acct-1", &codes[0])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidOrUsedBackupCode));
}

#[tokio::test]
async fn backup_code_batch_never_exceeds_its_size() {
    let env = setup().await;
    let codes = BackupCodeService::generate(&env.db, "acct-1", 10, 8).await.unwrap();

    // concurrent attempts on one code: exactly one wins
    let db = Arc::new(env.db.clone());
    let mut tasks = Vec::new();
    for _ in 0..6 {
        let db = db.clone();
        let code = codes[0].clone();
        tasks.push(tokio::spawn(async move {
            BackupCodeService::consume(&db, "acct-1", &code).await
        }));
    }
    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);

    // spending every remaining code yields exactly nine more successes
    for code in &codes[1..] {
        BackupCodeService::consume(&env.db, "acct-1", code).await.unwrap();
    }
    assert_eq!(BackupCodeService::remaining(&env.db, "acct-1").await.unwrap(), 0);
    for code in &codes {
        assert!(BackupCodeService::consume(&env.db, "acct-1", code).await.is_err());
    }
}

#[tokio::test]
async fn login_without_second_factor_grants_immediately() {
    let env = setup().await;
    let store = PendingLoginStore::new(env.config.stepup.pending_login_ttl_secs);

    match LoginService::start(&env.db, &store, &env.config, "acct-bare").await.unwrap() {
        StartOutcome::Granted { grant_token } => {
            let claims =
                TokenService::validate(&grant_token, &env.config, PURPOSE_GRANT).unwrap();
            assert_eq!(claims.sub, "acct-bare");
        }
        StartOutcome::Pending { .. } => panic!("no second factor is enrolled"),
    }
}

#[tokio::test]
async fn login_with_enrolled_factors_requires_a_second_factor() {
    let env = setup().await;
    let authenticator = SoftwareAuthenticator::new();
    enroll_passkey(&env, &authenticator, "acct-1").await;

    let store = PendingLoginStore::new(env.config.stepup.pending_login_ttl_secs);
    let pending = match LoginService::start(&env.db, &store, &env.config, "acct-1").await.unwrap() {
        StartOutcome::Pending { pending, methods } => {
            assert!(methods
                .iter()
                .any(|m| matches!(m, SecondFactorMethod::Passkey)));
            assert!(methods
                .iter()
                .any(|m| matches!(m, SecondFactorMethod::BackupCode)));
            pending
        }
        StartOutcome::Granted { .. } => panic!("a second factor is enrolled"),
    };

    // a verified factor completes the attempt and consumes it
    let verified = login_once(&env, &authenticator, "acct-1").await.unwrap();
    assert_eq!(verified.account_id, pending.account_id);
    let grant_token = LoginService::grant(&store, &env.config, &pending.id).await.unwrap();
    TokenService::validate(&grant_token, &env.config, PURPOSE_GRANT).unwrap();

    // the pending login is single-use
    let err = LoginService::grant(&store, &env.config, &pending.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn expired_login_attempt_gets_no_partial_credit() {
    let env = setup().await;
    let authenticator = SoftwareAuthenticator::new();
    enroll_passkey(&env, &authenticator, "acct-1").await;

    let store = PendingLoginStore::new(-1);
    let pending = match LoginService::start(&env.db, &store, &env.config, "acct-1").await.unwrap() {
        StartOutcome::Pending { pending, .. } => pending,
        StartOutcome::Granted { .. } => panic!("a second factor is enrolled"),
    };

    // the factor verification itself may have succeeded, but the
    // attempt is gone; the login restarts from the primary check
    let err = LoginService::grant(&store, &env.config, &pending.id).await.unwrap_err();
    assert!(matches!(err, AppError::SecondFactorTimeout));
}

#[tokio::test]
async fn totp_disable_removes_only_the_totp_factor() {
    let env = setup().await;

    let (_, url) = TotpService::begin_enrollment(&env.db, &env.config, "acct-1")
        .await
        .unwrap();
    let totp = TOTP::from_url(&url).unwrap();
    let code = totp.generate_current().unwrap();
    TotpService::confirm_enrollment(&env.db, &env.config, "acct-1", &code)
        .await
        .unwrap();

    TotpService::disable(&env.db, "acct-1").await.unwrap();
    assert!(!TotpService::is_enabled(&env.db, "acct-1").await.unwrap());

    // backup codes survive the disable
    assert_eq!(BackupCodeService::remaining(&env.db, "acct-1").await.unwrap(), 10);

    let err = TotpService::disable(&env.db, "acct-1").await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}
