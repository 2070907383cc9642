pub mod backup;
pub mod challenge;
pub mod devices;
pub mod login;
pub mod token;
pub mod totp;
pub mod verifier;

pub use backup::BackupCodeService;
pub use challenge::ChallengeService;
pub use devices::DeviceService;
pub use login::{LoginService, LoginState, PendingLogin, PendingLoginStore, StartOutcome};
pub use token::TokenService;
pub use totp::TotpService;
pub use verifier::VerifierService;
