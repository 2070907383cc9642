pub mod account;
pub mod backup;
pub mod challenge;
pub mod credential;
pub mod login;
pub mod totp;

pub use account::*;
pub use backup::*;
pub use challenge::*;
pub use credential::*;
pub use login::*;
pub use totp::*;
