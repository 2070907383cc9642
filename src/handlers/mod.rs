pub mod backup;
pub mod devices;
pub mod enroll;
pub mod login;
pub mod totp;
