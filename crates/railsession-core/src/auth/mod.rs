//! Login protocols for the ticketing service.
//!
//! This module provides:
//! - `LoginProtocol`: QR polling, credential+captcha and slide-captcha logins,
//!   all ending in the same two-step token exchange
//! - `FingerprintAcquirer`: the anti-bot device fingerprint every login needs
//! - solver/presenter traits for the external services a login leans on
//! - `Keychain`: OS keychain lookup for account passwords

pub mod fingerprint;
pub mod keychain;
pub mod login;
pub mod qr;
pub mod solvers;

pub use fingerprint::{FingerprintAcquirer, FingerprintEndpoint, FingerprintSettings, PinnedFingerprint};
pub use keychain::Keychain;
pub use login::{AccountCredentials, CredentialBundle, LoginError, LoginProtocol, LoginVariant};
pub use qr::{LoginAttempt, QrStatus, QR_WATCHDOG_SECS};
pub use solvers::{
    CaptchaSolver, HttpCaptchaSolver, HttpSlideSolver, LogPresenter, QrPresenter, SlideSolver,
    SlideTicket,
};
