//! Dactyl Auth - fingerprint authentication for login flows
//!
//! This crate is the consumer side of the dactyl service. It discovers
//! a fingerprint device, claims it, drives a verify cycle, and - for
//! hosts that want it - races the scan against a password prompt,
//! accepting whichever produces a decisive result first.

pub mod client;
pub mod messages;
pub mod race;
pub mod verify;

pub use client::{ClientError, DactylClient, DeviceProps};
pub use dactyl_daemon::ipc::SignalBody;
pub use dactyl_daemon::CancelFlag;
pub use race::{authenticate, AuthDecision, PasswordPrompt, RacePolicy, RaceStatus};
pub use verify::{run_fingerprint, Feedback, FingerOutcome, SilentFeedback, VerifyPolicy};
