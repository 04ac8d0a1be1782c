//! Dactyl Core - Shared types and wire names for the fingerprint service
//!
//! This crate provides the foundational types used by the daemon, the
//! authentication consumer and the CLI: device identities, the finger
//! naming table, biometric templates, operation status names and the
//! error taxonomy surfaced over IPC.

pub mod error;
pub mod finger;
pub mod status;
pub mod template;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use finger::{Finger, FingerRequest};
pub use status::{EnrollStatus, RetryHint, VerifyStatus};
pub use template::{Template, TemplateData};
pub use types::{DeviceId, ScanType};

/// Seconds of full idleness before the daemon exits
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Default number of verification attempts in the authentication consumer
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Default per-attempt verification timeout in the authentication consumer
pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 30;
