//! Operation status names reported through status signals
//!
//! Every hardware callback is classified into one of these outcomes.
//! Retry-class outcomes are not terminal: the controller resubmits the
//! same operation and reports the retry as a non-final status event.

/// Transient, user-correctable scan problems reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// The swipe was too short
    TooShort,
    /// The finger was not centered on the sensor
    CenterFinger,
    /// Remove the finger and try again
    RemoveFinger,
    /// Generic "scan again"
    Generic,
}

/// Status of a verify or identify operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Match,
    NoMatch,
    Retry(RetryHint),
    Disconnected,
    UnknownError,
}

impl VerifyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyStatus::Match => "verify-match",
            VerifyStatus::NoMatch => "verify-no-match",
            VerifyStatus::Retry(RetryHint::TooShort) => "verify-swipe-too-short",
            VerifyStatus::Retry(RetryHint::CenterFinger) => "verify-finger-not-centered",
            VerifyStatus::Retry(RetryHint::RemoveFinger) => "verify-remove-and-retry",
            VerifyStatus::Retry(RetryHint::Generic) => "verify-retry-scan",
            VerifyStatus::Disconnected => "verify-disconnected",
            VerifyStatus::UnknownError => "verify-unknown-error",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "verify-match" => Some(VerifyStatus::Match),
            "verify-no-match" => Some(VerifyStatus::NoMatch),
            "verify-swipe-too-short" => Some(VerifyStatus::Retry(RetryHint::TooShort)),
            "verify-finger-not-centered" => Some(VerifyStatus::Retry(RetryHint::CenterFinger)),
            "verify-remove-and-retry" => Some(VerifyStatus::Retry(RetryHint::RemoveFinger)),
            "verify-retry-scan" => Some(VerifyStatus::Retry(RetryHint::Generic)),
            "verify-disconnected" => Some(VerifyStatus::Disconnected),
            "verify-unknown-error" => Some(VerifyStatus::UnknownError),
            _ => None,
        }
    }

    /// Whether this status ends the operation.
    pub fn is_final(&self) -> bool {
        !matches!(self, VerifyStatus::Retry(_))
    }
}

impl std::fmt::Display for VerifyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an enroll operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollStatus {
    /// One stage finished, more to go
    StagePassed,
    Completed,
    Failed,
    Retry(RetryHint),
    Disconnected,
    /// On-device template storage is exhausted
    DataFull,
    UnknownError,
}

impl EnrollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollStatus::StagePassed => "enroll-stage-passed",
            EnrollStatus::Completed => "enroll-completed",
            EnrollStatus::Failed => "enroll-failed",
            EnrollStatus::Retry(RetryHint::TooShort) => "enroll-swipe-too-short",
            EnrollStatus::Retry(RetryHint::CenterFinger) => "enroll-finger-not-centered",
            EnrollStatus::Retry(RetryHint::RemoveFinger) => "enroll-remove-and-retry",
            EnrollStatus::Retry(RetryHint::Generic) => "enroll-retry-scan",
            EnrollStatus::Disconnected => "enroll-disconnected",
            EnrollStatus::DataFull => "enroll-data-full",
            EnrollStatus::UnknownError => "enroll-unknown-error",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "enroll-stage-passed" => Some(EnrollStatus::StagePassed),
            "enroll-completed" => Some(EnrollStatus::Completed),
            "enroll-failed" => Some(EnrollStatus::Failed),
            "enroll-swipe-too-short" => Some(EnrollStatus::Retry(RetryHint::TooShort)),
            "enroll-finger-not-centered" => Some(EnrollStatus::Retry(RetryHint::CenterFinger)),
            "enroll-remove-and-retry" => Some(EnrollStatus::Retry(RetryHint::RemoveFinger)),
            "enroll-retry-scan" => Some(EnrollStatus::Retry(RetryHint::Generic)),
            "enroll-disconnected" => Some(EnrollStatus::Disconnected),
            "enroll-data-full" => Some(EnrollStatus::DataFull),
            "enroll-unknown-error" => Some(EnrollStatus::UnknownError),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, EnrollStatus::StagePassed | EnrollStatus::Retry(_))
    }
}

impl std::fmt::Display for EnrollStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
