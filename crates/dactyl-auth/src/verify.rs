//! The fingerprint side of an authentication attempt
//!
//! Discovers a device, claims it, and runs up to `max_tries` verify
//! cycles, reporting progress to the host through [`Feedback`]. The
//! outcome distinguishes a confirmed non-match (an authentication
//! failure) from mere unavailability (fall through to another method):
//! a user must never be locked out because a reader was unplugged.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use dactyl_core::{DEFAULT_MAX_TRIES, DEFAULT_VERIFY_TIMEOUT_SECS};
use dactyl_daemon::ipc::SignalBody;
use dactyl_daemon::CancelFlag;

use crate::client::DactylClient;
use crate::messages;

/// Tunables for the fingerprint path.
#[derive(Debug, Clone)]
pub struct VerifyPolicy {
    /// Verification attempts before giving up with a non-match
    pub max_tries: u32,
    /// Per-attempt deadline for a terminal scan result
    pub timeout: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            timeout: Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS),
        }
    }
}

/// Terminal outcome of the fingerprint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerOutcome {
    /// A scan matched: authentication succeeds
    Matched,
    /// Scans completed but did not match: authentication fails
    NoMatch,
    /// No usable device, claim failure, timeout or hardware fault:
    /// fall through to another method
    Unavailable,
    /// The target user has no enrolled fingerprints
    UserUnknown,
    /// The caller cancelled the fingerprint path
    Cancelled,
}

/// Host callbacks for user-visible progress messages.
pub trait Feedback: Send + Sync {
    fn info(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Feedback sink that drops everything.
pub struct SilentFeedback;

impl Feedback for SilentFeedback {}

/// Run the fingerprint path for one authentication attempt.
///
/// Whatever happens, a device claimed here is released before this
/// returns.
pub async fn run_fingerprint(
    client: &DactylClient,
    username: &str,
    policy: &VerifyPolicy,
    feedback: &dyn Feedback,
    cancel: CancelFlag,
) -> FingerOutcome {
    let Some((device, multiple)) = pick_device(client, username).await else {
        return FingerOutcome::Unavailable;
    };

    if client.claim(&device, username).await.is_err() {
        debug!("failed to claim {}", device);
        return FingerOutcome::Unavailable;
    }

    // Scan type and (with several readers) the product name shape the
    // prompts
    let (is_swipe, device_name) = match client.get_device_info(&device).await {
        Ok(props) => (props.scan_type == "swipe", multiple.then_some(props.name)),
        Err(_) => (false, None),
    };

    let mut signals = client.signals();
    let outcome = verify_tries(
        client,
        &device,
        policy,
        feedback,
        &cancel,
        &mut signals,
        is_swipe,
        device_name.as_deref(),
    )
    .await;

    let _ = client.release(&device).await;
    outcome
}

/// Choose the device with the most enrollments for the user.
///
/// Returns the device path and whether the machine has several readers;
/// `None` when no device has anything enrolled for this user.
async fn pick_device(client: &DactylClient, username: &str) -> Option<(String, bool)> {
    let devices = client.get_devices().await.ok()?;
    let multiple = devices.len() > 1;

    let mut best: Option<(String, usize)> = None;
    for device in devices {
        let count = client
            .list_enrolled_fingers(&device, username)
            .await
            .map(|fingers| fingers.len())
            .unwrap_or(0);
        debug!("{} has {} prints for {}", device, count, username);
        match &best {
            Some((_, best_count)) if *best_count >= count => {}
            _ => best = Some((device, count)),
        }
    }

    match best {
        Some((device, count)) if count > 0 => Some((device, multiple)),
        _ => None,
    }
}

enum Wait {
    Terminal(String),
    TimedOut,
    Disconnected,
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn verify_tries(
    client: &DactylClient,
    device: &str,
    policy: &VerifyPolicy,
    feedback: &dyn Feedback,
    cancel: &CancelFlag,
    signals: &mut broadcast::Receiver<(String, SignalBody)>,
    is_swipe: bool,
    device_name: Option<&str>,
) -> FingerOutcome {
    for attempt in 0..policy.max_tries {
        if cancel.is_cancelled() {
            return FingerOutcome::Cancelled;
        }

        let deadline = Instant::now() + policy.timeout;

        if let Err(e) = client.verify_start(device, "any").await {
            debug!("VerifyStart failed: {}", e);
            if e.is_no_enrolled_prints() {
                return FingerOutcome::UserUnknown;
            }
            return FingerOutcome::Unavailable;
        }

        let wait = wait_for_terminal(
            signals,
            device,
            deadline,
            feedback,
            cancel,
            is_swipe,
            device_name,
        )
        .await;

        // Ignore errors from VerifyStop
        let _ = client.verify_stop(device).await;

        match wait {
            Wait::Cancelled => return FingerOutcome::Cancelled,
            Wait::Disconnected => return FingerOutcome::Unavailable,
            Wait::TimedOut => {
                feedback.info("Verification timed out");
                return FingerOutcome::Unavailable;
            }
            Wait::Terminal(result) => {
                debug!("attempt {} finished with {}", attempt, result);
                match result.as_str() {
                    "verify-match" => return FingerOutcome::Matched,
                    "verify-no-match" => {
                        feedback.error("Failed to match fingerprint");
                        // next attempt
                    }
                    "verify-disconnected" => return FingerOutcome::Unavailable,
                    "verify-unknown-error" => return FingerOutcome::Unavailable,
                    _ => {
                        feedback.info("An unknown error occurred");
                        return FingerOutcome::NoMatch;
                    }
                }
            }
        }
    }

    FingerOutcome::NoMatch
}

/// Wait for this attempt's terminal status.
///
/// Events from an earlier attempt can still sit in the stream, so
/// nothing counts until this attempt's finger-selected announcement has
/// been seen; the service emits it before any status event of the
/// operation it belongs to.
async fn wait_for_terminal(
    signals: &mut broadcast::Receiver<(String, SignalBody)>,
    device: &str,
    deadline: Instant,
    feedback: &dyn Feedback,
    cancel: &CancelFlag,
    is_swipe: bool,
    device_name: Option<&str>,
) -> Wait {
    let mut selected = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Wait::Cancelled,
            _ = tokio::time::sleep_until(deadline) => return Wait::TimedOut,
            message = signals.recv() => {
                let (signal_device, signal) = match message {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Wait::Disconnected,
                };
                if signal_device != device {
                    continue;
                }
                match signal {
                    SignalBody::VerifyFingerSelected { finger } => {
                        selected = true;
                        feedback.info(&messages::finger_prompt(&finger, device_name, is_swipe));
                    }
                    SignalBody::VerifyStatus { result, done } if selected => {
                        if done {
                            return Wait::Terminal(result);
                        }
                        feedback.error(messages::status_message(&result, is_swipe));
                    }
                    _ => {}
                }
            }
        }
    }
}
