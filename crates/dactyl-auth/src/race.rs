//! The password / fingerprint race
//!
//! Two concurrent paths feed one authentication decision: the
//! fingerprint flow runs on the async side while the password prompt -
//! a blocking call by nature - runs on a worker thread. A decisive
//! result from either side (a fingerprint match or non-match, or a
//! non-empty password) settles the race and cancels the loser. The
//! caller gets exactly one decision and the hardware is never left
//! claimed.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use dactyl_daemon::CancelFlag;

use crate::client::DactylClient;
use crate::verify::{run_fingerprint, Feedback, FingerOutcome, VerifyPolicy};

/// Tunables for the race.
#[derive(Debug, Clone, Default)]
pub struct RacePolicy {
    pub verify: VerifyPolicy,
    /// Hint to the host's prompt implementation that it should give up
    /// the blocking read once the fingerprint side has finished. A
    /// prompt that cannot be interrupted may ignore this; the race
    /// still settles, the worker thread just lingers until its read
    /// returns.
    pub abort_prompt_on_result: bool,
}

/// Flags shared with the prompt worker, mutex-guarded, plus a wake
/// signal for async observers.
#[derive(Clone, Default)]
pub struct RaceStatus {
    flags: Arc<Mutex<RaceFlags>>,
    wake: Arc<Notify>,
}

#[derive(Default)]
struct RaceFlags {
    finished: bool,
    matched: bool,
}

impl RaceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Has the fingerprint path finished, one way or the other?
    pub fn fingerprint_finished(&self) -> bool {
        self.flags.lock().expect("race flags poisoned").finished
    }

    /// Did the fingerprint path finish with a match?
    pub fn fingerprint_matched(&self) -> bool {
        self.flags.lock().expect("race flags poisoned").matched
    }

    /// Wait until the fingerprint path has finished.
    pub async fn wait_fingerprint_finished(&self) {
        loop {
            let waiter = self.wake.notified();
            if self.fingerprint_finished() {
                return;
            }
            waiter.await;
        }
    }

    fn record(&self, outcome: FingerOutcome) {
        {
            let mut flags = self.flags.lock().expect("race flags poisoned");
            flags.finished = true;
            flags.matched = outcome == FingerOutcome::Matched;
        }
        self.wake.notify_waiters();
    }
}

/// A blocking credential prompt, driven on a worker thread.
///
/// Implementations get the shared [`RaceStatus`] so an interruptible
/// prompt can bail out once the fingerprint side has settled the race.
/// Returning `None` or an empty string means no credential was entered.
pub trait PasswordPrompt: Send + 'static {
    fn prompt(&mut self, status: &RaceStatus) -> Option<String>;
}

impl<F> PasswordPrompt for F
where
    F: FnMut(&RaceStatus) -> Option<String> + Send + 'static,
{
    fn prompt(&mut self, status: &RaceStatus) -> Option<String> {
        self(status)
    }
}

/// The single authentication decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// A fingerprint scan matched
    FingerprintMatched,
    /// Scans ran to completion and did not match: deny
    FingerprintRejected,
    /// The user typed a password; the host validates it
    Password(String),
    /// Neither path produced a decisive result
    Unavailable,
}

/// Race a fingerprint verification against a password prompt.
pub async fn authenticate<P: PasswordPrompt>(
    client: &DactylClient,
    username: &str,
    mut prompt: P,
    policy: &RacePolicy,
    feedback: &dyn Feedback,
) -> AuthDecision {
    let status = RaceStatus::new();
    let cancel = CancelFlag::new();

    let finger_fut = async {
        let outcome = run_fingerprint(client, username, &policy.verify, feedback, cancel.clone()).await;
        status.record(outcome);
        outcome
    };
    tokio::pin!(finger_fut);

    let prompt_status = status.clone();
    let mut password_task =
        tokio::task::spawn_blocking(move || prompt.prompt(&prompt_status));

    let mut finger_outcome: Option<FingerOutcome> = None;
    let mut password_spent = false;

    while finger_outcome.is_none() || !password_spent {
        tokio::select! {
            outcome = &mut finger_fut, if finger_outcome.is_none() => {
                debug!("fingerprint path finished: {:?}", outcome);
                match outcome {
                    FingerOutcome::Matched => {
                        // The prompt worker notices through RaceStatus
                        // (or lingers harmlessly if it cannot).
                        return AuthDecision::FingerprintMatched;
                    }
                    FingerOutcome::NoMatch => {
                        return AuthDecision::FingerprintRejected;
                    }
                    other => {
                        // Not decisive: keep waiting for the password
                        finger_outcome = Some(other);
                    }
                }
            }
            result = &mut password_task, if !password_spent => {
                password_spent = true;
                let password = result.ok().flatten().filter(|p| !p.is_empty());
                match password {
                    Some(password) => {
                        debug!("password path finished first");
                        // Cancel the scan and wait for its cleanup so
                        // the device is released before we return.
                        cancel.cancel();
                        if finger_outcome.is_none() {
                            let _ = (&mut finger_fut).await;
                        }
                        return AuthDecision::Password(password);
                    }
                    None => {
                        // An empty credential is not decisive; let the
                        // fingerprint path run its course.
                        debug!("empty password, waiting on fingerprint");
                    }
                }
            }
        }
    }

    AuthDecision::Unavailable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn race_status_flags() {
        let status = RaceStatus::new();
        assert!(!status.fingerprint_finished());
        assert!(!status.fingerprint_matched());

        status.record(FingerOutcome::Matched);
        assert!(status.fingerprint_finished());
        assert!(status.fingerprint_matched());

        let status = RaceStatus::new();
        status.record(FingerOutcome::Unavailable);
        assert!(status.fingerprint_finished());
        assert!(!status.fingerprint_matched());
    }

    #[tokio::test]
    async fn wait_fingerprint_finished_wakes() {
        let status = RaceStatus::new();
        let waiter = {
            let status = status.clone();
            tokio::spawn(async move { status.wait_fingerprint_finished().await })
        };
        status.record(FingerOutcome::NoMatch);
        waiter.await.unwrap();
    }
}
