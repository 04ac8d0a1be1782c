//! Hardware abstraction for fingerprint scanners
//!
//! The daemon drives scanners exclusively through the [`Scanner`] trait:
//! asynchronous open/close and enroll/verify/identify calls, plus the
//! device-resident print management used by garbage collection. At most
//! one call is outstanding per device; the controller enforces that.
//!
//! Cancellation is cooperative: the scanner observes the [`CancelFlag`]
//! and eventually completes with a cancelled verdict. Requesting
//! cancellation never tears down the hardware call directly.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify};

use dactyl_core::{DeviceId, RetryHint, ScanType, Template, TemplateData};

use crate::error::Result;

/// Cooperative cancellation token handed to every scan operation.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Observers wake up; the in-flight hardware
    /// call still completes through its normal callback.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal verdict of one verify or identify submission.
///
/// Retry verdicts are transient; the controller resubmits the operation
/// without client involvement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Match,
    NoMatch,
    Retry(RetryHint),
    Cancelled,
    Disconnected,
    Error(String),
}

/// Terminal verdict of one enroll submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollVerdict {
    /// Enrollment finished; the returned template carries the payload
    Enrolled(Template),
    /// The device completed all stages but produced no template
    Failed,
    Retry(RetryHint),
    Cancelled,
    Disconnected,
    /// On-device template storage is exhausted
    StorageFull,
    Error(String),
}

/// Hotplug notification consumed by the device registry.
#[derive(Clone)]
pub enum HotplugEvent {
    Added(Arc<dyn Scanner>),
    Removed(DeviceId),
}

/// One physical fingerprint scanner.
///
/// All scan calls are single-outstanding and cancellation-aware. Enroll
/// reports per-stage progress through the provided channel before its
/// terminal verdict.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn device_id(&self) -> &DeviceId;

    /// Product name for display purposes
    fn name(&self) -> &str;

    fn scan_type(&self) -> ScanType;

    /// Number of enroll stages, or -1 if unknown
    fn enroll_stages(&self) -> i32;

    /// Whether the device can match one scan against a gallery
    fn supports_identify(&self) -> bool;

    /// Whether the device keeps templates in its own storage
    fn has_storage(&self) -> bool;

    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn verify(&self, template: &Template, cancel: CancelFlag) -> ScanVerdict;

    async fn identify(&self, gallery: &[Template], cancel: CancelFlag) -> ScanVerdict;

    async fn enroll(
        &self,
        template: Template,
        cancel: CancelFlag,
        progress: mpsc::UnboundedSender<u32>,
    ) -> EnrollVerdict;

    /// Enumerate templates resident in on-device storage
    async fn list_prints(&self) -> Result<Vec<Template>>;

    /// Delete one template from on-device storage
    async fn delete_print(&self, print: &Template) -> Result<()>;
}

/// A fully scriptable scanner used by tests and development mode.
///
/// Verdicts are consumed one per hardware submission; a submission with
/// an empty script parks until a verdict is pushed or the operation is
/// cancelled.
pub struct MockScanner {
    device_id: DeviceId,
    name: String,
    scan_type: ScanType,
    stages: i32,
    supports_identify: bool,
    has_storage: bool,
    state: Mutex<MockState>,
    wake: Notify,
}

#[derive(Default)]
struct MockState {
    verify_script: VecDeque<ScanVerdict>,
    enroll_script: VecDeque<EnrollVerdict>,
    open_failures: VecDeque<String>,
    device_prints: Vec<Template>,
    open_count: u32,
    close_count: u32,
    opened: bool,
    enroll_serial: u32,
}

impl MockScanner {
    pub fn new(device_id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            device_id,
            name: name.into(),
            scan_type: ScanType::Press,
            stages: 5,
            supports_identify: false,
            has_storage: false,
            state: Mutex::new(MockState::default()),
            wake: Notify::new(),
        }
    }

    pub fn with_scan_type(mut self, scan_type: ScanType) -> Self {
        self.scan_type = scan_type;
        self
    }

    pub fn with_identify(mut self, supported: bool) -> Self {
        self.supports_identify = supported;
        self
    }

    pub fn with_storage(mut self, has_storage: bool) -> Self {
        self.has_storage = has_storage;
        self
    }

    pub fn with_stages(mut self, stages: i32) -> Self {
        self.stages = stages;
        self
    }

    pub async fn push_verify_verdict(&self, verdict: ScanVerdict) {
        self.state.lock().await.verify_script.push_back(verdict);
        self.wake.notify_waiters();
    }

    pub async fn push_enroll_verdict(&self, verdict: EnrollVerdict) {
        self.state.lock().await.enroll_script.push_back(verdict);
        self.wake.notify_waiters();
    }

    /// Queue a failure for the next open call
    pub async fn push_open_failure(&self, message: impl Into<String>) {
        self.state.lock().await.open_failures.push_back(message.into());
    }

    /// Seed a template into on-device storage
    pub async fn push_device_print(&self, print: Template) {
        self.state.lock().await.device_prints.push(print);
    }

    pub async fn device_print_count(&self) -> usize {
        self.state.lock().await.device_prints.len()
    }

    pub async fn open_count(&self) -> u32 {
        self.state.lock().await.open_count
    }

    pub async fn close_count(&self) -> u32 {
        self.state.lock().await.close_count
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.opened
    }

    async fn next_scan_verdict(&self, cancel: &CancelFlag) -> ScanVerdict {
        loop {
            if cancel.is_cancelled() {
                return ScanVerdict::Cancelled;
            }
            {
                let mut state = self.state.lock().await;
                if let Some(verdict) = state.verify_script.pop_front() {
                    return verdict;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return ScanVerdict::Cancelled,
                _ = self.wake.notified() => {}
            }
        }
    }
}

#[async_trait]
impl Scanner for MockScanner {
    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn scan_type(&self) -> ScanType {
        self.scan_type
    }

    fn enroll_stages(&self) -> i32 {
        self.stages
    }

    fn supports_identify(&self) -> bool {
        self.supports_identify
    }

    fn has_storage(&self) -> bool {
        self.has_storage
    }

    async fn open(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.open_count += 1;
        if let Some(message) = state.open_failures.pop_front() {
            return Err(crate::error::DaemonError::Hardware(message));
        }
        state.opened = true;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.close_count += 1;
        state.opened = false;
        Ok(())
    }

    async fn verify(&self, _template: &Template, cancel: CancelFlag) -> ScanVerdict {
        self.next_scan_verdict(&cancel).await
    }

    async fn identify(&self, _gallery: &[Template], cancel: CancelFlag) -> ScanVerdict {
        self.next_scan_verdict(&cancel).await
    }

    async fn enroll(
        &self,
        template: Template,
        cancel: CancelFlag,
        progress: mpsc::UnboundedSender<u32>,
    ) -> EnrollVerdict {
        loop {
            if cancel.is_cancelled() {
                return EnrollVerdict::Cancelled;
            }
            {
                let mut state = self.state.lock().await;
                if let Some(verdict) = state.enroll_script.pop_front() {
                    if let EnrollVerdict::Enrolled(_) = &verdict {
                        // Report every stage before completing
                        for stage in 1..=self.stages.max(0) as u32 {
                            let _ = progress.send(stage);
                        }
                        state.enroll_serial += 1;
                        let mut done = template;
                        done.payload = TemplateData::new(
                            format!("mock-print-{}", state.enroll_serial).into_bytes(),
                        );
                        if self.has_storage {
                            state.device_prints.push(done.clone());
                        }
                        return EnrollVerdict::Enrolled(done);
                    }
                    return verdict;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return EnrollVerdict::Cancelled,
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn list_prints(&self) -> Result<Vec<Template>> {
        Ok(self.state.lock().await.device_prints.clone())
    }

    async fn delete_print(&self, print: &Template) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.device_prints.iter().position(|p| p == print) {
            state.device_prints.remove(pos);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use dactyl_core::Finger;

    fn template() -> Template {
        Template {
            device_id: DeviceId::new("mockdrv", "0001"),
            finger: Finger::RightIndex,
            username: "alice".into(),
            enroll_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            payload: TemplateData::new(vec![1, 2, 3]),
        }
    }

    #[tokio::test]
    async fn cancel_flag_wakes_waiters() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };

        flag.cancel();
        waiter.await.unwrap();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn scripted_verify_verdicts_in_order() {
        let scanner = MockScanner::new(DeviceId::new("mockdrv", "0001"), "Mock");
        scanner
            .push_verify_verdict(ScanVerdict::Retry(RetryHint::TooShort))
            .await;
        scanner.push_verify_verdict(ScanVerdict::Match).await;

        let t = template();
        assert_eq!(
            scanner.verify(&t, CancelFlag::new()).await,
            ScanVerdict::Retry(RetryHint::TooShort)
        );
        assert_eq!(scanner.verify(&t, CancelFlag::new()).await, ScanVerdict::Match);
    }

    #[tokio::test]
    async fn unscripted_verify_parks_until_cancelled() {
        let scanner = Arc::new(MockScanner::new(DeviceId::new("mockdrv", "0001"), "Mock"));
        let cancel = CancelFlag::new();

        let handle = {
            let scanner = Arc::clone(&scanner);
            let cancel = cancel.clone();
            tokio::spawn(async move { scanner.verify(&template(), cancel).await })
        };

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), ScanVerdict::Cancelled);
    }

    #[tokio::test]
    async fn enroll_reports_stages_then_stores() {
        let scanner = MockScanner::new(DeviceId::new("mockdrv", "0001"), "Mock")
            .with_storage(true)
            .with_stages(3);
        scanner
            .push_enroll_verdict(EnrollVerdict::Enrolled(template()))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let verdict = scanner.enroll(template(), CancelFlag::new(), tx).await;

        let EnrollVerdict::Enrolled(done) = verdict else {
            panic!("expected enrollment to complete");
        };
        assert!(!done.payload.as_bytes().is_empty());
        assert_eq!(scanner.device_print_count().await, 1);

        let mut stages = Vec::new();
        while let Ok(stage) = rx.try_recv() {
            stages.push(stage);
        }
        assert_eq!(stages, vec![1, 2, 3]);
    }
}
