//! Device controller: the per-scanner session state machine
//!
//! One controller task owns one physical scanner. Every state
//! transition happens on that task; IPC handlers and hardware driver
//! tasks talk to it exclusively through its command channel, so the
//! session slot, the current operation and the pending reply slots have
//! a single owner and no locking.
//!
//! Hardware calls never run on the controller task. Scan and enroll
//! operations are spawned as driver tasks that loop on retry-class
//! verdicts themselves (emitting a non-final status event per attempt)
//! and report exactly one terminal verdict back through the command
//! channel.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use dactyl_core::{
    DeviceId, EnrollStatus, Error, FingerRequest, Result, ScanType, Template, VerifyStatus,
};

use crate::access::{self, access_for, Authority, ClaimState, ConnId, Method, PeerInfo};
use crate::hardware::{CancelFlag, EnrollVerdict, ScanVerdict, Scanner};
use crate::store::TemplateStore;

/// Status signals broadcast to IPC subscribers of one device.
#[derive(Debug, Clone)]
pub enum DeviceSignal {
    VerifyStatus { result: String, done: bool },
    VerifyFingerSelected { finger: String },
    EnrollStatus { result: String, done: bool },
}

/// Property snapshot for the device info query.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub scan_type: ScanType,
    pub num_enroll_stages: i32,
    pub in_use: bool,
}

/// Emitted to the registry when the in-use observable flips.
#[derive(Debug, Clone, Copy)]
pub struct InUseChanged {
    pub id: u32,
    pub in_use: bool,
}

/// Commands processed by the controller task.
pub enum DeviceCommand {
    Claim {
        peer: PeerInfo,
        username: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Release {
        peer: PeerInfo,
        reply: oneshot::Sender<Result<()>>,
    },
    VerifyStart {
        peer: PeerInfo,
        finger: String,
        reply: oneshot::Sender<Result<()>>,
    },
    VerifyStop {
        peer: PeerInfo,
        reply: oneshot::Sender<Result<()>>,
    },
    EnrollStart {
        peer: PeerInfo,
        finger: String,
        reply: oneshot::Sender<Result<()>>,
    },
    EnrollStop {
        peer: PeerInfo,
        reply: oneshot::Sender<Result<()>>,
    },
    ListEnrolledFingers {
        peer: PeerInfo,
        username: String,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    DeleteEnrolledFingers {
        peer: PeerInfo,
        username: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteEnrolledFingers2 {
        peer: PeerInfo,
        reply: oneshot::Sender<Result<()>>,
    },
    GetInfo {
        reply: oneshot::Sender<DeviceInfo>,
    },
    /// The liveness watch on a connected client fired
    ClientVanished { conn: ConnId },
    /// Unpublish: stop the controller task
    Shutdown,

    // Driver task completions
    OpenDone(crate::error::Result<()>),
    CloseDone(crate::error::Result<()>),
    ScanDone(ScanVerdict),
    EnrollDone(EnrollVerdict),
}

/// Exclusive lease on a controller, held by one connection/user pair.
struct Session {
    conn: ConnId,
    username: String,
    /// Claim reply held pending until the hardware open completes
    pending_open: Option<oneshot::Sender<Result<()>>>,
}

/// The single in-flight hardware operation, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    None,
    Open,
    Close,
    Enroll,
    Verify,
    Identify,
}

impl Operation {
    fn is_scan(self) -> bool {
        matches!(self, Operation::Enroll | Operation::Verify | Operation::Identify)
    }
}

/// Cloneable façade over a controller's command channel.
#[derive(Clone, Debug)]
pub struct DeviceHandle {
    pub id: u32,
    pub path: String,
    pub device_id: DeviceId,
    cmd_tx: mpsc::Sender<DeviceCommand>,
    events: broadcast::Sender<DeviceSignal>,
}

impl DeviceHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceSignal> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> DeviceCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::NoSuchDevice)?;
        rx.await.map_err(|_| Error::NoSuchDevice)?
    }

    pub async fn claim(&self, peer: PeerInfo, username: String) -> Result<()> {
        self.request(|reply| DeviceCommand::Claim { peer, username, reply })
            .await
    }

    pub async fn release(&self, peer: PeerInfo) -> Result<()> {
        self.request(|reply| DeviceCommand::Release { peer, reply }).await
    }

    pub async fn verify_start(&self, peer: PeerInfo, finger: String) -> Result<()> {
        self.request(|reply| DeviceCommand::VerifyStart { peer, finger, reply })
            .await
    }

    pub async fn verify_stop(&self, peer: PeerInfo) -> Result<()> {
        self.request(|reply| DeviceCommand::VerifyStop { peer, reply }).await
    }

    pub async fn enroll_start(&self, peer: PeerInfo, finger: String) -> Result<()> {
        self.request(|reply| DeviceCommand::EnrollStart { peer, finger, reply })
            .await
    }

    pub async fn enroll_stop(&self, peer: PeerInfo) -> Result<()> {
        self.request(|reply| DeviceCommand::EnrollStop { peer, reply }).await
    }

    pub async fn list_enrolled_fingers(
        &self,
        peer: PeerInfo,
        username: String,
    ) -> Result<Vec<String>> {
        self.request(|reply| DeviceCommand::ListEnrolledFingers { peer, username, reply })
            .await
    }

    pub async fn delete_enrolled_fingers(&self, peer: PeerInfo, username: String) -> Result<()> {
        self.request(|reply| DeviceCommand::DeleteEnrolledFingers { peer, username, reply })
            .await
    }

    pub async fn delete_enrolled_fingers2(&self, peer: PeerInfo) -> Result<()> {
        self.request(|reply| DeviceCommand::DeleteEnrolledFingers2 { peer, reply })
            .await
    }

    pub async fn info(&self) -> Result<DeviceInfo> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(DeviceCommand::GetInfo { reply: tx })
            .await
            .map_err(|_| Error::NoSuchDevice)?;
        rx.await.map_err(|_| Error::NoSuchDevice)
    }

    pub async fn client_vanished(&self, conn: ConnId) {
        let _ = self.cmd_tx.send(DeviceCommand::ClientVanished { conn }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(DeviceCommand::Shutdown).await;
    }
}

/// Spawn a controller task for one scanner and hand back its façade.
pub fn spawn_controller(
    id: u32,
    scanner: Arc<dyn Scanner>,
    store: Arc<TemplateStore>,
    authority: Arc<dyn Authority>,
    notice_tx: mpsc::UnboundedSender<InUseChanged>,
) -> DeviceHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (events, _) = broadcast::channel(32);
    let (in_use_tx, _) = watch::channel(false);

    let handle = DeviceHandle {
        id,
        path: format!("/dactyl/device/{id}"),
        device_id: scanner.device_id().clone(),
        cmd_tx: cmd_tx.clone(),
        events: events.clone(),
    };

    let controller = Controller {
        id,
        scanner,
        store,
        authority,
        events,
        in_use_tx,
        notice_tx,
        cmd_tx,
        session: None,
        op: Operation::None,
        cancel: None,
        pending_stop: None,
        pending_close: None,
        release_after_drain: None,
        vanish_cleanup: false,
        clients: HashSet::new(),
    };

    tokio::spawn(controller.run(cmd_rx));

    handle
}

struct Controller {
    id: u32,
    scanner: Arc<dyn Scanner>,
    store: Arc<TemplateStore>,
    authority: Arc<dyn Authority>,
    events: broadcast::Sender<DeviceSignal>,
    in_use_tx: watch::Sender<bool>,
    notice_tx: mpsc::UnboundedSender<InUseChanged>,
    cmd_tx: mpsc::Sender<DeviceCommand>,

    session: Option<Session>,
    op: Operation,
    cancel: Option<CancelFlag>,
    /// A Stop call waiting for the operation's terminal callback
    pending_stop: Option<oneshot::Sender<Result<()>>>,
    /// A Release (or vanish cleanup) waiting for the close to finish
    pending_close: Option<oneshot::Sender<Result<()>>>,
    /// Release arrived mid-operation; close once the operation drains
    release_after_drain: Option<oneshot::Sender<Result<()>>>,
    /// The claimant vanished; force-close once the operation drains
    vanish_cleanup: bool,

    clients: HashSet<ConnId>,
}

impl Controller {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<DeviceCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            if !self.handle(cmd).await {
                break;
            }
        }
        debug!("controller {} stopped", self.id);
    }

    /// Returns false when the controller should stop.
    async fn handle(&mut self, cmd: DeviceCommand) -> bool {
        match cmd {
            DeviceCommand::Claim { peer, username, reply } => {
                self.claim(peer, username, reply).await
            }
            DeviceCommand::Release { peer, reply } => self.release(peer, reply).await,
            DeviceCommand::VerifyStart { peer, finger, reply } => {
                self.verify_start(peer, finger, reply).await
            }
            DeviceCommand::VerifyStop { peer, reply } => self.verify_stop(peer, reply).await,
            DeviceCommand::EnrollStart { peer, finger, reply } => {
                self.enroll_start(peer, finger, reply).await
            }
            DeviceCommand::EnrollStop { peer, reply } => self.enroll_stop(peer, reply).await,
            DeviceCommand::ListEnrolledFingers { peer, username, reply } => {
                let result = self.list_enrolled_fingers(peer, username).await;
                let _ = reply.send(result);
            }
            DeviceCommand::DeleteEnrolledFingers { peer, username, reply } => {
                let result = self.delete_enrolled_fingers(peer, username).await;
                let _ = reply.send(result);
            }
            DeviceCommand::DeleteEnrolledFingers2 { peer, reply } => {
                let result = self.delete_enrolled_fingers2(peer).await;
                let _ = reply.send(result);
            }
            DeviceCommand::GetInfo { reply } => {
                let _ = reply.send(DeviceInfo {
                    name: self.scanner.name().to_string(),
                    scan_type: self.scanner.scan_type(),
                    num_enroll_stages: self.scanner.enroll_stages(),
                    in_use: !self.clients.is_empty(),
                });
            }
            DeviceCommand::ClientVanished { conn } => self.client_vanished(conn),
            DeviceCommand::Shutdown => {
                if let Some(cancel) = &self.cancel {
                    cancel.cancel();
                }
                return false;
            }
            DeviceCommand::OpenDone(result) => self.open_done(result),
            DeviceCommand::CloseDone(result) => self.close_done(result),
            DeviceCommand::ScanDone(verdict) => self.scan_done(verdict),
            DeviceCommand::EnrollDone(verdict) => self.enroll_done(verdict),
        }
        true
    }

    // ---- claim / release -------------------------------------------------

    async fn claim(
        &mut self,
        peer: PeerInfo,
        username: String,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let access = access_for(Method::Claim);
        if let Err(e) = self.check_claim_state(access.claim, &peer) {
            let _ = reply.send(Err(e));
            return;
        }

        let user = match access::resolve_acting_username(&*self.authority, &peer, &username).await {
            Ok(user) => user,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if let Err(e) = access::check_actions(&*self.authority, &peer, access).await {
            let _ = reply.send(Err(e));
            return;
        }

        self.add_client(peer.conn);

        info!("user '{}' claiming device {}", user, self.id);
        self.session = Some(Session {
            conn: peer.conn,
            username: user,
            pending_open: Some(reply),
        });
        self.op = Operation::Open;

        let scanner = Arc::clone(&self.scanner);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = scanner.open().await;
            let _ = cmd_tx.send(DeviceCommand::OpenDone(result)).await;
        });
    }

    fn open_done(&mut self, result: crate::error::Result<()>) {
        self.op = Operation::None;
        let reply = self
            .session
            .as_mut()
            .and_then(|session| session.pending_open.take());

        match result {
            Ok(()) => {
                debug!("claimed device {}", self.id);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                if self.vanish_cleanup {
                    // The claimant disappeared while the open was in
                    // flight; close right back down.
                    self.start_close(None);
                }
            }
            Err(e) => {
                // The claim fails atomically: no half-claimed state
                self.session = None;
                self.vanish_cleanup = false;
                if let Some(reply) = reply {
                    let _ = reply.send(Err(Error::Internal(format!(
                        "Open failed with error: {e}"
                    ))));
                }
            }
        }
    }

    async fn release(&mut self, peer: PeerInfo, reply: oneshot::Sender<Result<()>>) {
        let access = access_for(Method::Release);
        if let Err(e) = self.check_claim_state(access.claim, &peer) {
            let _ = reply.send(Err(e));
            return;
        }
        if let Err(e) = access::check_actions(&*self.authority, &peer, access).await {
            let _ = reply.send(Err(e));
            return;
        }

        if self.op.is_scan() {
            // Cancel and drain before closing; the reply waits for the
            // operation's terminal callback.
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
            }
            if self.release_after_drain.is_some() {
                let _ = reply.send(Err(Error::AlreadyInUse(
                    "Release already in progress".into(),
                )));
                return;
            }
            self.release_after_drain = Some(reply);
            return;
        }

        if self.op == Operation::Close {
            let _ = reply.send(Err(Error::AlreadyInUse(
                "Release already in progress".into(),
            )));
            return;
        }

        self.start_close(Some(reply));
    }

    fn start_close(&mut self, reply: Option<oneshot::Sender<Result<()>>>) {
        self.op = Operation::Close;
        self.pending_close = reply;

        let scanner = Arc::clone(&self.scanner);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = scanner.close().await;
            let _ = cmd_tx.send(DeviceCommand::CloseDone(result)).await;
        });
    }

    fn close_done(&mut self, result: crate::error::Result<()>) {
        // The controller ends up consistently unclaimed whether or not
        // the hardware close worked.
        self.op = Operation::None;
        self.session = None;
        self.vanish_cleanup = false;

        let reply = self.pending_close.take();
        match result {
            Ok(()) => {
                debug!("released device {}", self.id);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(e) => {
                warn!("error closing device {}: {}", self.id, e);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(Error::Internal(format!(
                        "Release failed with error: {e}"
                    ))));
                }
            }
        }
    }

    // ---- verify / identify ----------------------------------------------

    async fn verify_start(
        &mut self,
        peer: PeerInfo,
        finger: String,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let result = self.verify_start_inner(&peer, &finger).await;
        let _ = reply.send(result);
    }

    async fn verify_start_inner(&mut self, peer: &PeerInfo, finger: &str) -> Result<()> {
        let access = access_for(Method::VerifyStart);
        self.check_claim_state(access.claim, peer)?;
        access::check_actions(&*self.authority, peer, access).await?;

        match self.op {
            Operation::None => {}
            Operation::Enroll => {
                return Err(Error::AlreadyInUse("Enrollment in progress".into()))
            }
            _ => {
                return Err(Error::AlreadyInUse(
                    "Verification already in progress".into(),
                ))
            }
        }

        let username = self
            .session
            .as_ref()
            .expect("claim checked above")
            .username
            .clone();
        let device_id = self.scanner.device_id().clone();

        let mut request = FingerRequest::parse(finger);
        let mut gallery = Vec::new();

        if request == FingerRequest::Any {
            let fingers = self
                .store
                .discover_fingers(&device_id, &username)
                .map_err(|e| Error::Internal(e.to_string()))?;
            if fingers.is_empty() {
                return Err(Error::NoEnrolledPrints);
            }

            if self.scanner.supports_identify() {
                for finger in fingers {
                    match self.store.load(&device_id, finger, &username) {
                        Ok(template) => {
                            debug!("adding {} to the gallery", finger);
                            gallery.push(template);
                        }
                        Err(e) => warn!("skipping unloadable template {}: {}", finger, e),
                    }
                }
                if gallery.is_empty() {
                    return Err(Error::NoEnrolledPrints);
                }
            } else {
                request = FingerRequest::Specific(fingers[0]);
            }
        }

        let input = match request {
            FingerRequest::Any => {
                debug!("start identification, device {}", self.id);
                ScanInput::Gallery(gallery)
            }
            FingerRequest::Specific(finger) => {
                debug!("start verification, device {} finger {}", self.id, finger);
                match self.store.load(&device_id, finger, &username) {
                    Ok(template) => ScanInput::Single(template),
                    Err(crate::error::DaemonError::TemplateNotFound) => {
                        return Err(Error::Internal(format!("No such print {finger}")))
                    }
                    Err(e) => return Err(Error::Internal(e.to_string())),
                }
            }
        };

        let cancel = CancelFlag::new();
        self.cancel = Some(cancel.clone());
        self.op = match input {
            ScanInput::Gallery(_) => Operation::Identify,
            ScanInput::Single(_) => Operation::Verify,
        };

        // Announce the chosen finger before the operation can produce
        // its first status event
        self.emit(DeviceSignal::VerifyFingerSelected {
            finger: request.as_str().to_string(),
        });

        let scanner = Arc::clone(&self.scanner);
        let cmd_tx = self.cmd_tx.clone();
        let events = self.events.clone();
        tokio::spawn(run_scan(scanner, input, cancel, events, cmd_tx));

        Ok(())
    }

    async fn verify_stop(&mut self, peer: PeerInfo, reply: oneshot::Sender<Result<()>>) {
        let access = access_for(Method::VerifyStop);
        if let Err(e) = self.check_claim_state(access.claim, &peer) {
            let _ = reply.send(Err(e));
            return;
        }
        if let Err(e) = access::check_actions(&*self.authority, &peer, access).await {
            let _ = reply.send(Err(e));
            return;
        }

        match self.op {
            Operation::Verify | Operation::Identify => {}
            Operation::Enroll => {
                let _ = reply.send(Err(Error::AlreadyInUse("Enrollment in progress".into())));
                return;
            }
            _ => {
                let _ = reply.send(Err(Error::NoActionInProgress));
                return;
            }
        }

        self.request_stop(reply);
    }

    fn request_stop(&mut self, reply: oneshot::Sender<Result<()>>) {
        match &self.cancel {
            Some(cancel) => {
                if self.pending_stop.is_some() {
                    let _ = reply.send(Err(Error::AlreadyInUse("Stop already pending".into())));
                    return;
                }
                // The reply is sent from the operation's terminal
                // callback, never before it.
                cancel.cancel();
                self.pending_stop = Some(reply);
            }
            None => {
                // Operation already wrapping up
                self.op = Operation::None;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn scan_done(&mut self, verdict: ScanVerdict) {
        let status = match verdict {
            ScanVerdict::Match => VerifyStatus::Match,
            ScanVerdict::NoMatch => VerifyStatus::NoMatch,
            ScanVerdict::Retry(hint) => {
                // Drivers resubmit retries themselves; a retry here is a
                // driver bug but must not wedge the controller.
                warn!("terminal retry verdict reached controller: {:?}", hint);
                VerifyStatus::UnknownError
            }
            ScanVerdict::Cancelled => VerifyStatus::UnknownError,
            ScanVerdict::Disconnected => {
                warn!("device {} disconnected during verify", self.id);
                VerifyStatus::Disconnected
            }
            ScanVerdict::Error(e) => {
                warn!("device {} reported an error during verify: {}", self.id, e);
                VerifyStatus::UnknownError
            }
        };

        debug!("scan_done: result {}", status);
        self.emit(DeviceSignal::VerifyStatus {
            result: status.as_str().to_string(),
            done: true,
        });
        self.finish_operation();
    }

    // ---- enroll ----------------------------------------------------------

    async fn enroll_start(
        &mut self,
        peer: PeerInfo,
        finger: String,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let result = self.enroll_start_inner(&peer, &finger).await;
        let _ = reply.send(result);
    }

    async fn enroll_start_inner(&mut self, peer: &PeerInfo, finger: &str) -> Result<()> {
        // The finger must be concrete; checked before anything else
        let finger = FingerRequest::parse_specific(finger)?;

        let access = access_for(Method::EnrollStart);
        self.check_claim_state(access.claim, peer)?;
        access::check_actions(&*self.authority, peer, access).await?;

        match self.op {
            Operation::None => {}
            Operation::Enroll => {
                return Err(Error::AlreadyInUse(
                    "Enrollment already in progress".into(),
                ))
            }
            _ => return Err(Error::AlreadyInUse("Verification in progress".into())),
        }

        let username = self
            .session
            .as_ref()
            .expect("claim checked above")
            .username
            .clone();

        debug!("start enrollment, device {} finger {}", self.id, finger);

        let cancel = CancelFlag::new();
        self.cancel = Some(cancel.clone());
        self.op = Operation::Enroll;

        let blank = Template::new_enrollment(
            self.scanner.device_id().clone(),
            finger,
            username,
            Local::now().date_naive(),
        );

        let scanner = Arc::clone(&self.scanner);
        let store = Arc::clone(&self.store);
        let cmd_tx = self.cmd_tx.clone();
        let events = self.events.clone();
        tokio::spawn(run_enroll(scanner, store, blank, cancel, events, cmd_tx));

        Ok(())
    }

    async fn enroll_stop(&mut self, peer: PeerInfo, reply: oneshot::Sender<Result<()>>) {
        let access = access_for(Method::EnrollStop);
        if let Err(e) = self.check_claim_state(access.claim, &peer) {
            let _ = reply.send(Err(e));
            return;
        }
        if let Err(e) = access::check_actions(&*self.authority, &peer, access).await {
            let _ = reply.send(Err(e));
            return;
        }

        match self.op {
            Operation::Enroll => {}
            Operation::Verify | Operation::Identify => {
                let _ = reply.send(Err(Error::AlreadyInUse(
                    "Verification in progress".into(),
                )));
                return;
            }
            _ => {
                let _ = reply.send(Err(Error::NoActionInProgress));
                return;
            }
        }

        self.request_stop(reply);
    }

    fn enroll_done(&mut self, verdict: EnrollVerdict) {
        let status = match verdict {
            EnrollVerdict::Enrolled(template) => {
                // Hardware success is not surfaced as success unless the
                // template also made it to disk.
                match self.store.save(&template) {
                    Ok(()) => EnrollStatus::Completed,
                    Err(e) => {
                        warn!("failed to persist enrolled template: {}", e);
                        EnrollStatus::Failed
                    }
                }
            }
            EnrollVerdict::Failed => EnrollStatus::Failed,
            EnrollVerdict::Retry(hint) => {
                warn!("terminal retry verdict reached controller: {:?}", hint);
                EnrollStatus::UnknownError
            }
            EnrollVerdict::Cancelled => EnrollStatus::UnknownError,
            EnrollVerdict::Disconnected => {
                warn!("device {} disconnected during enroll", self.id);
                EnrollStatus::Disconnected
            }
            EnrollVerdict::StorageFull => EnrollStatus::DataFull,
            EnrollVerdict::Error(e) => {
                warn!("device {} reported an error during enroll: {}", self.id, e);
                EnrollStatus::UnknownError
            }
        };

        debug!("enroll_done: result {}", status);
        self.emit(DeviceSignal::EnrollStatus {
            result: status.as_str().to_string(),
            done: true,
        });
        self.finish_operation();
    }

    /// Common tail of every terminal scan/enroll callback: reset the
    /// operation, answer a pending Stop, resume a parked Release or
    /// vanish cleanup.
    fn finish_operation(&mut self) {
        self.op = Operation::None;
        self.cancel = None;

        if let Some(reply) = self.pending_stop.take() {
            let _ = reply.send(Ok(()));
        }

        if let Some(reply) = self.release_after_drain.take() {
            self.start_close(Some(reply));
        } else if self.vanish_cleanup {
            self.start_close(None);
        }
    }

    // ---- enumeration / deletion -----------------------------------------

    async fn list_enrolled_fingers(
        &mut self,
        peer: PeerInfo,
        username: String,
    ) -> Result<Vec<String>> {
        let access = access_for(Method::ListEnrolledFingers);
        let user = access::resolve_acting_username(&*self.authority, &peer, &username).await?;
        access::check_actions(&*self.authority, &peer, access).await?;

        self.add_client(peer.conn);

        let fingers = self
            .store
            .discover_fingers(self.scanner.device_id(), &user)
            .map_err(|e| Error::Internal(e.to_string()))?;
        if fingers.is_empty() {
            return Err(Error::NoEnrolledPrints);
        }

        Ok(fingers.iter().map(|f| f.as_str().to_string()).collect())
    }

    async fn delete_enrolled_fingers(&mut self, peer: PeerInfo, username: String) -> Result<()> {
        warn!("the API user should be updated to use the DeleteEnrolledFingers2 method");
        log_offending_client(&peer);

        let access = access_for(Method::DeleteEnrolledFingers);
        let user = access::resolve_acting_username(&*self.authority, &peer, &username).await?;
        access::check_actions(&*self.authority, &peer, access).await?;

        // Claimed by us is fine, unclaimed is fine; claimed by someone
        // else (or mid-claim) is not.
        self.check_claim_state(access.claim, &peer)?;
        let opened = self.check_claimed(&peer).is_ok();

        if self.op != Operation::None {
            return Err(Error::AlreadyInUse("Operation in progress".into()));
        }

        self.add_client(peer.conn);

        if !opened && self.scanner.has_storage() {
            if let Err(e) = self.scanner.open().await {
                warn!("failed to open device for deletion: {}", e);
            }
        }

        self.delete_for_user(&user).await?;

        if !opened && self.scanner.has_storage() {
            if let Err(e) = self.scanner.close().await {
                warn!("failed to close device after deletion: {}", e);
            }
        }

        Ok(())
    }

    async fn delete_enrolled_fingers2(&mut self, peer: PeerInfo) -> Result<()> {
        let access = access_for(Method::DeleteEnrolledFingers2);
        self.check_claim_state(access.claim, &peer)?;
        access::check_actions(&*self.authority, &peer, access).await?;

        if self.op != Operation::None {
            return Err(Error::AlreadyInUse("Operation in progress".into()));
        }

        let username = self
            .session
            .as_ref()
            .expect("claim checked above")
            .username
            .clone();
        self.delete_for_user(&username).await
    }

    async fn delete_for_user(&mut self, username: &str) -> Result<()> {
        let device_id = self.scanner.device_id().clone();

        // Device-resident copies go first; failures here are logged but
        // not fatal.
        if self.scanner.has_storage() {
            let fingers = self
                .store
                .discover_fingers(&device_id, username)
                .map_err(|e| Error::Internal(e.to_string()))?;
            for finger in fingers {
                let Ok(template) = self.store.load(&device_id, finger, username) else {
                    continue;
                };
                if let Err(e) = self.scanner.delete_print(&template).await {
                    warn!("error deleting print from device: {}", e);
                }
            }
        }

        for finger in dactyl_core::finger::ALL_FINGERS {
            self.store
                .delete(&device_id, finger, username)
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        Ok(())
    }

    // ---- bookkeeping -----------------------------------------------------

    /// Enforce the claim-state requirement from the method policy
    /// table.
    fn check_claim_state(&self, state: ClaimState, peer: &PeerInfo) -> Result<()> {
        match state {
            ClaimState::Ignored => Ok(()),
            ClaimState::Owner => self.check_claimed(peer),
            ClaimState::Unclaimed => {
                if self.session.is_some() {
                    Err(Error::AlreadyInUse("Device was already claimed".into()))
                } else {
                    Ok(())
                }
            }
            ClaimState::OwnerOrUnclaimed => match self.check_claimed(peer) {
                Err(Error::ClaimRequired) => Ok(()),
                other => other,
            },
        }
    }

    /// Claim-ownership precondition shared by the session methods.
    fn check_claimed(&self, peer: &PeerInfo) -> Result<()> {
        let Some(session) = &self.session else {
            return Err(Error::ClaimRequired);
        };
        if session.conn != peer.conn || session.pending_open.is_some() {
            return Err(Error::AlreadyInUse(
                "Device already in use by another user".into(),
            ));
        }
        Ok(())
    }

    fn add_client(&mut self, conn: ConnId) {
        if self.clients.insert(conn) && self.clients.len() == 1 {
            self.set_in_use(true);
        }
    }

    fn client_vanished(&mut self, conn: ConnId) {
        let was_owner = self
            .session
            .as_ref()
            .is_some_and(|session| session.conn == conn);

        if was_owner {
            info!("claimant of device {} vanished", self.id);
            if self.op.is_scan() {
                if let Some(cancel) = &self.cancel {
                    cancel.cancel();
                }
                self.vanish_cleanup = true;
            } else if self.op == Operation::Open {
                self.vanish_cleanup = true;
            } else if self.op == Operation::None {
                self.start_close(None);
            }
            // A close already in flight will clear the session itself
        }

        if self.clients.remove(&conn) && self.clients.is_empty() {
            self.set_in_use(false);
        }
    }

    fn set_in_use(&mut self, in_use: bool) {
        let _ = self.in_use_tx.send(in_use);
        let _ = self.notice_tx.send(InUseChanged {
            id: self.id,
            in_use,
        });
    }

    fn emit(&self, signal: DeviceSignal) {
        let _ = self.events.send(signal);
    }
}

/// Peer identification logged when the deprecated delete method is used.
fn log_offending_client(peer: &PeerInfo) {
    #[cfg(target_os = "linux")]
    if let Some(pid) = peer.pid {
        if let Ok(comm) = std::fs::read_to_string(format!("/proc/{pid}/comm")) {
            warn!("offending API user is {}", comm.trim_end());
            return;
        }
    }
    warn!("offending API user has uid {}", peer.uid);
}

enum ScanInput {
    Single(Template),
    Gallery(Vec<Template>),
}

/// Drive one verify/identify operation to a terminal verdict,
/// resubmitting on retry-class results with the same input and the same
/// cancellation flag.
async fn run_scan(
    scanner: Arc<dyn Scanner>,
    input: ScanInput,
    cancel: CancelFlag,
    events: broadcast::Sender<DeviceSignal>,
    cmd_tx: mpsc::Sender<DeviceCommand>,
) {
    loop {
        let verdict = match &input {
            ScanInput::Single(template) => scanner.verify(template, cancel.clone()).await,
            ScanInput::Gallery(gallery) => scanner.identify(gallery, cancel.clone()).await,
        };

        if let ScanVerdict::Retry(hint) = verdict {
            let status = VerifyStatus::Retry(hint);
            debug!("scan retry: {}", status);
            let _ = events.send(DeviceSignal::VerifyStatus {
                result: status.as_str().to_string(),
                done: false,
            });
            continue;
        }

        let _ = cmd_tx.send(DeviceCommand::ScanDone(verdict)).await;
        return;
    }
}

/// Drive one enroll operation to a terminal verdict.
///
/// Per-stage progress is forwarded as non-final status events; retries
/// resubmit like verify. On a storage-full verdict one device-resident
/// template unknown to the store is reclaimed and the enroll is
/// retransmitted, at most once.
async fn run_enroll(
    scanner: Arc<dyn Scanner>,
    store: Arc<TemplateStore>,
    blank: Template,
    cancel: CancelFlag,
    events: broadcast::Sender<DeviceSignal>,
    cmd_tx: mpsc::Sender<DeviceCommand>,
) {
    let mut reclaim_attempted = false;

    loop {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let stages = scanner.enroll_stages();
        let progress_events = events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(completed) = progress_rx.recv().await {
                if stages < 0 || (completed as i64) < stages as i64 {
                    let _ = progress_events.send(DeviceSignal::EnrollStatus {
                        result: EnrollStatus::StagePassed.as_str().to_string(),
                        done: false,
                    });
                }
            }
        });

        let verdict = scanner.enroll(blank.clone(), cancel.clone(), progress_tx).await;
        let _ = forwarder.await;

        match verdict {
            EnrollVerdict::Retry(hint) => {
                let status = EnrollStatus::Retry(hint);
                debug!("enroll retry: {}", status);
                let _ = events.send(DeviceSignal::EnrollStatus {
                    result: status.as_str().to_string(),
                    done: false,
                });
                continue;
            }
            EnrollVerdict::StorageFull if !reclaim_attempted => {
                reclaim_attempted = true;
                debug!("device storage is full, trying to garbage collect old prints");
                if try_reclaim_device_print(&*scanner, &store).await {
                    // Reclaimed one, retransmit the same enroll
                    continue;
                }
                let _ = cmd_tx
                    .send(DeviceCommand::EnrollDone(EnrollVerdict::StorageFull))
                    .await;
                return;
            }
            terminal => {
                let _ = cmd_tx.send(DeviceCommand::EnrollDone(terminal)).await;
                return;
            }
        }
    }
}

/// Delete one device-resident template that no known user's stored
/// templates account for. Returns whether anything was reclaimed.
async fn try_reclaim_device_print(scanner: &dyn Scanner, store: &TemplateStore) -> bool {
    let mut device_prints = match scanner.list_prints().await {
        Ok(prints) => prints,
        Err(e) => {
            warn!("failed to query device prints: {}", e);
            return false;
        }
    };

    debug!("device has {} prints stored", device_prints.len());

    let users = match store.discover_users() {
        Ok(users) => users,
        Err(e) => {
            warn!("failed to enumerate store users: {}", e);
            return false;
        }
    };

    for username in users {
        let fingers = match store.discover_fingers(scanner.device_id(), &username) {
            Ok(fingers) => fingers,
            Err(_) => continue,
        };
        for finger in fingers {
            let Ok(known) = store.load(scanner.device_id(), finger, &username) else {
                continue;
            };
            // Content equality, not identity: anything we have on file
            // is accounted for
            device_prints.retain(|print| *print != known);
        }
    }

    debug!(
        "device has {} prints stored that we do not need",
        device_prints.len()
    );
    let Some(stale) = device_prints.first() else {
        return false;
    };

    match scanner.delete_print(stale).await {
        Ok(()) => true,
        Err(e) => {
            warn!("failed to garbage collect a print: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Action, StaticAuthority, StaticUsers, UserDb};
    use crate::hardware::MockScanner;
    use tempfile::TempDir;

    struct Rig {
        handle: DeviceHandle,
        scanner: Arc<MockScanner>,
        _store_dir: TempDir,
        _notice_rx: mpsc::UnboundedReceiver<InUseChanged>,
    }

    fn peer(conn: ConnId, uid: u32) -> PeerInfo {
        let users = StaticUsers(
            [(1000, "alice".to_string()), (1001, "bob".to_string())]
                .into_iter()
                .collect(),
        );
        PeerInfo {
            conn,
            uid,
            pid: None,
            username: users.name_for_uid(uid),
        }
    }

    fn rig(scanner: MockScanner) -> Rig {
        let store_dir = TempDir::new().unwrap();
        let store = Arc::new(TemplateStore::new(store_dir.path()));
        let authority = Arc::new(
            StaticAuthority::new()
                .allow(1000, Action::Verify)
                .allow(1000, Action::Enroll)
                .allow(1001, Action::Verify)
                .allow(1001, Action::Enroll),
        );
        let scanner = Arc::new(scanner);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let handle = spawn_controller(
            0,
            Arc::clone(&scanner) as Arc<dyn Scanner>,
            store,
            authority,
            notice_tx,
        );
        Rig {
            handle,
            scanner,
            _store_dir: store_dir,
            _notice_rx: notice_rx,
        }
    }

    fn mock() -> MockScanner {
        MockScanner::new(DeviceId::new("mockdrv", "0001"), "Mock Sensor")
    }

    #[tokio::test]
    async fn second_claim_fails_until_release() {
        let rig = rig(mock());
        let alice = peer(1, 1000);
        let bob = peer(2, 1001);

        rig.handle.claim(alice.clone(), String::new()).await.unwrap();

        let err = rig
            .handle
            .claim(bob.clone(), String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInUse(_)));

        rig.handle.release(alice).await.unwrap();
        rig.handle.claim(bob, String::new()).await.unwrap();
    }

    #[tokio::test]
    async fn operations_require_a_claim() {
        let rig = rig(mock());
        let alice = peer(1, 1000);

        assert!(matches!(
            rig.handle
                .verify_start(alice.clone(), "any".into())
                .await
                .unwrap_err(),
            Error::ClaimRequired
        ));
        assert!(matches!(
            rig.handle.release(alice.clone()).await.unwrap_err(),
            Error::ClaimRequired
        ));
        assert!(matches!(
            rig.handle
                .enroll_start(alice, "left-thumb".into())
                .await
                .unwrap_err(),
            Error::ClaimRequired
        ));
    }

    #[tokio::test]
    async fn claim_fails_atomically_when_open_fails() {
        let scanner = mock();
        let rig = rig(scanner);
        rig.scanner.push_open_failure("usb fell off").await;

        let alice = peer(1, 1000);
        let err = rig
            .handle
            .claim(alice.clone(), String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        // The failed claim left no session behind
        rig.handle.claim(alice, String::new()).await.unwrap();
    }

    #[tokio::test]
    async fn verify_stop_without_operation() {
        let rig = rig(mock());
        let alice = peer(1, 1000);
        rig.handle.claim(alice.clone(), String::new()).await.unwrap();

        assert!(matches!(
            rig.handle.verify_stop(alice).await.unwrap_err(),
            Error::NoActionInProgress
        ));
    }

    #[tokio::test]
    async fn verify_any_without_prints() {
        let rig = rig(mock());
        let alice = peer(1, 1000);
        rig.handle.claim(alice.clone(), String::new()).await.unwrap();

        assert!(matches!(
            rig.handle
                .verify_start(alice, "any".into())
                .await
                .unwrap_err(),
            Error::NoEnrolledPrints
        ));
    }

    #[tokio::test]
    async fn enroll_rejects_any() {
        let rig = rig(mock());
        let alice = peer(1, 1000);
        rig.handle.claim(alice.clone(), String::new()).await.unwrap();

        assert!(matches!(
            rig.handle
                .enroll_start(alice, "any".into())
                .await
                .unwrap_err(),
            Error::InvalidFingerName
        ));
    }

    #[tokio::test]
    async fn stop_waits_for_terminal_callback() {
        let rig = rig(mock());
        let alice = peer(1, 1000);
        rig.handle.claim(alice.clone(), String::new()).await.unwrap();

        let mut events = rig.handle.subscribe();
        rig.handle
            .enroll_start(alice.clone(), "right-index-finger".into())
            .await
            .unwrap();

        // The mock parks with an empty script; stopping cancels it and
        // the stop reply arrives after the terminal status
        rig.handle.enroll_stop(alice.clone()).await.unwrap();

        let mut saw_final = false;
        while let Ok(signal) = events.try_recv() {
            if let DeviceSignal::EnrollStatus { done: true, result } = signal {
                assert_eq!(result, "enroll-unknown-error");
                saw_final = true;
            }
        }
        assert!(saw_final);

        // Device is usable again
        assert!(matches!(
            rig.handle.enroll_stop(alice).await.unwrap_err(),
            Error::NoActionInProgress
        ));
    }
}
