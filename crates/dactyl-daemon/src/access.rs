//! Caller identity and the authorization gate
//!
//! Every privileged IPC method is described by one row of a static
//! policy table: the claim state it needs, the action set the caller
//! must be authorized for, and whether it resolves a username argument.
//! One gate function consults the table; the controller never makes
//! ad-hoc permission decisions.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tracing::debug;

use dactyl_core::{Error, Result};

/// Connection identifier assigned by the IPC server.
pub type ConnId = u64;

/// Identity of an IPC peer, resolved once when its connection is
/// accepted.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub conn: ConnId,
    pub uid: u32,
    pub pid: Option<i32>,
    /// OS user name for `uid`, if the lookup succeeded
    pub username: Option<String>,
}

impl PeerInfo {
    /// The peer's own username; an account lookup failure surfaces as
    /// an Internal error.
    pub fn own_username(&self) -> Result<&str> {
        self.username.as_deref().ok_or_else(|| {
            Error::Internal(format!(
                "Failed to get information about user UID {}",
                self.uid
            ))
        })
    }
}

/// Privileged capabilities, one per stable action name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Verify,
    Enroll,
    SetUsername,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Verify => "device.verify",
            Action::Enroll => "device.enroll",
            Action::SetUsername => "device.set-username",
        }
    }
}

/// Per-action allow/deny decisions for a caller identity.
///
/// A check may suspend (the backing policy system can prompt the user
/// interactively).
#[async_trait]
pub trait Authority: Send + Sync {
    async fn check(&self, peer: &PeerInfo, action: Action) -> Result<bool>;
}

/// Development policy: root may do anything, everyone else may verify
/// and enroll for themselves but not act as another user.
pub struct Permissive;

#[async_trait]
impl Authority for Permissive {
    async fn check(&self, peer: &PeerInfo, action: Action) -> Result<bool> {
        let allowed = peer.uid == 0 || !matches!(action, Action::SetUsername);
        debug!(
            uid = peer.uid,
            action = action.as_str(),
            allowed,
            "authorization check"
        );
        Ok(allowed)
    }
}

/// Explicit allow table keyed by uid, used by tests.
#[derive(Default)]
pub struct StaticAuthority {
    grants: HashMap<u32, HashSet<Action>>,
}

impl StaticAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, uid: u32, action: Action) -> Self {
        self.grants.entry(uid).or_default().insert(action);
        self
    }
}

#[async_trait]
impl Authority for StaticAuthority {
    async fn check(&self, peer: &PeerInfo, action: Action) -> Result<bool> {
        Ok(self
            .grants
            .get(&peer.uid)
            .is_some_and(|actions| actions.contains(&action)))
    }
}

/// uid to username resolution.
pub trait UserDb: Send + Sync {
    fn name_for_uid(&self, uid: u32) -> Option<String>;
}

/// Reads the system passwd database.
pub struct SystemUsers;

impl UserDb for SystemUsers {
    fn name_for_uid(&self, uid: u32) -> Option<String> {
        let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
        for line in passwd.lines() {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let _password = fields.next()?;
            let entry_uid: u32 = fields.next()?.parse().ok()?;
            if entry_uid == uid {
                return Some(name.to_string());
            }
        }
        None
    }
}

/// Fixed uid table, used by tests.
pub struct StaticUsers(pub HashMap<u32, String>);

impl UserDb for StaticUsers {
    fn name_for_uid(&self, uid: u32) -> Option<String> {
        self.0.get(&uid).cloned()
    }
}

/// Claim state a method requires before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// The device must not be claimed by anyone
    Unclaimed,
    /// The calling peer must hold the claim
    Owner,
    /// Claim ownership if claimed; an unclaimed device is tolerated
    OwnerOrUnclaimed,
    /// Claim state is irrelevant
    Ignored,
}

/// The IPC methods subject to the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Claim,
    Release,
    VerifyStart,
    VerifyStop,
    EnrollStart,
    EnrollStop,
    ListEnrolledFingers,
    DeleteEnrolledFingers,
    DeleteEnrolledFingers2,
}

/// One policy table row.
pub struct MethodAccess {
    pub claim: ClaimState,
    pub actions: &'static [Action],
    /// Any listed action suffices (logical OR) rather than all of them
    pub any_of: bool,
    /// The method takes a username argument that must be resolved
    pub resolves_username: bool,
}

pub fn access_for(method: Method) -> &'static MethodAccess {
    const CLAIM: MethodAccess = MethodAccess {
        claim: ClaimState::Unclaimed,
        actions: &[Action::Verify, Action::Enroll],
        any_of: true,
        resolves_username: true,
    };
    const RELEASE: MethodAccess = MethodAccess {
        claim: ClaimState::Owner,
        actions: &[Action::Verify, Action::Enroll],
        any_of: true,
        resolves_username: false,
    };
    const VERIFY_START: MethodAccess = MethodAccess {
        claim: ClaimState::Owner,
        actions: &[Action::Verify],
        any_of: false,
        resolves_username: false,
    };
    const VERIFY_STOP: MethodAccess = VERIFY_START;
    const ENROLL_START: MethodAccess = MethodAccess {
        claim: ClaimState::Owner,
        actions: &[Action::Enroll],
        any_of: false,
        resolves_username: false,
    };
    const ENROLL_STOP: MethodAccess = ENROLL_START;
    const LIST: MethodAccess = MethodAccess {
        claim: ClaimState::Ignored,
        actions: &[Action::Verify],
        any_of: false,
        resolves_username: true,
    };
    const DELETE: MethodAccess = MethodAccess {
        claim: ClaimState::OwnerOrUnclaimed,
        actions: &[Action::Enroll],
        any_of: false,
        resolves_username: true,
    };
    const DELETE2: MethodAccess = MethodAccess {
        claim: ClaimState::Owner,
        actions: &[Action::Enroll],
        any_of: false,
        resolves_username: false,
    };

    match method {
        Method::Claim => &CLAIM,
        Method::Release => &RELEASE,
        Method::VerifyStart => &VERIFY_START,
        Method::VerifyStop => &VERIFY_STOP,
        Method::EnrollStart => &ENROLL_START,
        Method::EnrollStop => &ENROLL_STOP,
        Method::ListEnrolledFingers => &LIST,
        Method::DeleteEnrolledFingers => &DELETE,
        Method::DeleteEnrolledFingers2 => &DELETE2,
    }
}

/// Run the action checks of one table row against the gate.
///
/// Authorization failures and gate infrastructure failures both come
/// back as PermissionDenied; callers cannot tell them apart.
pub async fn check_actions(
    authority: &dyn Authority,
    peer: &PeerInfo,
    access: &MethodAccess,
) -> Result<()> {
    let mut last_denied = None;
    for action in access.actions {
        let authorized = match authority.check(peer, *action).await {
            Ok(ok) => ok,
            Err(e) => return Err(Error::PermissionDenied(e.to_string())),
        };
        if authorized {
            if access.any_of {
                return Ok(());
            }
        } else {
            if !access.any_of {
                return Err(Error::PermissionDenied(action.as_str().to_string()));
            }
            last_denied = Some(*action);
        }
    }

    match last_denied {
        Some(action) if access.any_of => Err(Error::PermissionDenied(action.as_str().to_string())),
        _ => Ok(()),
    }
}

/// Resolve a username hint to the effective acting username.
///
/// Empty or self means the caller's own account; anything else needs
/// the set-username privilege.
pub async fn resolve_acting_username(
    authority: &dyn Authority,
    peer: &PeerInfo,
    hint: &str,
) -> Result<String> {
    let own = peer.own_username()?;
    if hint.is_empty() || hint == own {
        return Ok(own.to_string());
    }

    match authority.check(peer, Action::SetUsername).await {
        Ok(true) => Ok(hint.to_string()),
        Ok(false) => Err(Error::PermissionDenied(
            Action::SetUsername.as_str().to_string(),
        )),
        Err(e) => Err(Error::PermissionDenied(e.to_string())),
    }
}
