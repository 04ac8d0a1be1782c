//! End-to-end device controller scenarios
//!
//! These drive a controller directly through its handle, with a
//! scripted scanner, and check the externally observable contract:
//! status signals, retry behavior, storage garbage collection and the
//! enroll-then-verify flow.

use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::mpsc;

use dactyl_core::{DeviceId, Error, Finger, RetryHint, Template, TemplateData};
use dactyl_daemon::access::{Action, ConnId, PeerInfo, StaticAuthority};
use dactyl_daemon::device::{spawn_controller, DeviceHandle, DeviceSignal, InUseChanged};
use dactyl_daemon::hardware::{EnrollVerdict, ScanVerdict, Scanner};
use dactyl_daemon::{MockScanner, TemplateStore};
use tempfile::TempDir;

const DRIVER: &str = "mockdrv";
const INSTANCE: &str = "0001";

struct Rig {
    handle: DeviceHandle,
    scanner: Arc<MockScanner>,
    store: Arc<TemplateStore>,
    _store_dir: TempDir,
    _notices: mpsc::UnboundedReceiver<InUseChanged>,
}

fn device_id() -> DeviceId {
    DeviceId::new(DRIVER, INSTANCE)
}

fn alice(conn: ConnId) -> PeerInfo {
    PeerInfo {
        conn,
        uid: 1000,
        pid: None,
        username: Some("alice".to_string()),
    }
}

fn rig(scanner: MockScanner) -> Rig {
    let store_dir = TempDir::new().unwrap();
    let store = Arc::new(TemplateStore::new(store_dir.path()));
    let authority = Arc::new(
        StaticAuthority::new()
            .allow(1000, Action::Verify)
            .allow(1000, Action::Enroll),
    );
    let scanner = Arc::new(scanner);
    let (notice_tx, notices) = mpsc::unbounded_channel();
    let handle = spawn_controller(
        0,
        Arc::clone(&scanner) as Arc<dyn Scanner>,
        Arc::clone(&store),
        authority,
        notice_tx,
    );
    Rig {
        handle,
        scanner,
        store,
        _store_dir: store_dir,
        _notices: notices,
    }
}

fn stored_template(finger: Finger, payload: &[u8]) -> Template {
    Template {
        device_id: device_id(),
        finger,
        username: "alice".to_string(),
        enroll_date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
        payload: TemplateData::new(payload.to_vec()),
    }
}

/// Collect signals until a final verify/enroll status arrives.
async fn collect_until_final(
    events: &mut tokio::sync::broadcast::Receiver<DeviceSignal>,
) -> Vec<DeviceSignal> {
    let mut seen = Vec::new();
    loop {
        let signal = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a final status")
            .expect("signal stream ended");
        let done = matches!(
            &signal,
            DeviceSignal::VerifyStatus { done: true, .. }
                | DeviceSignal::EnrollStatus { done: true, .. }
        );
        seen.push(signal);
        if done {
            return seen;
        }
    }
}

// ==========================================
// Enroll, then verify with "any"
// ==========================================
#[tokio::test]
async fn enroll_then_verify_any() {
    let rig = rig(MockScanner::new(device_id(), "Mock Sensor").with_stages(3));
    let caller = alice(1);

    rig.handle.claim(caller.clone(), String::new()).await.unwrap();

    // With nothing enrolled, "any" has nothing to offer
    assert!(matches!(
        rig.handle
            .verify_start(caller.clone(), "any".into())
            .await
            .unwrap_err(),
        Error::NoEnrolledPrints
    ));

    // Enroll the right index finger
    let mut events = rig.handle.subscribe();
    rig.scanner
        .push_enroll_verdict(EnrollVerdict::Enrolled(stored_template(
            Finger::RightIndex,
            b"unused",
        )))
        .await;
    rig.handle
        .enroll_start(caller.clone(), "right-index-finger".into())
        .await
        .unwrap();

    let seen = collect_until_final(&mut events).await;
    let finals: Vec<_> = seen
        .iter()
        .filter_map(|s| match s {
            DeviceSignal::EnrollStatus { result, done: true } => Some(result.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(finals, vec!["enroll-completed"]);

    // Stage progress arrived as non-final events
    let stages = seen
        .iter()
        .filter(|s| {
            matches!(
                s,
                DeviceSignal::EnrollStatus { result, done: false } if result == "enroll-stage-passed"
            )
        })
        .count();
    assert!(stages > 0, "expected stage-passed events, got {seen:?}");

    // The template was persisted
    assert_eq!(
        rig.store
            .discover_fingers(&device_id(), "alice")
            .unwrap(),
        vec![Finger::RightIndex]
    );

    // Verify with "any" now picks the single enrolled finger
    let mut events = rig.handle.subscribe();
    rig.handle
        .verify_start(caller.clone(), "any".into())
        .await
        .unwrap();
    rig.scanner.push_verify_verdict(ScanVerdict::Match).await;

    let seen = collect_until_final(&mut events).await;
    assert!(
        seen.iter().any(|s| matches!(
            s,
            DeviceSignal::VerifyFingerSelected { finger } if finger == "right-index-finger"
        )),
        "expected VerifyFingerSelected(right-index-finger), got {seen:?}"
    );
    assert!(seen.iter().any(|s| matches!(
        s,
        DeviceSignal::VerifyStatus { result, done: true } if result == "verify-match"
    )));

    rig.handle.release(caller).await.unwrap();
}

// ==========================================
// Retry-class outcomes resubmit automatically
// ==========================================
#[tokio::test]
async fn retries_resubmit_with_one_final_status() {
    let rig = rig(MockScanner::new(device_id(), "Mock Sensor"));
    rig.store
        .save(&stored_template(Finger::LeftThumb, b"print"))
        .unwrap();

    let caller = alice(1);
    rig.handle.claim(caller.clone(), String::new()).await.unwrap();

    let mut events = rig.handle.subscribe();
    rig.handle
        .verify_start(caller.clone(), "left-thumb".into())
        .await
        .unwrap();

    rig.scanner
        .push_verify_verdict(ScanVerdict::Retry(RetryHint::TooShort))
        .await;
    rig.scanner
        .push_verify_verdict(ScanVerdict::Retry(RetryHint::CenterFinger))
        .await;
    rig.scanner.push_verify_verdict(ScanVerdict::NoMatch).await;

    let seen = collect_until_final(&mut events).await;

    let statuses: Vec<(String, bool)> = seen
        .iter()
        .filter_map(|s| match s {
            DeviceSignal::VerifyStatus { result, done } => Some((result.clone(), *done)),
            _ => None,
        })
        .collect();

    assert_eq!(
        statuses,
        vec![
            ("verify-swipe-too-short".to_string(), false),
            ("verify-finger-not-centered".to_string(), false),
            ("verify-no-match".to_string(), true),
        ]
    );

    rig.handle.release(caller).await.unwrap();
}

// ==========================================
// Storage-full garbage collection
// ==========================================
#[tokio::test]
async fn storage_full_reclaims_one_print_and_retries_once() {
    let scanner = MockScanner::new(device_id(), "Mock Sensor").with_storage(true);
    let rig = rig(scanner);

    // One stored template the service knows about...
    let known = stored_template(Finger::LeftThumb, b"known-print");
    rig.store.save(&known).unwrap();
    rig.scanner.push_device_print(known.clone()).await;

    // ...and one stale device-resident print nobody accounts for
    let stale = stored_template(Finger::RightRing, b"stale-print");
    rig.scanner.push_device_print(stale).await;

    rig.scanner.push_enroll_verdict(EnrollVerdict::StorageFull).await;
    rig.scanner
        .push_enroll_verdict(EnrollVerdict::Enrolled(stored_template(
            Finger::RightIndex,
            b"unused",
        )))
        .await;

    let caller = alice(1);
    rig.handle.claim(caller.clone(), String::new()).await.unwrap();

    let mut events = rig.handle.subscribe();
    rig.handle
        .enroll_start(caller.clone(), "right-index-finger".into())
        .await
        .unwrap();

    let seen = collect_until_final(&mut events).await;
    assert!(seen.iter().any(|s| matches!(
        s,
        DeviceSignal::EnrollStatus { result, done: true } if result == "enroll-completed"
    )));

    // The stale print was deleted, the known one kept, the new one added
    assert_eq!(rig.scanner.device_print_count().await, 2);
    let remaining = rig.scanner.list_prints().await.unwrap();
    assert!(remaining.contains(&known));
    assert!(!remaining.iter().any(|p| p.payload.as_bytes() == b"stale-print"));

    rig.handle.release(caller).await.unwrap();
}

#[tokio::test]
async fn storage_full_without_reclaimable_print_is_final() {
    let scanner = MockScanner::new(device_id(), "Mock Sensor").with_storage(true);
    let rig = rig(scanner);

    // Every device print is accounted for by the store
    let known = stored_template(Finger::LeftThumb, b"known-print");
    rig.store.save(&known).unwrap();
    rig.scanner.push_device_print(known).await;

    rig.scanner.push_enroll_verdict(EnrollVerdict::StorageFull).await;

    let caller = alice(1);
    rig.handle.claim(caller.clone(), String::new()).await.unwrap();

    let mut events = rig.handle.subscribe();
    rig.handle
        .enroll_start(caller.clone(), "right-index-finger".into())
        .await
        .unwrap();

    let seen = collect_until_final(&mut events).await;
    assert!(
        seen.iter().any(|s| matches!(
            s,
            DeviceSignal::EnrollStatus { result, done: true } if result == "enroll-data-full"
        )),
        "expected enroll-data-full, got {seen:?}"
    );

    // Nothing was deleted
    assert_eq!(rig.scanner.device_print_count().await, 1);
}

// ==========================================
// Release drains an in-flight operation
// ==========================================
#[tokio::test]
async fn release_cancels_and_drains_running_verify() {
    let rig = rig(MockScanner::new(device_id(), "Mock Sensor"));
    rig.store
        .save(&stored_template(Finger::LeftThumb, b"print"))
        .unwrap();

    let caller = alice(1);
    rig.handle.claim(caller.clone(), String::new()).await.unwrap();

    let mut events = rig.handle.subscribe();
    rig.handle
        .verify_start(caller.clone(), "left-thumb".into())
        .await
        .unwrap();

    // The scan is parked; release must cancel it, wait for the
    // terminal callback, close the device and only then reply.
    rig.handle.release(caller.clone()).await.unwrap();

    let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(seen.iter().any(|s| matches!(
        s,
        DeviceSignal::VerifyStatus { done: true, .. }
    )));
    assert!(!rig.scanner.is_open().await);

    // And the claim is gone
    assert!(matches!(
        rig.handle.verify_stop(caller).await.unwrap_err(),
        Error::ClaimRequired
    ));
}

// ==========================================
// Specific finger with no stored template
// ==========================================
#[tokio::test]
async fn verify_specific_missing_print_is_internal() {
    let rig = rig(MockScanner::new(device_id(), "Mock Sensor"));
    let caller = alice(1);
    rig.handle.claim(caller.clone(), String::new()).await.unwrap();

    assert!(matches!(
        rig.handle
            .verify_start(caller, "left-thumb".into())
            .await
            .unwrap_err(),
        Error::Internal(_)
    ));
}

// ==========================================
// Deleting enrolled fingers
// ==========================================
#[tokio::test]
async fn delete_enrolled_fingers2_clears_store_and_device() {
    let scanner = MockScanner::new(device_id(), "Mock Sensor").with_storage(true);
    let rig = rig(scanner);

    let known = stored_template(Finger::LeftThumb, b"print");
    rig.store.save(&known).unwrap();
    rig.scanner.push_device_print(known).await;

    let caller = alice(1);
    rig.handle.claim(caller.clone(), String::new()).await.unwrap();
    rig.handle.delete_enrolled_fingers2(caller.clone()).await.unwrap();

    assert!(rig
        .store
        .discover_fingers(&device_id(), "alice")
        .unwrap()
        .is_empty());
    assert_eq!(rig.scanner.device_print_count().await, 0);

    rig.handle.release(caller).await.unwrap();
}

#[tokio::test]
async fn deprecated_delete_works_unclaimed() {
    let scanner = MockScanner::new(device_id(), "Mock Sensor").with_storage(true);
    let rig = rig(scanner);

    let known = stored_template(Finger::LeftThumb, b"print");
    rig.store.save(&known).unwrap();
    rig.scanner.push_device_print(known).await;

    // No claim at all: the deprecated variant opens and closes the
    // device around the deletion itself
    let caller = alice(1);
    rig.handle
        .delete_enrolled_fingers(caller, "alice".into())
        .await
        .unwrap();

    assert!(rig
        .store
        .discover_fingers(&device_id(), "alice")
        .unwrap()
        .is_empty());
    assert_eq!(rig.scanner.device_print_count().await, 0);
    assert_eq!(rig.scanner.open_count().await, 1);
    assert_eq!(rig.scanner.close_count().await, 1);
}
