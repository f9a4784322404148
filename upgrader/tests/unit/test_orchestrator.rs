//! Orchestrator scenario tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use switch_upgrade::upgrade::events::ChannelSink;
use switch_upgrade::upgrade::fsm::UpgradeState;
use switch_upgrade::upgrade::UpgradeOutcome;

use crate::support::{
    orchestrator, recording_sleep, request, FakeDevice, MemoryBackupStore, GRACE, RETRY_DELAY,
    RUNNING_CONFIG,
};

fn states(report: &switch_upgrade::upgrade::UpgradeReport) -> Vec<UpgradeState> {
    report.transitions.iter().map(|t| t.state).collect()
}

#[tokio::test]
async fn test_already_current_makes_no_changes() {
    let device = FakeDevice::with_versions(&["12.1"]);
    let backups = Arc::new(MemoryBackupStore::default());
    let waits = Arc::new(Mutex::new(Vec::new()));

    let report = orchestrator(&device, backups.clone())
        .run_upgrade_with(&request("12.1"), recording_sleep(waits.clone()))
        .await;

    assert_eq!(
        report.outcome,
        UpgradeOutcome::AlreadyCurrent { version: "12.1".to_string() }
    );
    assert_eq!(device.side_effects(), 0);
    assert!(backups.snapshots.lock().unwrap().is_empty());
    assert!(waits.lock().unwrap().is_empty());
    assert!(!report.rollback_attempted);
    assert_eq!(device.get(|s| (s.connects, s.disconnects)), (1, 1));
    assert_eq!(
        states(&report),
        vec![UpgradeState::VersionChecked, UpgradeState::AlreadyCurrent]
    );
}

#[tokio::test]
async fn test_success_on_third_verification_attempt() {
    let device = FakeDevice::with_versions(&["12.1", "12.1", "12.1", "12.2"]);
    let backups = Arc::new(MemoryBackupStore::default());
    let waits = Arc::new(Mutex::new(Vec::new()));

    let report = orchestrator(&device, backups.clone())
        .run_upgrade_with(&request("12.2"), recording_sleep(waits.clone()))
        .await;

    assert_eq!(report.outcome, UpgradeOutcome::Success { version: "12.2".to_string() });
    assert_eq!(report.verification_attempts, 3);
    assert!(!report.rollback_attempted);
    assert_eq!(device.get(|s| s.reboot_previous), 0);
    assert_eq!(*waits.lock().unwrap(), vec![GRACE, RETRY_DELAY, RETRY_DELAY]);
    assert_eq!(
        states(&report),
        vec![
            UpgradeState::VersionChecked,
            UpgradeState::BackedUp,
            UpgradeState::Transferred,
            UpgradeState::Installed,
            UpgradeState::Success,
        ]
    );
    assert!(report.backup.is_some());
}

#[tokio::test]
async fn test_exhausted_verification_rolls_back_once() {
    let device = FakeDevice::with_versions(&["12.1"]);
    // connect #1 is the pre-install session; #2..#6 are verification attempts
    device.update(|s| s.failing_connects = [3, 5].into_iter().collect());
    let backups = Arc::new(MemoryBackupStore::default());
    let waits = Arc::new(Mutex::new(Vec::new()));

    let report = orchestrator(&device, backups.clone())
        .run_upgrade_with(&request("12.2"), recording_sleep(waits.clone()))
        .await;

    match &report.outcome {
        UpgradeOutcome::FailedRolledBack { reason } => {
            assert!(reason.contains("after 5 attempts"), "{}", reason);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(report.verification_attempts, 5);
    assert!(report.rollback_attempted);
    assert_eq!(device.get(|s| s.reboot_previous), 1);
    assert_eq!(device.get(|s| s.restores.clone()), vec![RUNNING_CONFIG.to_string()]);
    assert_eq!(
        *waits.lock().unwrap(),
        vec![GRACE, RETRY_DELAY, RETRY_DELAY, RETRY_DELAY, RETRY_DELAY, GRACE]
    );
    assert_eq!(
        states(&report)[4..].to_vec(),
        vec![UpgradeState::RollbackPending, UpgradeState::RolledBack]
    );
}

#[tokio::test]
async fn test_restore_failure_is_fatal_with_both_causes() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.fail_restore = true);
    let backups = Arc::new(MemoryBackupStore::default());
    let waits = Arc::new(Mutex::new(Vec::new()));

    let report = orchestrator(&device, backups)
        .run_upgrade_with(&request("12.2"), recording_sleep(waits))
        .await;

    match &report.outcome {
        UpgradeOutcome::FailedRollbackFailed { reason, rollback_error } => {
            assert!(reason.contains("verification failed"), "{}", reason);
            assert!(rollback_error.contains("configuration restore failed"), "{}", rollback_error);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(report.outcome.is_fatal());
    assert_eq!(report.verification_attempts, 5);
    assert_eq!(device.get(|s| s.reboot_previous), 1);
}

#[tokio::test]
async fn test_unreadable_backup_fails_rollback() {
    let device = FakeDevice::with_versions(&["12.1"]);
    let backups = Arc::new(MemoryBackupStore {
        fail_read: true,
        ..Default::default()
    });
    let waits = Arc::new(Mutex::new(Vec::new()));

    let report = orchestrator(&device, backups.clone())
        .run_upgrade_with(&request("12.2"), recording_sleep(waits))
        .await;

    match &report.outcome {
        UpgradeOutcome::FailedRollbackFailed { rollback_error, .. } => {
            assert!(rollback_error.contains("could not load backup"), "{}", rollback_error);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(*backups.reads.lock().unwrap(), 1);
    assert!(device.get(|s| s.restores.is_empty()));
}

#[tokio::test]
async fn test_image_revert_failure_skips_restore() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.fail_reboot_previous = true);
    let backups = Arc::new(MemoryBackupStore::default());
    let waits = Arc::new(Mutex::new(Vec::new()));

    let report = orchestrator(&device, backups.clone())
        .run_upgrade_with(&request("12.2"), recording_sleep(waits.clone()))
        .await;

    match &report.outcome {
        UpgradeOutcome::FailedRollbackFailed { rollback_error, .. } => {
            assert!(rollback_error.contains("image revert failed"), "{}", rollback_error);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(device.get(|s| s.restores.is_empty()));
    assert_eq!(*backups.reads.lock().unwrap(), 0);
    // no reboot wait after a failed revert
    assert_eq!(waits.lock().unwrap().last(), Some(&RETRY_DELAY));
}

#[tokio::test]
async fn test_rollback_connect_failure_is_fatal() {
    let device = FakeDevice::with_versions(&["12.1"]);
    // 1 pre-install + 5 verification connects, then the rollback connect fails
    device.update(|s| s.failing_connects = [7].into_iter().collect());
    let backups = Arc::new(MemoryBackupStore::default());

    let report = orchestrator(&device, backups)
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    assert!(matches!(
        report.outcome,
        UpgradeOutcome::FailedRollbackFailed { ref rollback_error, .. }
            if rollback_error.contains("could not connect to start rollback")
    ));
    assert_eq!(device.get(|s| s.reboot_previous), 0);
}

#[tokio::test]
async fn test_backup_failure_never_transfers() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.fail_backup = true);
    let backups = Arc::new(MemoryBackupStore::default());

    let report = orchestrator(&device, backups.clone())
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    assert!(matches!(
        report.outcome,
        UpgradeOutcome::FailedNoChange { ref reason } if reason.starts_with("backup failed")
    ));
    assert_eq!(device.get(|s| (s.uploads, s.installs, s.reboot_previous)), (0, 0, 0));
    assert!(!report.rollback_attempted);
    assert!(report.backup.is_none());
    assert_eq!(device.get(|s| s.open_sessions), 0);
}

#[tokio::test]
async fn test_backup_store_failure_never_transfers() {
    let device = FakeDevice::with_versions(&["12.1"]);
    let backups = Arc::new(MemoryBackupStore {
        fail_save: true,
        ..Default::default()
    });

    let report = orchestrator(&device, backups)
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    assert!(matches!(
        report.outcome,
        UpgradeOutcome::FailedNoChange { ref reason } if reason.contains("disk full")
    ));
    assert_eq!(device.get(|s| (s.uploads, s.installs)), (0, 0));
}

#[tokio::test]
async fn test_transfer_failure_aborts_without_install() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.fail_upload = true);

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    assert!(matches!(
        report.outcome,
        UpgradeOutcome::FailedNoChange { ref reason } if reason.contains("firmware transfer failed")
    ));
    assert_eq!(device.get(|s| s.installs), 0);
    assert!(!report.rollback_attempted);
}

#[tokio::test]
async fn test_install_failure_does_not_roll_back() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.fail_install = true);
    let waits = Arc::new(Mutex::new(Vec::new()));

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .run_upgrade_with(&request("12.2"), recording_sleep(waits.clone()))
        .await;

    assert!(matches!(report.outcome, UpgradeOutcome::FailedNoChange { .. }));
    assert!(!report.rollback_attempted);
    assert_eq!(device.get(|s| (s.reboot_previous, s.restores.len())), (0, 0));
    assert_eq!(report.verification_attempts, 0);
    assert!(waits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_failure_aborts() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.failing_connects = [1].into_iter().collect());

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    assert!(matches!(
        report.outcome,
        UpgradeOutcome::FailedNoChange { ref reason } if reason.contains("could not connect")
    ));
    assert_eq!(device.side_effects(), 0);
    assert_eq!(states(&report), vec![UpgradeState::Aborted]);
}

#[tokio::test]
async fn test_unknown_version_aborts() {
    let device = FakeDevice::with_versions(&[]);

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    assert!(matches!(
        report.outcome,
        UpgradeOutcome::FailedNoChange { ref reason } if reason.contains("could not determine current version")
    ));
    assert_eq!(device.get(|s| s.disconnects), 1);
}

#[tokio::test]
async fn test_invalid_request_never_connects() {
    let device = FakeDevice::with_versions(&["12.1"]);
    let mut req = request("12.2");
    req.max_retries = 0;

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .run_upgrade_with(&req, recording_sleep(Default::default()))
        .await;

    assert!(matches!(report.outcome, UpgradeOutcome::FailedNoChange { .. }));
    assert_eq!(device.get(|s| s.connects), 0);
}

#[tokio::test]
async fn test_panic_during_verification_triggers_rollback() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.panic_on_verify = true);

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    assert!(matches!(
        report.outcome,
        UpgradeOutcome::FailedRolledBack { ref reason } if reason.contains("parser blew up")
    ));
    assert!(report.rollback_attempted);
    assert_eq!(device.get(|s| s.reboot_previous), 1);
    // the panicking attempt still closed its session before rollback connected
    assert_eq!(device.get(|s| (s.open_sessions, s.max_open_sessions)), (0, 1));
    assert_eq!(device.get(|s| s.connects), device.get(|s| s.disconnects));
}

#[tokio::test]
async fn test_panic_during_rollback_is_fatal() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.panic_on_reboot_previous = true);

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    match &report.outcome {
        UpgradeOutcome::FailedRollbackFailed { reason, rollback_error } => {
            assert!(reason.contains("verification failed"), "{}", reason);
            assert!(rollback_error.contains("rollback aborted unexpectedly"), "{}", rollback_error);
            assert!(rollback_error.contains("boot menu changed"), "{}", rollback_error);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(report.outcome.is_fatal());
    assert!(device.get(|s| s.restores.is_empty()));
    assert_eq!(device.get(|s| (s.open_sessions, s.max_open_sessions)), (0, 1));
}

#[tokio::test]
async fn test_panic_before_install_aborts_and_closes_session() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.panic_on_backup = true);

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    assert!(matches!(
        report.outcome,
        UpgradeOutcome::FailedNoChange { ref reason } if reason.contains("config dump overflowed")
    ));
    assert!(!report.rollback_attempted);
    assert_eq!(device.get(|s| (s.uploads, s.installs)), (0, 0));
    assert_eq!(device.get(|s| (s.connects, s.disconnects, s.open_sessions)), (1, 1, 0));
}

#[tokio::test]
async fn test_sessions_never_overlap_and_always_close() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.failing_connects = [4].into_iter().collect());

    orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    let (connects, disconnects, open, max_open) =
        device.get(|s| (s.connects, s.disconnects, s.open_sessions, s.max_open_sessions));
    assert_eq!(max_open, 1);
    assert_eq!(open, 0);
    // the failed connect never opened a session
    assert_eq!(disconnects, connects - 1);
}

#[tokio::test]
async fn test_transitions_are_streamed_to_sink() {
    let device = FakeDevice::with_versions(&["12.1", "12.2"]);
    let (sink, mut events) = ChannelSink::channel();

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .with_sink(Arc::new(sink))
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    let mut streamed = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.run_id, report.run_id);
        assert_eq!(event.hostname, "sw1");
        streamed.push(event.record);
    }
    assert_eq!(streamed, report.transitions);
    assert!(streamed.iter().all(|r| r.success));
}

#[tokio::test]
async fn test_cancellation_before_start_aborts() {
    let device = FakeDevice::with_versions(&["12.1"]);
    let (_tx, rx) = watch::channel(true);

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .with_cancellation(rx)
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    assert!(matches!(
        report.outcome,
        UpgradeOutcome::FailedNoChange { ref reason } if reason == "Upgrade cancelled before connecting"
    ));
    assert_eq!(device.get(|s| s.connects), 0);
}

#[tokio::test]
async fn test_cancellation_after_install_is_deferred() {
    let device = FakeDevice::with_versions(&["12.1", "12.2"]);
    let (tx, rx) = watch::channel(false);
    device.update(|s| s.cancel_on_install = Some(tx));

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .with_cancellation(rx)
        .run_upgrade_with(&request("12.2"), recording_sleep(Default::default()))
        .await;

    assert_eq!(report.outcome, UpgradeOutcome::Success { version: "12.2".to_string() });
    assert_eq!(report.verification_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_install_timeout_aborts() {
    let device = FakeDevice::with_versions(&["12.1"]);
    device.update(|s| s.hang_install = true);
    let mut req = request("12.2");
    req.install_timeout = Duration::from_secs(600);

    let report = orchestrator(&device, Arc::new(MemoryBackupStore::default()))
        .run_upgrade(&req)
        .await;

    assert!(matches!(
        report.outcome,
        UpgradeOutcome::FailedNoChange { ref reason } if reason.contains("did not return within")
    ));
    assert!(!report.rollback_attempted);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_runs_wait_independently() {
    let fast = FakeDevice::with_versions(&["12.1", "12.2"]);
    let slow = FakeDevice::with_versions(&["12.1"]);

    let fast_run = {
        let orchestrator = orchestrator(&fast, Arc::new(MemoryBackupStore::default()));
        tokio::spawn(async move { orchestrator.run_upgrade(&request("12.2")).await })
    };
    let slow_run = {
        let orchestrator = orchestrator(&slow, Arc::new(MemoryBackupStore::default()));
        tokio::spawn(async move { orchestrator.run_upgrade(&request("12.2")).await })
    };

    let fast_report = fast_run.await.unwrap();
    let slow_report = slow_run.await.unwrap();

    assert!(matches!(fast_report.outcome, UpgradeOutcome::Success { .. }));
    assert!(matches!(slow_report.outcome, UpgradeOutcome::FailedRolledBack { .. }));
    assert_eq!(fast_report.verification_attempts, 1);
    assert_eq!(slow_report.verification_attempts, 5);
}
