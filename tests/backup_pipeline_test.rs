// Integration tests for the backup pipeline
// Runs the real orchestrator against a temporary root, a scripted engine and
// an in-memory bucket

mod common;

use common::{FakeEngine, Harness, STRUCTURED_CONTENT};
use dbvault::backup::{ArtifactFormat, ArtifactKind, BackupOrchestrator};
use dbvault::integrity::{self, VerifyOutcome};
use dbvault::notify::NotificationStatus;
use dbvault::oplog::OperationStatus;
use dbvault::{Stage, VaultError};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_full_backup_produces_sealed_pair() {
    let harness = Harness::local();

    let set = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Full, &harness.ctx.config.target)
        .await
        .expect("full backup");

    let artifacts: Vec<_> = set.artifacts().collect();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(set.primary().format, ArtifactFormat::CustomCompressed);
    assert_eq!(artifacts[1].format, ArtifactFormat::PlainSql);
    assert!(artifacts.iter().all(|a| a.kind == ArtifactKind::Full && a.id == set.id));

    for artifact in &artifacts {
        let path = artifact.local_path.as_ref().expect("local copy");
        assert!(artifact.is_sealed());
        assert_eq!(
            integrity::verify_artifact(path).await.expect("verify"),
            VerifyOutcome::Verified {
                digest: artifact.checksum.clone().expect("checksum")
            }
        );
    }

    let dump = std::fs::read(set.primary().local_path.as_ref().unwrap()).unwrap();
    assert_eq!(dump, STRUCTURED_CONTENT);

    let plain = artifacts[1].local_path.as_ref().unwrap();
    assert!(plain.to_string_lossy().ends_with(".sql.gz"));
    let magic = std::fs::read(plain).unwrap();
    assert_eq!(&magic[..2], &[0x1f, 0x8b]);

    // Two artifacts and two sidecars, nothing else left behind
    assert_eq!(harness.files().len(), 4);
    assert_eq!(
        harness.engine.call_names(),
        vec!["probe", "dump_structured", "render_plain"]
    );
}

#[tokio::test]
async fn test_full_backup_is_logged_and_notified() {
    let harness = Harness::local();

    let set = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Full, &harness.ctx.config.target)
        .await
        .expect("full backup");

    let records = harness.ctx.oplog.read_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].operation, "backup_full");
    assert_eq!(records[0].status, OperationStatus::Success);
    assert_eq!(records[0].artifacts.len(), 2);

    let sent = harness.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, NotificationStatus::Success);
    assert_eq!(sent[0].size_bytes, Some(set.total_size()));
    assert!(sent[0].message.contains(&set.id));
}

#[tokio::test]
async fn test_incremental_backup_is_single_plain_artifact() {
    let harness = Harness::local();

    let set = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Incremental, &harness.ctx.config.target)
        .await
        .expect("incremental backup");

    assert_eq!(set.artifacts().count(), 1);
    let artifact = set.primary();
    assert_eq!(artifact.kind, ArtifactKind::Incremental);
    assert_eq!(artifact.format, ArtifactFormat::PlainSql);
    assert!(artifact.file_name().starts_with("incremental_"));
    assert!(artifact.file_name().ends_with(".sql.gz"));
    assert_eq!(harness.engine.call_names(), vec!["probe", "dump_changes"]);
}

#[tokio::test]
async fn test_snapshot_kind_is_not_user_creatable() {
    let harness = Harness::local();

    let err = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::PreRestoreSnapshot, &harness.ctx.config.target)
        .await
        .unwrap_err();

    assert!(matches!(err, VaultError::UnsupportedOperation(_)));
    assert!(harness.engine.calls().is_empty());
}

#[tokio::test]
async fn test_unreachable_target_fails_at_connect() {
    let harness = Harness::local();
    harness.engine.set_unreachable(true);

    let err = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Full, &harness.ctx.config.target)
        .await
        .unwrap_err();

    assert!(matches!(err, VaultError::Connectivity(_)));
    assert_eq!(err.stage(), Some(Stage::Connect));
    assert!(harness.files().is_empty());
}

#[tokio::test]
async fn test_failed_dump_leaves_no_artifacts() {
    let harness = Harness::local();
    harness.engine.set_fail_dump(true);

    let err = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Full, &harness.ctx.config.target)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Dump));
    assert!(err.to_string().contains("permission denied"));
    assert!(harness.files().is_empty(), "left behind: {:?}", harness.files());

    let records = harness.ctx.oplog.read_all().await.unwrap();
    assert_eq!(records[0].status, OperationStatus::Failure);
    assert_eq!(records[0].stage, Some(Stage::Dump));
    assert_eq!(harness.notifier.sent().await[0].status, NotificationStatus::Failure);
}

#[tokio::test]
async fn test_concurrent_backup_is_busy() {
    let harness = Harness::builder()
        .engine(FakeEngine::new().with_dump_delay(Duration::from_millis(400)))
        .build();

    let ctx = harness.ctx.clone();
    let first = tokio::spawn(async move {
        BackupOrchestrator::new(ctx.clone())
            .create_backup(ArtifactKind::Full, &ctx.config.target)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Incremental, &harness.ctx.config.target)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Busy(_)));
    assert_eq!(err.exit_code(), 75);

    first.await.unwrap().expect("first backup completes");

    // Lock released: the next run goes through
    harness.engine.set_dump_delay(None);
    BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Incremental, &harness.ctx.config.target)
        .await
        .expect("backup after lock release");
}

#[tokio::test]
async fn test_cancelled_backup_writes_no_checksum() {
    let cancel = CancellationToken::new();
    let harness = Harness::builder()
        .engine(FakeEngine::new().with_dump_delay(Duration::from_secs(30)))
        .cancel_token(cancel.clone())
        .build();

    let ctx = harness.ctx.clone();
    let run = tokio::spawn(async move {
        BackupOrchestrator::new(ctx.clone())
            .create_backup(ArtifactKind::Full, &ctx.config.target)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancellation is prompt")
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, VaultError::Cancelled(Stage::Dump)));
    assert_eq!(err.exit_code(), 130);
    assert!(harness.files().is_empty(), "left behind: {:?}", harness.files());
}

#[tokio::test]
async fn test_operation_timeout_cancels_pipeline() {
    let harness = Harness::builder()
        .engine(FakeEngine::new().with_dump_delay(Duration::from_secs(30)))
        .operation_timeout(Duration::from_millis(100))
        .build();

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        BackupOrchestrator::new(harness.ctx.clone()).create_backup(ArtifactKind::Full, &harness.ctx.config.target),
    )
    .await
    .expect("deadline fires")
    .unwrap_err();

    assert!(matches!(err, VaultError::Cancelled(_)));
    assert!(harness.files().is_empty());
}

#[tokio::test]
async fn test_encrypted_backup_keeps_no_plaintext() {
    let harness = Harness::builder().encryption_key("correct horse battery staple").build();

    let set = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Full, &harness.ctx.config.target)
        .await
        .expect("encrypted backup");

    for artifact in set.artifacts() {
        assert!(artifact.encrypted);
        assert!(artifact.file_name().ends_with(".enc"));
        let bytes = std::fs::read(artifact.local_path.as_ref().unwrap()).unwrap();
        assert_ne!(bytes.as_slice(), STRUCTURED_CONTENT);
    }

    let files = harness.files();
    assert_eq!(files.len(), 4);
    assert!(files.iter().all(|f| f.ends_with(".enc") || f.ends_with(".enc.sha256")));
}

#[tokio::test]
async fn test_backup_uploads_artifacts_and_sidecars() {
    let harness = Harness::builder().remote().build();
    let bucket = harness.bucket.clone().unwrap();

    let set = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Full, &harness.ctx.config.target)
        .await
        .expect("backup with remote");

    let keys = bucket.keys().await;
    assert_eq!(keys.len(), 4);
    for artifact in set.artifacts() {
        let name = artifact.file_name();
        let uri = artifact.remote_uri.clone().expect("uploaded");
        assert_eq!(uri, format!("s3://app-backups/backups/{}", name));

        let key = format!("backups/{}", name);
        assert!(keys.contains(&key));
        assert!(keys.contains(&format!("{}.sha256", key)));
        assert_eq!(
            bucket.object(&key).await.unwrap(),
            std::fs::read(artifact.local_path.as_ref().unwrap()).unwrap()
        );
        assert_eq!(
            bucket.put_options(&key).await.unwrap().storage_class.as_deref(),
            Some("STANDARD_IA")
        );
    }
}

#[tokio::test]
async fn test_upload_failure_keeps_local_sealed_artifacts() {
    let harness = Harness::builder().remote().build();
    let bucket = harness.bucket.clone().unwrap();
    bucket.fail_next_puts(10).await;

    let err = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Incremental, &harness.ctx.config.target)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Upload));
    assert!(bucket.keys().await.is_empty());

    let local = harness.ctx.store.list().await.unwrap();
    assert_eq!(local.len(), 1);
    assert!(local[0].is_sealed());
}

#[tokio::test]
async fn test_full_upload_failure_rolls_back_remote_set() {
    let harness = Harness::builder().remote().build();
    let bucket = harness.bucket.clone().unwrap();
    // The structured dump goes up, the plain rendering is refused
    bucket.reject_puts_ending_with(".sql.gz").await;

    let err = BackupOrchestrator::new(harness.ctx.clone())
        .create_backup(ArtifactKind::Full, &harness.ctx.config.target)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Upload));
    assert!(bucket.keys().await.is_empty(), "left in bucket: {:?}", bucket.keys().await);

    let local = harness.ctx.store.list().await.unwrap();
    assert_eq!(local.len(), 2);
    assert!(local.iter().all(|a| a.is_sealed()));

    let records = harness.ctx.oplog.read_all().await.unwrap();
    assert_eq!(records[0].status, OperationStatus::Failure);
    assert_eq!(records[0].stage, Some(Stage::Upload));
}

#[tokio::test]
async fn test_cancel_during_upload_leaves_nothing_behind() {
    let cancel = CancellationToken::new();
    let harness = Harness::builder().remote().cancel_token(cancel.clone()).build();
    let bucket = harness.bucket.clone().unwrap();
    bucket
        .stall_puts_ending_with(".sql.gz", Duration::from_secs(30))
        .await;

    let ctx = harness.ctx.clone();
    let run = tokio::spawn(async move {
        BackupOrchestrator::new(ctx.clone())
            .create_backup(ArtifactKind::Full, &ctx.config.target)
            .await
    });

    // Wait for the structured dump and its sidecar to land remotely
    tokio::time::timeout(Duration::from_secs(5), async {
        while !bucket.keys().await.iter().any(|k| k.ends_with(".dump.sha256")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first artifact uploaded");
    cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancellation is prompt")
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, VaultError::Cancelled(Stage::Upload)));
    assert!(bucket.keys().await.is_empty(), "left in bucket: {:?}", bucket.keys().await);
    assert!(harness.files().is_empty(), "left behind: {:?}", harness.files());
}

#[tokio::test]
async fn test_verify_remote_copy_after_local_loss() {
    let harness = Harness::builder().remote().build();
    let orchestrator = BackupOrchestrator::new(harness.ctx.clone());

    let set = orchestrator
        .create_backup(ArtifactKind::Full, &harness.ctx.config.target)
        .await
        .expect("backup");
    let name = set.primary().file_name();
    harness
        .ctx
        .store
        .delete(set.primary().local_path.as_ref().unwrap())
        .await
        .unwrap();

    let (found, outcome) = orchestrator.verify(&name).await.expect("verify remote");
    assert_eq!(found.file_name(), name);
    assert_eq!(
        outcome,
        VerifyOutcome::Verified {
            digest: set.primary().checksum.clone().unwrap()
        }
    );
}

#[tokio::test]
async fn test_verify_detects_local_tampering() {
    let harness = Harness::local();
    let orchestrator = BackupOrchestrator::new(harness.ctx.clone());

    let set = orchestrator
        .create_backup(ArtifactKind::Full, &harness.ctx.config.target)
        .await
        .expect("backup");
    let path = set.primary().local_path.clone().unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    let err = orchestrator.verify(&set.primary().file_name()).await.unwrap_err();
    assert!(matches!(err, VaultError::Integrity(_)));
}

#[tokio::test]
async fn test_verify_unknown_artifact_is_not_found() {
    let harness = Harness::local();

    let err = BackupOrchestrator::new(harness.ctx.clone())
        .verify("full_20200101T000000.000Z.dump")
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::NotFound(_)));
}
