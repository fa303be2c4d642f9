//! Restart durability of the directory-backed log and the offset file

use std::sync::Arc;

use archivum_repl::{
    BackupLog, CategoryRegistry, FileOffsetStore, FsBackupLog, InMemoryPrimaryStore, InMemorySearchIndex,
    LogAction, OffsetStore, PrimaryStore, ReconConfig, ReconstructionRequestItem, ReconstructionService,
    SearchIndex, Status,
};
use bytes::Bytes;
use serde_json::json;

use crate::harness::{recon_config, TestEnv};

/// Service over the on-disk log and offsets, writing into `primary`.
fn service_on_disk(env: &TestEnv, config: &ReconConfig, primary: Arc<InMemoryPrimaryStore>) -> ReconstructionService {
    let registry = CategoryRegistry::build(
        &config.collections,
        primary as Arc<dyn PrimaryStore>,
        Arc::new(InMemorySearchIndex::new()) as Arc<dyn SearchIndex>,
    )
    .unwrap();
    let offsets = FileOffsetStore::open(env.offset_file()).unwrap();
    ReconstructionService::new(
        config,
        Arc::new(registry),
        Arc::new(FsBackupLog::new(env.backup_root())) as Arc<dyn BackupLog>,
        Arc::new(offsets) as Arc<dyn OffsetStore>,
    )
}

async fn append_units(env: &TestEnv, ids: &[&str]) {
    let log = FsBackupLog::new(env.backup_root());
    for id in ids {
        let body = json!({"_id": id, "title": format!("title of {}", id)});
        log.append(0, "UNIT", &format!("{}.json", id), LogAction::Write, Bytes::from(body.to_string()))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_resume_from_persisted_offset_after_restart() {
    let env = TestEnv::new("resume").unwrap();
    let config = recon_config(1000);
    append_units(&env, &["u1", "u2", "u3"]).await;

    let first_primary = Arc::new(InMemoryPrimaryStore::new());
    let first = service_on_disk(&env, &config, first_primary.clone());
    let out = first.reconstruct(&[ReconstructionRequestItem::new("UNIT", 0, 2)]).await;
    assert_eq!(out[0].offset, 2);
    drop(first);

    let reopened = FileOffsetStore::open(env.offset_file()).unwrap();
    assert_eq!(reopened.find_offset(0, "UNIT").await.unwrap(), 2);

    let second_primary = Arc::new(InMemoryPrimaryStore::new());
    let second = service_on_disk(&env, &config, second_primary.clone());
    let out = second.reconstruct(&[ReconstructionRequestItem::new("UNIT", 0, 10)]).await;
    assert_eq!(out[0].status, Status::Ok);
    assert_eq!(out[0].offset, 3);

    assert_eq!(first_primary.documents("Unit").len(), 2);
    let resumed = second_primary.documents("Unit");
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0]["_id"], json!("u3"));
}

#[tokio::test]
async fn test_entries_appended_after_restart_are_picked_up() {
    let env = TestEnv::new("append-after-restart").unwrap();
    let config = recon_config(2);
    append_units(&env, &["u1"]).await;

    let primary = Arc::new(InMemoryPrimaryStore::new());
    let service = service_on_disk(&env, &config, primary.clone());
    let out = service.reconstruct(&[ReconstructionRequestItem::new("UNIT", 0, 10)]).await;
    assert_eq!(out[0].offset, 1);
    drop(service);

    append_units(&env, &["u2", "u3", "u4"]).await;
    let service = service_on_disk(&env, &config, primary.clone());
    let out = service.reconstruct(&[ReconstructionRequestItem::new("UNIT", 0, 10)]).await;
    assert_eq!(out[0].status, Status::Ok);
    assert_eq!(out[0].offset, 4);
    assert_eq!(primary.documents("Unit").len(), 4);
}

#[tokio::test]
async fn test_tampered_object_on_disk_is_rejected() {
    let env = TestEnv::new("tamper").unwrap();
    let config = recon_config(1000);
    append_units(&env, &["u1", "u2"]).await;

    let object = env.backup_root().join("0").join("UNIT").join("objects").join("u2.json");
    std::fs::write(&object, br#"{"_id":"u2","title":"forged"}"#).unwrap();

    let primary = Arc::new(InMemoryPrimaryStore::new());
    let service = service_on_disk(&env, &config, primary.clone());
    let out = service.reconstruct(&[ReconstructionRequestItem::new("UNIT", 0, 10)]).await;
    assert_eq!(out[0].status, Status::Ko);
    assert_eq!(out[0].offset, 0);
    assert!(primary.get("Unit", Some(0), "u2").is_none());
}
