//! Property-based tests for replay: idempotence, monotonic offsets,
//! resumability, isolation and graph merges

use archivum_repl::document::Document;
use archivum_repl::graph::{initial_start, snapshot_name};
use archivum_repl::{BackupLog, GraphSnapshot, LogAction, ReconstructionRequestItem, Status};
use chrono::NaiveDateTime;
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio::runtime::Runtime;

use crate::harness::{doc, recon_config, ReconHarness, ADMIN_TENANT};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Log `titles.len()` unit writes for `tenant`, ids `u0`, `u1`, ... in every tenant.
async fn seed_units(h: &ReconHarness, tenant: u32, titles: &[String]) {
    for (i, title) in titles.iter().enumerate() {
        let id = format!("u{}", i);
        h.write(tenant, "UNIT", json!({"_id": id, "title": title})).await.unwrap();
    }
}

fn title_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,8}", 0..12)
}

proptest! {
    #[test]
    fn prop_rerun_without_new_entries_changes_nothing(titles in title_strategy()) {
        let rt = runtime();
        let (first, second, before, after) = rt.block_on(async {
            let h = ReconHarness::new().unwrap();
            seed_units(&h, 0, &titles).await;
            let first = h.run_one("UNIT", 0, 100).await.unwrap();
            let before = h.primary.documents("Unit");
            let second = h.run_one("UNIT", 0, 100).await.unwrap();
            (first, second, before, h.primary.documents("Unit"))
        });

        prop_assert_eq!(first.status, Status::Ok);
        prop_assert_eq!(second.status, Status::Ok);
        prop_assert_eq!(first.offset, titles.len() as u64);
        prop_assert_eq!(second.offset, first.offset);
        prop_assert_eq!(before, after);
    }

    #[test]
    fn prop_offset_advances_to_last_applied(
        titles in title_strategy(),
        limits in prop::collection::vec(1u32..5, 1..8),
    ) {
        let rt = runtime();
        let offsets = rt.block_on(async {
            let h = ReconHarness::with_config(recon_config(3)).unwrap();
            seed_units(&h, 0, &titles).await;
            let mut offsets = Vec::new();
            for limit in &limits {
                offsets.push(h.run_one("UNIT", 0, *limit).await.unwrap().offset);
            }
            offsets
        });

        let total = titles.len() as u64;
        let mut prior = 0u64;
        for (offset, limit) in offsets.iter().zip(&limits) {
            prop_assert!(*offset >= prior);
            prop_assert_eq!(*offset, (prior + u64::from(*limit)).min(total));
            prior = *offset;
        }
    }

    #[test]
    fn prop_small_batches_reach_the_same_state(
        titles in title_strategy(),
        deletes in prop::collection::vec(any::<bool>(), 12),
        limit in 1u32..4,
    ) {
        let rt = runtime();
        let (stepped, single, stepped_offset, single_offset) = rt.block_on(async {
            let stepped = ReconHarness::with_config(recon_config(2)).unwrap();
            let single = ReconHarness::new().unwrap();
            for h in [&stepped, &single] {
                seed_units(h, 0, &titles).await;
                for (i, delete) in deletes.iter().take(titles.len()).enumerate() {
                    if *delete {
                        h.delete(0, "UNIT", &format!("u{}", i)).await.unwrap();
                    }
                }
            }

            let tip = stepped.log.len(0, "UNIT") as u64;
            let mut offset = 0;
            let mut rounds = 0;
            while offset < tip && rounds < 64 {
                offset = stepped.run_one("UNIT", 0, limit).await.unwrap().offset;
                rounds += 1;
            }
            let single_offset = single.run_one("UNIT", 0, 1000).await.unwrap().offset;
            (
                stepped.primary.documents("Unit"),
                single.primary.documents("Unit"),
                offset,
                single_offset,
            )
        });

        prop_assert_eq!(stepped_offset, single_offset);
        prop_assert_eq!(stepped, single);
    }

    #[test]
    fn prop_failed_item_leaves_sibling_untouched(
        good in prop::collection::vec("[a-z]{1,8}", 1..8),
        bad in prop::collection::vec("[a-z]{1,8}", 1..8),
        corrupt_at in 0usize..8,
    ) {
        let rt = runtime();
        let (out, good_docs, bad_offset) = rt.block_on(async {
            let h = ReconHarness::new().unwrap();
            seed_units(&h, 2, &good).await;
            seed_units(&h, 3, &bad).await;
            let victim = format!("u{}.json", corrupt_at % bad.len());
            h.log.overwrite_object(3, "UNIT", &victim, bytes::Bytes::from_static(b"[]"));

            let out = h
                .run(&[
                    ReconstructionRequestItem::new("UNIT", 3, 100),
                    ReconstructionRequestItem::new("UNIT", 2, 100),
                ])
                .await;
            let good_docs: Vec<Document> = h.primary.tenant_documents("Unit", 2);
            (out, good_docs, h.offset(3, "UNIT").await.unwrap())
        });

        prop_assert_eq!(out[0].status, Status::Ko);
        prop_assert_eq!(bad_offset, 0);
        prop_assert_eq!(out[1].status, Status::Ok);
        prop_assert_eq!(out[1].offset, good.len() as u64);
        prop_assert_eq!(good_docs.len(), good.len());
        for (i, stored) in good_docs.iter().enumerate() {
            prop_assert_eq!(&stored["title"], &json!(good[i]));
        }
    }

    #[test]
    fn prop_graph_snapshot_only_touches_graph_fields(
        title in "[a-z]{1,8}",
        old_up in prop::collection::vec("[a-z]{1,4}", 0..4),
        new_up in prop::collection::vec("[a-z]{1,4}", 0..4),
        new_us in prop::collection::vec("[a-z]{1,4}", 0..4),
        snapshot_title in "[A-Z]{1,8}",
    ) {
        let rt = runtime();
        let (status, stored) = rt.block_on(async {
            let h = ReconHarness::new().unwrap();
            h.primary.seed(
                "Unit",
                doc(json!({"_id": "u1", "_tenant": 0, "title": title, "_up": old_up, "_v": 4})),
            );

            let end = NaiveDateTime::parse_from_str("2024-05-01 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
            let snapshot = GraphSnapshot {
                collection: "Unit".to_string(),
                window_start: "1970-01-01T00:00:00.000".to_string(),
                window_end: "2024-05-01T12:00:00.000".to_string(),
                batches: vec![vec![doc(json!({
                    "_id": "u1",
                    "_tenant": 0,
                    "_up": new_up,
                    "_us": new_us,
                    "_glpd": "2024-05-01T11:00:00.000",
                    "title": snapshot_title,
                }))]],
            };
            h.log
                .append(
                    ADMIN_TENANT,
                    "UNIT_GRAPH",
                    &snapshot_name(initial_start(), end),
                    LogAction::Write,
                    snapshot.encode().unwrap(),
                )
                .await
                .unwrap();

            let item = h.run_one("UNIT_GRAPH", 0, 10).await.unwrap();
            (item.status, h.unit(0, "u1").unwrap())
        });

        prop_assert_eq!(status, Status::Ok);
        prop_assert_eq!(&stored["title"], &Value::from(title));
        prop_assert_eq!(&stored["_v"], &json!(4));
        prop_assert_eq!(&stored["_tenant"], &json!(0));
        prop_assert_eq!(&stored["_up"], &json!(new_up));
        prop_assert_eq!(&stored["_us"], &json!(new_us));
        prop_assert_eq!(&stored["_glpd"], &json!("2024-05-01T11:00:00.000"));
    }
}
