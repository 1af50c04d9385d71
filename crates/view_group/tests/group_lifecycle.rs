//! Group lifecycle: definition, snapshot freshness, info, durability
//! across reopen, and terminal exits.

mod common;

use common::{disk_file_bytes, open, read_disk_header, wait_until};
use view_group::group::GroupType;
use view_group::{Error, Stale};

#[tokio::test]
async fn undefined_group_refuses_work() {
    let group = open("undefined");
    assert!(!group.handle.is_view_defined().await.unwrap());
    assert_eq!(
        group.handle.set_state(vec![0], vec![], vec![]).await,
        Err(Error::ViewUndefined)
    );
    assert!(matches!(
        group.handle.request_group(vec![0], Stale::Ok).await,
        Err(Error::ViewUndefined)
    ));
    assert_eq!(group.handle.get_data_size().await, Err(Error::ViewUndefined));
    assert_eq!(
        group.handle.start_compact().await,
        Err(Error::ViewUndefined)
    );
}

#[tokio::test]
async fn define_commits_a_durable_header() {
    let group = open("define-durable");
    group
        .handle
        .define_view(8, vec![0, 1, 2, 3], vec![4, 5], true)
        .await
        .unwrap();
    assert!(group.handle.is_view_defined().await.unwrap());

    let (sig, header) = read_disk_header(&group.config, GroupType::Main);
    assert_eq!(sig, group.config.signature);
    assert_eq!(header.num_partitions, Some(8));
    assert_eq!(header.roles.abitmask.to_partitions(), vec![0, 1, 2, 3]);
    assert_eq!(header.roles.pbitmask.to_partitions(), vec![4, 5]);
    assert!(header.roles.cbitmask.is_empty());
    let seq_keys: Vec<u16> = header.roles.seqs.keys().copied().collect();
    assert_eq!(seq_keys, vec![0, 1, 2, 3, 4, 5]);
    assert!(header.roles.seqs.values().all(|seq| *seq == 0));
    assert!(header.has_replica);
    assert!(header.replicas_on_transfer.is_empty());
    assert!(header.pending_transition.is_none());

    // The replica group is defined alongside, with the same partition
    // count and no owned partitions.
    let (_, replica_header) = read_disk_header(&group.config, GroupType::Replica);
    assert_eq!(replica_header.num_partitions, Some(8));
    assert!(replica_header.roles.abitmask.is_empty());
    assert!(replica_header.roles.pbitmask.is_empty());
}

#[tokio::test]
async fn redefining_returns_already_defined_and_keeps_header() {
    let group = open("define-twice");
    group
        .handle
        .define_view(4, vec![0], vec![], false)
        .await
        .unwrap();
    let before = disk_file_bytes(&group.config, GroupType::Main);
    assert_eq!(
        group.handle.define_view(8, vec![1], vec![2], true).await,
        Err(Error::ViewAlreadyDefined)
    );
    assert_eq!(disk_file_bytes(&group.config, GroupType::Main), before);
}

#[tokio::test]
async fn stale_ok_replies_from_the_current_snapshot() {
    let group = open("stale-ok");
    group
        .handle
        .define_view(4, vec![0, 1], vec![], false)
        .await
        .unwrap();
    group.db.push(0, "doc-a", "1");

    let snapshot = group.handle.request_group(vec![0], Stale::Ok).await.unwrap();
    // Nothing indexed yet; the snapshot reflects the unindexed state.
    assert_eq!(snapshot.header.roles.seqs.get(&0), Some(&0));
    assert!(snapshot.id_tree.is_empty());
}

#[tokio::test]
async fn stale_update_after_kicks_the_updater() {
    let group = open("stale-update-after");
    group
        .handle
        .define_view(4, vec![0], vec![], false)
        .await
        .unwrap();
    group.db.push(0, "doc-a", "1");
    group.db.push(0, "doc-b", "2");

    let snapshot = group
        .handle
        .request_group(vec![0], Stale::UpdateAfter)
        .await
        .unwrap();
    assert_eq!(snapshot.header.roles.seqs.get(&0), Some(&0));

    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move {
                let info = handle.request_group_info().await.unwrap();
                info.seqs.get(&0) == Some(&2)
            }
        })
        .await,
        "updater never caught up"
    );
}

#[tokio::test]
async fn stale_false_waits_for_a_fresh_snapshot() {
    let group = open("stale-false");
    group
        .handle
        .define_view(4, vec![0, 1], vec![2], false)
        .await
        .unwrap();
    for i in 0..5 {
        group.db.push(0, &format!("a{i}"), "x");
    }
    group.db.push(2, "passive-doc", "y");

    let snapshot = group
        .handle
        .request_group(vec![0, 1], Stale::False)
        .await
        .unwrap();
    assert_eq!(snapshot.header.roles.seqs.get(&0), Some(&5));
    assert_eq!(snapshot.id_tree.partition_entries(0).count(), 5);
    // Two identity views, same rows in each.
    assert_eq!(snapshot.views.len(), 2);
    assert_eq!(snapshot.views[0].partition_entries(0).count(), 5);

    // A full update also indexes the passive partition and hard-commits.
    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move {
                let info = handle.request_group_info().await.unwrap();
                info.seqs.get(&2) == Some(&1) && !info.updater_running
            }
        })
        .await
    );
    let (_, header) = read_disk_header(&group.config, GroupType::Main);
    assert_eq!(header.roles.seqs.get(&0), Some(&5));
}

#[tokio::test]
async fn document_updates_and_deletes_rewrite_view_rows() {
    let group = open("doc-updates");
    group
        .handle
        .define_view(2, vec![0], vec![], false)
        .await
        .unwrap();
    group.db.push(0, "doc", "v1");
    let snap = group
        .handle
        .request_group(vec![0], Stale::False)
        .await
        .unwrap();
    assert_eq!(snap.id_tree.len(), 1);

    group.db.push(0, "doc", "v2");
    let snap = group
        .handle
        .request_group(vec![0], Stale::False)
        .await
        .unwrap();
    // Same document re-mapped, not duplicated.
    assert_eq!(snap.views[0].partition_entries(0).count(), 1);

    group.db.push_delete(0, "doc");
    let snap = group
        .handle
        .request_group(vec![0], Stale::False)
        .await
        .unwrap();
    assert!(snap.id_tree.is_empty());
    assert_eq!(snap.views[0].partition_entries(0).count(), 0);
    assert_eq!(snap.header.roles.seqs.get(&0), Some(&3));
}

#[tokio::test]
async fn group_info_reports_the_expected_shape() {
    let group = open("info-shape");
    group
        .handle
        .define_view(8, vec![0, 1], vec![2], false)
        .await
        .unwrap();
    let info = group.handle.request_group_info().await.unwrap();
    assert_eq!(info.set_name, "testset");
    assert_eq!(info.name, "info-shape");
    assert_eq!(info.language, "javascript");
    assert_eq!(info.group_type, GroupType::Main);
    assert_eq!(info.num_partitions, Some(8));
    assert_eq!(info.active_partitions, vec![0, 1]);
    assert_eq!(info.passive_partitions, vec![2]);
    assert!(info.cleanup_partitions.is_empty());
    assert!(info.pending_transition.is_none());
    assert!(info.replica_partitions.is_none());
    assert!(!info.compact_running);
    // Info renders to JSON for status surfaces.
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["group_type"], "main");
    assert_eq!(json["signature"], group.config.signature.to_hex());
}

#[tokio::test]
async fn updater_error_fails_parked_waiters() {
    let group = open("updater-error");
    group
        .handle
        .define_view(2, vec![0], vec![], false)
        .await
        .unwrap();
    group.db.push(0, "doc", "x");
    group.db.fail_changes_with("backend offline");

    let err = group
        .handle
        .request_group(vec![0], Stale::False)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UpdaterError(reason) if reason.contains("backend offline")));

    // The group survives and recovers once the feed does.
    group.db.clear_failure();
    let snapshot = group
        .handle
        .request_group(vec![0], Stale::False)
        .await
        .unwrap();
    assert_eq!(snapshot.header.roles.seqs.get(&0), Some(&1));
}

#[tokio::test]
async fn partition_deleted_only_shuts_down_owned_partitions() {
    let group = open("partition-deleted");
    group
        .handle
        .define_view(8, vec![0, 1], vec![], false)
        .await
        .unwrap();

    use view_group::DeletedOutcome;
    assert_eq!(
        group.handle.partition_deleted(Some(5)).await.unwrap(),
        DeletedOutcome::Ignore
    );
    assert!(group.handle.is_view_defined().await.unwrap());

    assert_eq!(
        group.handle.partition_deleted(Some(1)).await.unwrap(),
        DeletedOutcome::Shutdown
    );
    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move { handle.is_view_defined().await.is_err() }
        })
        .await,
        "controller should terminate after losing an owned partition"
    );
}

#[tokio::test]
async fn master_deletion_shuts_down() {
    let group = open("master-deleted");
    group
        .handle
        .define_view(2, vec![0], vec![], false)
        .await
        .unwrap();
    assert_eq!(
        group.handle.partition_deleted(None).await.unwrap(),
        view_group::DeletedOutcome::Shutdown
    );
    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move { handle.set_state(vec![], vec![], vec![0]).await.is_err() }
        })
        .await
    );
}

#[tokio::test]
async fn signature_change_exits_normally_and_freezes_the_file() {
    let group = open("ddoc-change");
    group
        .handle
        .define_view(4, vec![0], vec![], false)
        .await
        .unwrap();

    // Same signature: nothing happens.
    group
        .handle
        .ddoc_updated(group.config.signature)
        .await
        .unwrap();
    assert!(group.handle.is_view_defined().await.unwrap());

    let bytes_before = disk_file_bytes(&group.config, GroupType::Main);
    group
        .handle
        .ddoc_updated(view_group::Signature::from_seed(b"something else"))
        .await
        .unwrap();

    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move { handle.request_group_info().await.is_err() }
        })
        .await
    );
    // No header rewrite on the way out, and the file is read-only.
    assert_eq!(disk_file_bytes(&group.config, GroupType::Main), bytes_before);
    let (path, _) = view_group::file::find_latest(
        &group.config.dir,
        GroupType::Main,
        &group.config.signature,
    )
    .unwrap()
    .unwrap();
    assert!(std::fs::metadata(path).unwrap().permissions().readonly());
}

#[tokio::test]
async fn dbset_death_terminates_with_reason() {
    let group = open("dbset-died");
    group
        .handle
        .define_view(2, vec![0], vec![], false)
        .await
        .unwrap();
    group.db.close_with("simulated crash");
    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move {
                matches!(
                    handle.request_group(vec![0], Stale::Ok).await,
                    Err(Error::DbSetDied(_)) | Err(Error::Shutdown(_))
                )
            }
        })
        .await
    );
}

#[tokio::test]
async fn shutdown_then_reopen_preserves_state() {
    let group = open("reopen");
    group
        .handle
        .define_view(4, vec![0, 1], vec![], false)
        .await
        .unwrap();
    for i in 0..4 {
        group.db.push(1, &format!("d{i}"), "x");
    }
    let snapshot = group
        .handle
        .request_group(vec![0, 1], Stale::False)
        .await
        .unwrap();
    assert_eq!(snapshot.header.roles.seqs.get(&1), Some(&4));
    group.handle.shutdown().await.unwrap();

    let reopened = group.reopen();
    assert!(reopened.is_view_defined().await.unwrap());
    let snapshot = reopened.request_group(vec![0, 1], Stale::Ok).await.unwrap();
    assert_eq!(snapshot.header.roles.seqs.get(&1), Some(&4));
    assert_eq!(snapshot.id_tree.partition_entries(1).count(), 4);
    reopened.shutdown().await.unwrap();
}

#[tokio::test]
async fn stats_track_updates_and_reset() {
    let group = open("stats");
    group
        .handle
        .define_view(2, vec![0], vec![], false)
        .await
        .unwrap();
    group.db.push(0, "d", "x");
    group
        .handle
        .request_group(vec![0], Stale::False)
        .await
        .unwrap();

    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move {
                let info = handle.request_group_info().await.unwrap();
                info.stats.full_updates >= 1 && !info.stats.update_history.is_empty()
            }
        })
        .await
    );

    group.handle.reset_stats().await.unwrap();
    let info = group.handle.request_group_info().await.unwrap();
    assert_eq!(info.stats.full_updates, 0);
    assert!(info.stats.update_history.is_empty());
}
