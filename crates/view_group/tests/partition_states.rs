//! Partition-state updates: validation, role algebra end to end, pending
//! transitions, and the waiters they block.

mod common;

use common::{disk_file_bytes, open, open_with, read_disk_header, wait_until};
use view_group::group::GroupType;
use view_group::{Error, Stale};

#[tokio::test]
async fn validation_rejects_intersections_then_bounds() {
    let group = open("validation-order");
    group
        .handle
        .define_view(8, vec![0, 1], vec![], false)
        .await
        .unwrap();

    assert_eq!(
        group.handle.set_state(vec![0], vec![0], vec![]).await,
        Err(Error::IntersectingLists)
    );
    assert_eq!(
        group.handle.set_state(vec![2], vec![], vec![2]).await,
        Err(Error::IntersectingLists)
    );
    assert_eq!(
        group.handle.set_state(vec![], vec![3], vec![3]).await,
        Err(Error::IntersectingLists)
    );
    assert_eq!(
        group.handle.set_state(vec![9], vec![], vec![]).await,
        Err(Error::InvalidPartitionList)
    );
    // A request that is both intersecting and out of range reports the
    // intersection: disjointness is checked first.
    assert_eq!(
        group.handle.set_state(vec![9], vec![9], vec![]).await,
        Err(Error::IntersectingLists)
    );
    // Define-time validation follows the same order.
    let other = open("validation-order-define");
    assert_eq!(
        other.handle.define_view(4, vec![1], vec![1], false).await,
        Err(Error::IntersectingLists)
    );
    assert_eq!(
        other.handle.define_view(4, vec![4], vec![], false).await,
        Err(Error::InvalidPartitionList)
    );
    assert_eq!(
        other.handle.define_view(0, vec![], vec![], false).await,
        Err(Error::InvalidPartitionList)
    );
}

#[tokio::test]
async fn empty_triple_is_accepted_before_validation() {
    let group = open("empty-triple");
    group
        .handle
        .define_view(4, vec![0], vec![], false)
        .await
        .unwrap();
    assert_eq!(
        group.handle.set_state(vec![], vec![], vec![]).await,
        Ok(())
    );
}

#[tokio::test]
async fn noop_set_state_leaves_header_bytes_untouched() {
    let group = open("noop-set-state");
    group
        .handle
        .define_view(8, vec![0, 1, 2], vec![4], false)
        .await
        .unwrap();
    let before = disk_file_bytes(&group.config, GroupType::Main);
    group
        .handle
        .set_state(vec![0, 2], vec![4], vec![])
        .await
        .unwrap();
    assert_eq!(disk_file_bytes(&group.config, GroupType::Main), before);
}

#[tokio::test]
async fn set_state_moves_partitions_between_roles() {
    let group = open_with("role-moves", |cfg| cfg.auto_cleanup = false);
    group
        .handle
        .define_view(8, vec![0, 1], vec![], false)
        .await
        .unwrap();
    group
        .handle
        .set_state(vec![2], vec![3], vec![0])
        .await
        .unwrap();

    let info = group.handle.request_group_info().await.unwrap();
    assert_eq!(info.active_partitions, vec![1, 2]);
    assert_eq!(info.passive_partitions, vec![3]);
    assert_eq!(info.cleanup_partitions, vec![0]);
    let seq_keys: Vec<u16> = info.seqs.keys().copied().collect();
    assert_eq!(seq_keys, vec![1, 2, 3]);
    let purge_keys: Vec<u16> = info.purge_seqs.keys().copied().collect();
    assert_eq!(purge_keys, seq_keys);

    // Passive → active preserves the indexed sequence.
    group.db.push(3, "doc", "x");
    group
        .handle
        .request_group(vec![1, 2], Stale::False)
        .await
        .unwrap();
    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move {
                let info = handle.request_group_info().await.unwrap();
                info.seqs.get(&3) == Some(&1) && !info.updater_running
            }
        })
        .await,
        "passive partition never caught up"
    );
    group.handle.set_state(vec![3], vec![], vec![]).await.unwrap();
    let info = group.handle.request_group_info().await.unwrap();
    assert_eq!(info.seqs.get(&3), Some(&1));
    assert_eq!(info.active_partitions, vec![1, 2, 3]);
}

#[tokio::test]
async fn cleanup_purges_rows_and_clears_the_mask() {
    let group = open("cleanup-purge");
    group
        .handle
        .define_view(4, vec![0, 1], vec![], false)
        .await
        .unwrap();
    for i in 0..6 {
        group.db.push(0, &format!("a{i}"), "x");
        group.db.push(1, &format!("b{i}"), "y");
    }
    group
        .handle
        .request_group(vec![0, 1], Stale::False)
        .await
        .unwrap();

    group.handle.set_state(vec![], vec![], vec![1]).await.unwrap();
    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move {
                let info = handle.request_group_info().await.unwrap();
                info.cleanup_partitions.is_empty() && info.stats.cleanups >= 1
            }
        })
        .await,
        "cleaner never drained the cleanup mask"
    );

    let snapshot = group.handle.request_group(vec![0], Stale::Ok).await.unwrap();
    assert_eq!(snapshot.id_tree.partition_entries(0).count(), 6);
    assert_eq!(snapshot.id_tree.partition_entries(1).count(), 0);
    assert!(snapshot.views.iter().all(|v| v.partition_entries(1).count() == 0));
    let (_, header) = read_disk_header(&group.config, GroupType::Main);
    assert!(header.roles.cbitmask.is_empty());
    assert!(!header.roles.seqs.contains_key(&1));
}

#[tokio::test]
async fn all_partitions_can_enter_cleanup_at_once() {
    let group = open("cleanup-everything");
    group
        .handle
        .define_view(4, vec![0, 1], vec![2], false)
        .await
        .unwrap();
    group
        .handle
        .set_state(vec![], vec![], vec![0, 1, 2])
        .await
        .unwrap();
    let info = group.handle.request_group_info().await.unwrap();
    assert!(info.active_partitions.is_empty());
    assert!(info.passive_partitions.is_empty());
    assert!(info.seqs.is_empty());
    // An empty active set is legal; the updater simply has nothing to do.
    let snapshot = group
        .handle
        .request_group(vec![], Stale::UpdateAfter)
        .await
        .unwrap();
    assert!(snapshot.header.roles.owned().is_empty());
}

#[tokio::test]
async fn single_partition_group_works() {
    let group = open("one-partition");
    group
        .handle
        .define_view(1, vec![0], vec![], false)
        .await
        .unwrap();
    group.db.push(0, "only", "doc");
    let snapshot = group
        .handle
        .request_group(vec![0], Stale::False)
        .await
        .unwrap();
    assert_eq!(snapshot.header.roles.seqs.get(&0), Some(&1));
    assert_eq!(
        group.handle.set_state(vec![], vec![], vec![1]).await,
        Err(Error::InvalidPartitionList)
    );
}

#[tokio::test]
async fn blocked_role_change_parks_as_pending_transition() {
    let group = open_with("pending-transition", |cfg| cfg.auto_cleanup = false);
    group
        .handle
        .define_view(8, vec![0, 1, 2, 3], vec![4, 5], false)
        .await
        .unwrap();

    // Put partition 6 into cleanup: own it, then drop it.
    group.handle.set_state(vec![6], vec![], vec![]).await.unwrap();
    group.handle.set_state(vec![], vec![], vec![6]).await.unwrap();

    // Re-activating 6 while it drains must go pending; 4 rides along.
    group
        .handle
        .set_state(vec![6], vec![], vec![4])
        .await
        .unwrap();

    let info = group.handle.request_group_info().await.unwrap();
    let pending = info.pending_transition.expect("pending transition");
    assert_eq!(pending.active, vec![6]);
    assert!(pending.passive.is_empty());
    assert_eq!(pending.cleanup, vec![4]);
    // Bitmasks are untouched while the transition is pending.
    assert_eq!(info.active_partitions, vec![0, 1, 2, 3]);
    assert_eq!(info.passive_partitions, vec![4, 5]);
    assert_eq!(info.cleanup_partitions, vec![6]);

    // The pending record is durable.
    let (_, header) = read_disk_header(&group.config, GroupType::Main);
    assert_eq!(header.pending_transition.unwrap().active, vec![6]);

    // Once the cleaner drains partition 6, the transition applies.
    group.handle.trigger_cleanup().await.unwrap();
    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move {
                let info = handle.request_group_info().await.unwrap();
                info.pending_transition.is_none()
                    && info.active_partitions == vec![0, 1, 2, 3, 6]
            }
        })
        .await,
        "pending transition never applied"
    );
    let info = group.handle.request_group_info().await.unwrap();
    assert_eq!(info.passive_partitions, vec![5]);
    assert_eq!(info.cleanup_partitions, vec![4]);
    assert_eq!(info.seqs.get(&6), Some(&0));
    assert!(!info.seqs.contains_key(&4));
}

#[tokio::test]
async fn new_role_requests_merge_into_an_existing_pending_transition() {
    let group = open_with("pending-merge", |cfg| cfg.auto_cleanup = false);
    group
        .handle
        .define_view(8, vec![0], vec![], false)
        .await
        .unwrap();
    group.handle.set_state(vec![6], vec![], vec![]).await.unwrap();
    group.handle.set_state(vec![], vec![], vec![6]).await.unwrap();
    group
        .handle
        .set_state(vec![6], vec![], vec![4])
        .await
        .unwrap();

    // The same partition demoted to passive moves sides inside the
    // pending record.
    group.handle.set_state(vec![], vec![6], vec![]).await.unwrap();
    let info = group.handle.request_group_info().await.unwrap();
    let pending = info.pending_transition.expect("pending transition");
    assert!(pending.active.is_empty());
    assert_eq!(pending.passive, vec![6]);
    assert_eq!(pending.cleanup, vec![4]);
}

#[tokio::test]
async fn waiter_blocked_by_pending_transition_is_released_when_it_applies() {
    let group = open_with("pending-waiter", |cfg| cfg.auto_cleanup = false);
    group
        .handle
        .define_view(8, vec![0, 1, 2, 3], vec![], false)
        .await
        .unwrap();

    // Manufacture a pending transition with active=[7].
    group.handle.set_state(vec![], vec![], vec![7]).await.unwrap();
    group.handle.set_state(vec![7], vec![], vec![]).await.unwrap();
    let info = group.handle.request_group_info().await.unwrap();
    assert_eq!(
        info.pending_transition.as_ref().map(|p| p.active.clone()),
        Some(vec![7])
    );

    // A request wanting [3, 7] with stale=false parks on the transition,
    // without starting an updater.
    let handle = group.handle.clone();
    let request = tokio::spawn(async move {
        handle.request_group(vec![3, 7], Stale::False).await
    });
    let handle = group.handle.clone();
    assert!(
        wait_until(|| {
            let handle = handle.clone();
            async move {
                let info = handle.request_group_info().await.unwrap();
                info.waiting_clients == 1 && !info.updater_running
            }
        })
        .await,
        "request should be parked on the pending transition"
    );

    // Cleanup drains partition 7, the transition applies, the waiter is
    // re-evaluated into the freshness queue and served by the updater.
    group.handle.trigger_cleanup().await.unwrap();
    let snapshot = request.await.unwrap().unwrap();
    assert!(snapshot.header.roles.abitmask.contains(7));
    assert_eq!(snapshot.header.pending_transition, None);
}

#[tokio::test]
async fn requests_not_touching_the_pending_sides_proceed() {
    let group = open_with("pending-bypass", |cfg| cfg.auto_cleanup = false);
    group
        .handle
        .define_view(8, vec![0, 1], vec![], false)
        .await
        .unwrap();
    group.handle.set_state(vec![], vec![], vec![7]).await.unwrap();
    group.handle.set_state(vec![7], vec![], vec![]).await.unwrap();

    // Wanted partitions outside the pending sides are served normally.
    let snapshot = group.handle.request_group(vec![0], Stale::Ok).await.unwrap();
    assert!(snapshot.header.pending_transition.is_some());
}
