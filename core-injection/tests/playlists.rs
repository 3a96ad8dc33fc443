mod common;

use bridge_traits::error::TransportError;
use bridge_traits::PlaylistOperation;
use common::{members, paired, paired_offline, seeded_record, song_fingerprint, tone, Harness};
use core_injection::{InjectionError, InjectionRequest, PlaylistDefinition, SyncError};
use core_runtime::events::{CoreEvent, PlaylistEvent};
use std::time::Duration;

async fn library(items: &[&str]) -> Harness {
    let h = paired().await;
    for item in items {
        h.device.insert_record(seeded_record(item)).await;
    }
    h
}

#[tokio::test]
async fn reconcile_creates_playlist_in_order() {
    let h = library(&["a", "b", "c"]).await;

    let report = h
        .synchronizer
        .reconcile(PlaylistDefinition::new("Road Trip", members(&["c", "a", "b"]), 1))
        .await
        .unwrap();

    assert_eq!(report.operations.len(), 4);
    assert_eq!(report.operations[0], PlaylistOperation::Create);
    assert_eq!(h.device.playlist("Road Trip").await, Some(members(&["c", "a", "b"])));
}

#[tokio::test]
async fn second_reconcile_emits_zero_operations() {
    let h = library(&["a", "b"]).await;
    let definition = PlaylistDefinition::new("Focus", members(&["a", "b"]), 1);

    h.synchronizer.reconcile(definition.clone()).await.unwrap();
    let applied = h.device.applied_playlist_ops().await.len();
    let commits = h.device.commit_count().await;

    let report = h.synchronizer.reconcile(definition).await.unwrap();

    assert!(report.operations.is_empty());
    assert_eq!(h.device.applied_playlist_ops().await.len(), applied);
    assert_eq!(h.device.commit_count().await, commits);
}

#[tokio::test]
async fn reorder_and_removal_converge() {
    let h = library(&["a", "b", "c", "d"]).await;
    h.device
        .insert_playlist("Mix", members(&["d", "a", "b", "c"]))
        .await;

    let report = h
        .synchronizer
        .reconcile(PlaylistDefinition::new("Mix", members(&["a", "c", "b"]), 3))
        .await
        .unwrap();

    assert_eq!(h.device.playlist("Mix").await, Some(members(&["a", "c", "b"])));
    assert_eq!(
        report.operations[0],
        PlaylistOperation::Remove {
            fingerprint: "d".into()
        }
    );
    assert_eq!(report.operations.len(), 2);
}

#[tokio::test]
async fn stale_revision_is_rejected() {
    let h = library(&["a"]).await;
    h.synchronizer
        .reconcile(PlaylistDefinition::new("P", members(&["a"]), 5))
        .await
        .unwrap();

    let err = h
        .synchronizer
        .reconcile(PlaylistDefinition::new("P", Vec::new(), 4))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        SyncError::StaleDefinition {
            playlist: "P".into(),
            revision: 4,
            current: 5,
        }
    );
    assert_eq!(h.device.playlist("P").await, Some(members(&["a"])));
}

#[tokio::test]
async fn duplicate_members_are_invalid() {
    let h = library(&["a"]).await;

    let err = h
        .synchronizer
        .reconcile(PlaylistDefinition::new("P", members(&["a", "a"]), 1))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::InvalidDefinition(_)));
    assert_eq!(h.device.playlist("P").await, None);
}

#[tokio::test]
async fn rejected_commit_restores_previous_playlist() {
    let h = library(&["a", "b", "c"]).await;
    h.device.insert_playlist("Gym", members(&["a", "b", "c"])).await;
    let mut rx = h.bus.subscribe();
    h.device
        .fail_next_commits(1, TransportError::Rejected("playlist locked".into()))
        .await;

    let err = h
        .synchronizer
        .reconcile(PlaylistDefinition::new("Gym", members(&["c", "b"]), 1))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::DeviceRejectedOperation { .. }));
    assert_eq!(h.device.playlist("Gym").await, Some(members(&["a", "b", "c"])));

    let failed = std::iter::from_fn(|| rx.try_recv().ok()).any(|event| {
        matches!(
            event,
            CoreEvent::Playlist(PlaylistEvent::ReconcileFailed { ref playlist, .. }) if playlist == "Gym"
        )
    });
    assert!(failed);
}

#[tokio::test]
async fn missing_members_are_deferred_then_added_automatically() {
    let h = library(&["a"]).await;
    let listener = h.synchronizer.start();
    let payload = tone(1, 60);
    let pending_fp = song_fingerprint(&h, &payload);

    let err = h
        .synchronizer
        .reconcile(PlaylistDefinition::new(
            "Later",
            vec!["a".to_string(), pending_fp.clone()],
            1,
        ))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        SyncError::DependencyPending {
            playlist: "Later".into(),
            fingerprints: vec![pending_fp.clone()],
        }
    );
    assert!(err.is_pending());
    assert_eq!(h.device.playlist("Later").await, Some(members(&["a"])));
    assert_eq!(
        h.synchronizer.pending().await.get("Later"),
        Some(&vec![pending_fp.clone()])
    );

    let handle = h
        .pipeline
        .submit(InjectionRequest::song(payload, Some("tone.wav")))
        .await;
    assert_eq!(
        h.pipeline.wait(&handle).await.unwrap().fingerprint(),
        Some(pending_fp.as_str())
    );

    let expected = Some(vec!["a".to_string(), pending_fp]);
    let mut synced = false;
    for _ in 0..200 {
        if h.device.playlist("Later").await == expected {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(synced, "deferred member was never added");

    for _ in 0..200 {
        if h.synchronizer.pending().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.synchronizer.pending().await.is_empty());

    h.synchronizer.shutdown();
    listener.await.unwrap();
}

#[tokio::test]
async fn cancelled_deferral_is_not_retried() {
    let h = library(&["a"]).await;
    let listener = h.synchronizer.start();
    let payload = tone(1, 61);
    let pending_fp = song_fingerprint(&h, &payload);

    let err = h
        .synchronizer
        .reconcile(PlaylistDefinition::new(
            "Dropped",
            vec![pending_fp.clone()],
            1,
        ))
        .await
        .unwrap_err();
    assert!(err.is_pending());
    assert_eq!(h.device.playlist("Dropped").await, Some(Vec::new()));

    assert!(h.synchronizer.cancel_pending("Dropped").await);
    let handle = h
        .pipeline
        .submit(InjectionRequest::song(payload, Some("tone.wav")))
        .await;
    h.pipeline.wait(&handle).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.device.playlist("Dropped").await, Some(Vec::new()));
    h.synchronizer.shutdown();
    listener.await.unwrap();
}

#[tokio::test]
async fn shutdown_cancels_reconcile_waiting_for_a_session() {
    let h = paired_offline().await;

    let pending = {
        let synchronizer = h.synchronizer.clone();
        tokio::spawn(async move {
            synchronizer
                .reconcile(PlaylistDefinition::new("Later", members(&["a"]), 1))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    h.synchronizer.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result, Err(SyncError::Injection(InjectionError::Cancelled)));
    assert_eq!(h.device.playlist("Later").await, None);
}
