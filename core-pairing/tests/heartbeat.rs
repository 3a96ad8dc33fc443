mod common;

use bridge_traits::error::TransportError;
use common::{credential_bytes, harness, session_events, transitions, Harness};
use core_pairing::{HeartbeatMonitor, SessionState};
use core_runtime::events::SessionEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

async fn paired_and_monitored(device_id: &str) -> (Harness, Arc<HeartbeatMonitor>) {
    let h = harness(device_id);
    h.manager
        .import_credential(&credential_bytes(device_id))
        .await
        .unwrap();
    h.manager.open_session().await.unwrap();

    let monitor = Arc::new(HeartbeatMonitor::new(h.manager.clone()));
    monitor.start();
    (h, monitor)
}

#[tokio::test(start_paused = true)]
async fn probes_run_at_the_configured_interval() {
    let (h, monitor) = paired_and_monitored("D1").await;

    sleep(Duration::from_secs(16)).await;

    // One probe at open, then one per 5 s tick.
    assert_eq!(h.device.probe_count().await, 4);
    assert_eq!(h.manager.current_state(), SessionState::Active);
    monitor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn single_miss_degrades_then_recovers() {
    let (h, monitor) = paired_and_monitored("D1").await;
    h.device.fail_next_probes(1, TransportError::Timeout).await;

    sleep(Duration::from_secs(6)).await;
    assert_eq!(h.manager.current_state(), SessionState::Degraded);
    assert_eq!(h.manager.snapshot().consecutive_misses, 1);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.manager.current_state(), SessionState::Active);
    assert_eq!(h.manager.snapshot().consecutive_misses, 0);
    assert!(h.manager.snapshot().status.contains("restored"));
    monitor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn slow_probe_counts_as_miss() {
    let (h, monitor) = paired_and_monitored("D1").await;
    h.device.set_probe_delay(Some(Duration::from_secs(4))).await;

    sleep(Duration::from_secs(9)).await;

    assert_eq!(h.manager.current_state(), SessionState::Degraded);
    monitor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn miss_threshold_disconnects_then_reconnects() {
    let (h, monitor) = paired_and_monitored("D1").await;
    let mut rx = h.bus.subscribe();
    h.device.fail_next_probes(3, TransportError::Timeout).await;

    // Misses at 5 s, 10 s and 15 s, reconnect after 1 s of backoff.
    sleep(Duration::from_secs(17)).await;

    assert_eq!(h.manager.current_state(), SessionState::Active);
    assert_eq!(h.device.opened_sessions().await, 2);

    let events = session_events(&mut rx);
    let misses: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::HeartbeatMissed {
                consecutive_misses, ..
            } => Some(*consecutive_misses),
            _ => None,
        })
        .collect();
    assert_eq!(misses, vec![1, 2, 3]);

    assert_eq!(
        transitions(&events),
        vec![
            ("active".to_string(), "degraded".to_string()),
            ("degraded".to_string(), "disconnected".to_string()),
            ("disconnected".to_string(), "connecting".to_string()),
            ("connecting".to_string(), "active".to_string()),
        ]
    );
    monitor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_exponentially() {
    let (h, monitor) = paired_and_monitored("D1").await;
    let mut rx = h.bus.subscribe();
    h.device.set_unreachable(true).await;

    // Lost at 15 s; attempts at 16 s, 18 s and 22 s all fail.
    sleep(Duration::from_secs(25)).await;
    assert_eq!(h.manager.current_state(), SessionState::Disconnected);

    h.device.set_unreachable(false).await;
    // Fourth attempt after 8 s more.
    sleep(Duration::from_secs(8)).await;
    assert_eq!(h.manager.current_state(), SessionState::Active);

    let delays: Vec<u64> = session_events(&mut rx)
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ReconnectScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000]);
    monitor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn device_closed_session_skips_miss_counting() {
    let (h, monitor) = paired_and_monitored("D1").await;
    let mut rx = h.bus.subscribe();
    h.device.drop_sessions().await;

    sleep(Duration::from_secs(7)).await;

    assert_eq!(h.manager.current_state(), SessionState::Active);
    assert_eq!(h.device.opened_sessions().await, 2);
    let events = session_events(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::HeartbeatMissed { .. })));
    monitor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn trust_rejection_stops_reconnect() {
    let (h, monitor) = paired_and_monitored("D1").await;
    h.device
        .fail_next_probes(1, TransportError::TrustRejected("pairing removed".into()))
        .await;

    sleep(Duration::from_secs(120)).await;

    assert_eq!(h.manager.current_state(), SessionState::TrustRejected);
    assert_eq!(h.device.opened_sessions().await, 1);
    monitor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn user_close_stops_supervision() {
    let (h, monitor) = paired_and_monitored("D1").await;

    h.manager.close_session("user request").await.unwrap();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(h.manager.current_state(), SessionState::Disconnected);
    assert_eq!(h.device.opened_sessions().await, 1);
    assert_eq!(h.device.probe_count().await, 1);

    // An explicit open is picked up by the running monitor.
    h.manager.open_session().await.unwrap();
    sleep(Duration::from_secs(6)).await;
    assert_eq!(h.device.probe_count().await, 3);
    monitor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn probes_wait_for_commit_lock() {
    let (h, monitor) = paired_and_monitored("D1").await;
    let session = h.manager.current_session().await.unwrap();

    let guard = session.lock_commit().await;
    sleep(Duration::from_secs(12)).await;
    assert_eq!(h.device.probe_count().await, 1);
    assert_eq!(h.manager.current_state(), SessionState::Active);

    drop(guard);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.device.probe_count().await, 2);
    monitor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_probing() {
    let (h, monitor) = paired_and_monitored("D1").await;

    monitor.shutdown();
    assert!(!monitor.is_running());
    sleep(Duration::from_secs(30)).await;

    assert_eq!(h.device.probe_count().await, 1);
    assert_eq!(h.manager.current_state(), SessionState::Active);
}
