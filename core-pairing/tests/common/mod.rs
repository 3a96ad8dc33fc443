#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::testing::{MemoryDevice, MemorySecureStore};
use bridge_traits::SystemClock;
use core_pairing::PairingSessionManager;
use core_runtime::backoff::BackoffPolicy;
use core_runtime::config::SessionConfig;
use core_runtime::events::{CoreEvent, EventBus, SessionEvent};
use std::sync::Arc;
use std::time::Duration;

fn pem(label: &str, seed: &str) -> String {
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        STANDARD.encode(format!("{label}-{seed}-der"))
    )
}

pub fn credential_bytes(device_id: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "device_id": device_id,
        "host_id": "HOST-1",
        "system_buid": "BUID-1",
        "device_certificate": pem("CERTIFICATE", "device"),
        "host_certificate": pem("CERTIFICATE", "host"),
        "root_certificate": pem("CERTIFICATE", "root"),
        "host_private_key": pem("PRIVATE KEY", "host"),
    }))
    .unwrap()
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_secs(5),
        miss_threshold: 3,
        open_timeout: Duration::from_secs(10),
        probe_timeout: Duration::from_secs(3),
        reconnect_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 0.0),
    }
}

pub struct Harness {
    pub device: Arc<MemoryDevice>,
    pub store: Arc<MemorySecureStore>,
    pub bus: EventBus,
    pub manager: Arc<PairingSessionManager>,
}

pub fn harness(device_id: &str) -> Harness {
    let device = Arc::new(MemoryDevice::new(device_id));
    let store = Arc::new(MemorySecureStore::new());
    let bus = EventBus::new(256);
    let manager = Arc::new(PairingSessionManager::new(
        store.clone(),
        device.clone(),
        bus.clone(),
        Arc::new(SystemClock),
        session_config(),
    ));
    Harness {
        device,
        store,
        bus,
        manager,
    }
}

/// Drain every session event currently buffered in `rx`.
pub fn session_events(rx: &mut tokio::sync::broadcast::Receiver<CoreEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CoreEvent::Session(event) = event {
            events.push(event);
        }
    }
    events
}

/// `(from, to)` pairs of every state change in `events`.
pub fn transitions(events: &[SessionEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged { from, to, .. } => Some((from.clone(), to.clone())),
            _ => None,
        })
        .collect()
}
