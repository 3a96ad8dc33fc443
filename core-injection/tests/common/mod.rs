#![allow(dead_code)]

use bridge_traits::testing::MemoryDevice;
use bridge_traits::testing::MemorySecureStore;
use bridge_traits::{MediaKind, MediaRecord, RecordMetadata, SystemClock};
use bytes::Bytes;
use core_injection::{JobHandle, JobStatus, MediaInjectionPipeline, PlaylistSynchronizer};
use core_media::container::write_wav;
use core_media::{FormatConverter, PcmAudio};
use core_metadata::{MetadataProvider, MetadataResolver};
use core_pairing::credential::fixtures::credential_bytes;
use core_pairing::PairingSessionManager;
use core_runtime::backoff::BackoffPolicy;
use core_runtime::config::{InjectionConfig, MetadataApiConfig, SessionConfig};
use core_runtime::events::EventBus;
use std::sync::Arc;
use std::time::Duration;

pub const DEVICE: &str = "00008030-001A";
const RATE: u32 = 8_000;

pub struct Harness {
    pub device: Arc<MemoryDevice>,
    pub bus: EventBus,
    pub manager: Arc<PairingSessionManager>,
    pub converter: Arc<FormatConverter>,
    pub pipeline: Arc<MediaInjectionPipeline>,
    pub synchronizer: Arc<PlaylistSynchronizer>,
}

pub fn injection_config() -> InjectionConfig {
    InjectionConfig {
        max_workers: 2,
        commit_attempts: 3,
        commit_backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 0.0),
        ringtone_max_duration: Duration::from_secs(40),
    }
}

/// Fast heartbeat so probes actually interleave with commits in tests.
pub fn session_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_millis(20),
        miss_threshold: 3,
        open_timeout: Duration::from_secs(2),
        probe_timeout: Duration::from_millis(500),
        reconnect_backoff: BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(1), 0.0),
    }
}

pub fn build(device: MemoryDevice, providers: Vec<Arc<dyn MetadataProvider>>) -> Harness {
    let device = Arc::new(device);
    let bus = EventBus::new(512);
    let manager = Arc::new(PairingSessionManager::new(
        Arc::new(MemorySecureStore::new()),
        device.clone(),
        bus.clone(),
        Arc::new(SystemClock),
        session_config(),
    ));
    let config = injection_config();
    let converter = Arc::new(FormatConverter::new(config.ringtone_max_duration));
    let resolver = Arc::new(MetadataResolver::new(
        providers,
        &MetadataApiConfig::default(),
        Arc::new(SystemClock),
    ));
    let pipeline = Arc::new(MediaInjectionPipeline::new(
        manager.clone(),
        converter.clone(),
        resolver,
        bus.clone(),
        &config,
    ));
    let synchronizer = Arc::new(PlaylistSynchronizer::new(
        manager.clone(),
        pipeline.clone(),
        bus.clone(),
    ));

    Harness {
        device,
        bus,
        manager,
        converter,
        pipeline,
        synchronizer,
    }
}

/// Harness with a paired device and an `Active` session.
pub async fn paired() -> Harness {
    let h = build(MemoryDevice::new(DEVICE), Vec::new());
    h.manager.import_credential(&credential_bytes(DEVICE)).await.unwrap();
    h.manager.open_session().await.unwrap();
    h
}

/// Harness with a stored credential but no open session.
pub async fn paired_offline() -> Harness {
    let h = build(MemoryDevice::new(DEVICE), Vec::new());
    h.manager.import_credential(&credential_bytes(DEVICE)).await.unwrap();
    h
}

/// Mono 8 kHz WAV; `seed` varies the waveform so payloads differ.
pub fn tone(seconds: u32, seed: usize) -> Bytes {
    let frames = (RATE * seconds) as usize;
    let samples = (0..frames)
        .map(|i| ((i * (31 + seed)) % 1_800) as i16 - 900)
        .collect();
    Bytes::from(write_wav(&PcmAudio::new(RATE, 1, samples)).unwrap())
}

/// Fingerprint the pipeline will assign to `payload` as a song.
pub fn song_fingerprint(h: &Harness, payload: &Bytes) -> String {
    h.converter
        .convert_blocking(payload, Some("tone.wav"), MediaKind::Song)
        .unwrap()
        .fingerprint
}

pub fn seeded_record(fingerprint: &str) -> MediaRecord {
    MediaRecord {
        fingerprint: fingerprint.to_string(),
        kind: MediaKind::Song,
        metadata: RecordMetadata {
            title: fingerprint.to_uppercase(),
            ..RecordMetadata::default()
        },
        locator: format!("Media/Music/{}.wav", fingerprint),
        duration_ms: 1_000,
    }
}

pub fn members(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Poll until the job reaches `status` or give up after two seconds.
pub async fn wait_for_status(h: &Harness, handle: &JobHandle, status: JobStatus) {
    for _ in 0..200 {
        if h.pipeline.status(handle).await == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never reached {}", status);
}
