//! End-to-end run of the camera feature against the simulated camera and an
//! in-process realtime endpoint.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use live_camera::audio::device::{NullOutput, SilentInput};
use live_camera::camera::dummy::DummyBackend;
use live_camera::camera::types::CameraEye;
use live_camera::feature::{CameraFeature, CameraStatus, FeatureConfig};
use live_camera::preview::capture::CaptureConfig;
use live_camera::preview::surface::HeadlessSurface;
use live_camera::realtime::session::RealtimeConfig;
use live_camera::realtime::transport::{LoopbackConnector, LoopbackPeer};

struct Pipeline {
    backend: Arc<DummyBackend>,
    connector: Arc<LoopbackConnector>,
    peers: mpsc::UnboundedReceiver<LoopbackPeer>,
    output: NullOutput,
    surface: Arc<HeadlessSurface>,
    feature: CameraFeature,
}

fn pipeline() -> Pipeline {
    let backend = Arc::new(DummyBackend::new().with_manual_frames());
    let (connector, peers) = LoopbackConnector::pair();
    let output = NullOutput::new();
    let surface = HeadlessSurface::new("preview");
    let config = FeatureConfig {
        capture: CaptureConfig {
            eye: CameraEye::Right,
            target_timeout: Duration::from_secs(1),
            reader_grace: Duration::from_millis(10),
            ..CaptureConfig::default()
        },
        realtime: RealtimeConfig {
            url: "ws://127.0.0.1:9/live".to_string(),
            api_key: "test-key".to_string(),
            video_interval: Duration::ZERO,
            ..RealtimeConfig::default()
        },
        ..FeatureConfig::default()
    };
    let feature = CameraFeature::new(
        backend.clone(),
        connector.clone(),
        Arc::new(SilentInput),
        Arc::new(output.clone()),
        config,
    )
    .with_preview(surface.clone());

    Pipeline {
        backend,
        connector,
        peers,
        output,
        surface,
        feature,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Read client messages until one matches, skipping the rest.
async fn next_matching(peer: &mut LoopbackPeer, matches: impl Fn(&Value) -> bool) -> Option<Value> {
    for _ in 0..100 {
        let message = peer.next_json(Duration::from_millis(200)).await?;
        if matches(&message) {
            return Some(message);
        }
    }
    None
}

async fn start_scanning(p: &mut Pipeline) -> LoopbackPeer {
    p.feature.scan().await.unwrap();
    p.surface.set_available(true);
    p.feature.scan().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), p.peers.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn camera_frames_and_audio_flow_both_ways() {
    let mut p = pipeline();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    p.feature
        .on_status_changed(move |status| sink.lock().push(*status));

    let mut peer = start_scanning(&mut p).await;
    assert_eq!(p.feature.status(), CameraStatus::Scanning);
    assert_eq!(p.feature.endpoint().unwrap().id, DummyBackend::right_device_id());
    assert!(peer.url.as_str().starts_with("ws://127.0.0.1:9/live?key=test-key"));

    // Setup goes out first, before anything else is allowed through.
    let setup = peer.next_json(Duration::from_secs(1)).await.unwrap();
    assert_eq!(setup["setup"]["model"], "models/gemini-2.0-flash-exp");
    assert!(!p.feature.is_realtime_active());

    assert!(peer.complete_setup());
    assert!(wait_until(|| p.feature.is_realtime_active()).await);

    // Video: a raw YUV frame arrives upstream as JPEG.
    assert!(wait_until(|| p.backend.push_test_frame()).await);
    let video = next_matching(&mut peer, |m| m["realtimeInput"]["video"].is_object())
        .await
        .unwrap();
    assert_eq!(video["realtimeInput"]["video"]["mimeType"], "image/jpeg");
    let jpeg = STANDARD
        .decode(video["realtimeInput"]["video"]["data"].as_str().unwrap())
        .unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    // Microphone: setupComplete started the uplink.
    let audio = next_matching(&mut peer, |m| m["realtimeInput"]["audio"].is_object())
        .await
        .unwrap();
    assert_eq!(audio["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
    let pcm = STANDARD
        .decode(audio["realtimeInput"]["audio"]["data"].as_str().unwrap())
        .unwrap();
    assert_eq!(pcm.len(), 3200);

    // Speaker: model audio is decoded and played.
    let reply = STANDARD.encode([0u8; 960]);
    assert!(peer.send_text(format!(
        r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{reply}"}}}}]}}}}}}"#
    )));
    assert!(wait_until(|| p.output.bytes_written() == 960).await);

    p.feature.pause();
    assert_eq!(*statuses.lock(), [CameraStatus::Scanning, CameraStatus::Paused]);
    assert!(!p.feature.is_realtime_active());
    assert_eq!(p.connector.attempts(), 1);
}

#[tokio::test]
async fn camera_disconnect_pauses_the_feature() {
    let mut p = pipeline();
    let peer = start_scanning(&mut p).await;
    assert!(peer.complete_setup());
    assert!(wait_until(|| p.feature.is_realtime_active()).await);

    p.backend.simulate_disconnect();

    assert_eq!(p.feature.status(), CameraStatus::Paused);
    assert!(!p.feature.is_running());
    assert!(!p.feature.is_realtime_active());
    assert!(wait_until(|| p.backend.open_devices() == 0).await);

    // The next scan brings everything back with a new connection.
    p.feature.scan().await.unwrap();
    assert_eq!(p.feature.status(), CameraStatus::Scanning);
    let again = tokio::time::timeout(Duration::from_secs(2), p.peers.recv())
        .await
        .unwrap();
    assert!(again.is_some());
    assert_eq!(p.connector.attempts(), 2);
}

#[tokio::test]
async fn server_hangup_keeps_the_camera_running() {
    let mut p = pipeline();
    let mut peer = start_scanning(&mut p).await;
    assert!(peer.complete_setup());
    assert!(wait_until(|| p.feature.is_realtime_active()).await);

    assert!(peer.close(1011, "internal error"));
    assert!(wait_until(|| !p.feature.is_realtime_active()).await);

    // No reconnect: frames keep flowing locally but nothing goes upstream.
    assert_eq!(p.feature.status(), CameraStatus::Scanning);
    peer.drain();
    let seen = p.feature.frames_seen();
    assert!(wait_until(|| p.backend.push_test_frame() && p.feature.frames_seen() > seen).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peer.drain().is_empty());
    assert_eq!(p.connector.attempts(), 1);
}

#[tokio::test]
async fn dispose_releases_the_camera() {
    let mut p = pipeline();
    let _peer = start_scanning(&mut p).await;
    assert!(p.backend.is_streaming());

    p.feature.dispose();
    p.feature.dispose();

    assert_eq!(p.feature.status(), CameraStatus::Paused);
    assert!(wait_until(|| p.backend.open_devices() == 0).await);
    assert!(wait_until(|| !p.backend.is_streaming()).await);
    assert!(p.feature.scan().await.is_err());
}
