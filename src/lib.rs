pub mod audio;
pub mod camera;
pub mod diagnostics;
pub mod events;
pub mod feature;
pub mod preview;
pub mod realtime;
pub mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use audio::cpal_backend::{input_available, output_available, CpalInput, CpalOutput};
use audio::device::{AudioInput, AudioOutput, NullOutput, SilentInput};
use camera::backend::{CameraBackend, DeviceEventCallback, OpenOutcome};
use camera::dummy::DummyBackend;
use camera::error::CameraError;
use camera::types::{CameraDevice, DeviceId};
use feature::{CameraFeature, FeatureConfig};
use preview::capture::CaptureConfig;
use realtime::session::RealtimeConfig;
use realtime::transport::WsConnector;
use settings::store::SettingsStore;
use settings::types::LiveSettings;

/// Settings file used when none is given on the command line.
pub const DEFAULT_SETTINGS_FILE: &str = "live-camera.json";

/// How often the headless runner logs frame statistics.
const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(10);

/// Create the camera backend for the current platform.
///
/// When `DUMMY_CAMERA=1` is set, a simulated camera is used instead.
pub fn create_camera_backend() -> Arc<dyn CameraBackend> {
    if DummyBackend::is_enabled() {
        info!("using simulated passthrough cameras");
        return Arc::new(DummyBackend::new());
    }
    warn!("no camera backend for this platform; set DUMMY_CAMERA=1 to simulate one");
    Arc::new(NullBackend)
}

/// Backend used on platforms without a native camera backend.
struct NullBackend;

impl CameraBackend for NullBackend {
    fn enumerate_devices(&self) -> camera::error::Result<Vec<CameraDevice>> {
        Ok(vec![])
    }

    fn open(&self, id: &DeviceId, outcome: OpenOutcome, _on_event: DeviceEventCallback) {
        outcome.resolve(Err(CameraError::Open {
            id: id.clone(),
            reason: "no backend".to_string(),
        }));
    }
}

/// Pick the system audio devices, or silent stand-ins when audio is off or
/// no device is present.
pub fn create_audio_devices(enabled: bool) -> (Arc<dyn AudioInput>, Arc<dyn AudioOutput>) {
    if !enabled {
        info!("audio devices disabled");
        return (Arc::new(SilentInput), Arc::new(NullOutput::new()));
    }

    let input: Arc<dyn AudioInput> = if input_available() {
        Arc::new(CpalInput)
    } else {
        warn!("no audio input device, streaming silence");
        Arc::new(SilentInput)
    };
    let output: Arc<dyn AudioOutput> = if output_available() {
        Arc::new(CpalOutput)
    } else {
        warn!("no audio output device, discarding model audio");
        Arc::new(NullOutput::new())
    };
    (input, output)
}

/// Translate the settings file into the orchestrator's configuration.
///
/// Without a preview panel to place there is nothing to wait for between
/// initialization and scanning, so `headless` scans straight away.
pub fn feature_config(settings: &LiveSettings, headless: bool) -> FeatureConfig {
    FeatureConfig {
        capture: CaptureConfig {
            eye: settings.camera_eye,
            ..CaptureConfig::default()
        },
        realtime: RealtimeConfig {
            url: settings.url.clone(),
            api_key: settings.api_key.clone(),
            setup: settings.setup.clone(),
            video_interval: settings.video_interval(),
            ..RealtimeConfig::default()
        },
        realtime_enabled: settings.realtime_enabled,
        jpeg_quality: settings.jpeg_quality,
        scan_after_initialize: headless,
    }
}

/// Run the pipeline headless until Ctrl-C, then pause and release
/// everything.
pub async fn run(settings_path: PathBuf) -> camera::error::Result<()> {
    let store = SettingsStore::new(settings_path);
    if let Err(e) = store.ensure_exists() {
        warn!("could not write default settings: {e}");
    }
    let settings = store.effective();
    info!(
        "settings: {} ({} eye, model {})",
        store.path().display(),
        settings.camera_eye,
        settings.setup.model
    );

    let (audio_input, audio_output) = create_audio_devices(settings.audio_enabled);
    let feature = CameraFeature::new(
        create_camera_backend(),
        Arc::new(WsConnector::default()),
        audio_input,
        audio_output,
        feature_config(&settings, true),
    );
    feature.on_endpoint_ready(|endpoint| {
        let pose = endpoint.head_to_camera_pose();
        info!(
            "camera pose: t=({:.3}, {:.3}, {:.3}), fov {:.1} deg",
            pose.translation.x, pose.translation.y, pose.translation.z, endpoint.fov
        );
    });
    feature.on_response(|text| info!("model: {text}"));

    if let Err(e) = feature.scan().await {
        feature.dispose();
        return Err(e);
    }

    let mut ticker = tokio::time::interval(DIAGNOSTICS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("failed to listen for Ctrl-C: {e}");
                }
                break;
            }
            _ = ticker.tick() => {
                let stats = feature.diagnostics();
                info!(
                    "{}: {:.1} fps, {} sent, {} dropped at capture, {} throttled, {} skipped while inactive, realtime {}",
                    feature.status(),
                    stats.fps,
                    stats.sent,
                    stats.dropped.at_capture(),
                    stats.dropped.throttled,
                    stats.dropped.inactive,
                    if feature.is_realtime_active() { "active" } else { "inactive" }
                );
            }
        }
    }

    info!("shutting down");
    feature.pause();
    feature.dispose();
    Ok(())
}
