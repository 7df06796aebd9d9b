//! Headless live camera runner.
//!
//! Streams the headset camera and microphone to the live endpoint and plays
//! the spoken replies until Ctrl-C.
//!
//! ```bash
//! # Simulated cameras, key from the environment
//! DUMMY_CAMERA=1 GEMINI_API_KEY=<key> live-camera
//!
//! # Explicit settings file
//! live-camera ./live-camera.json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(live_camera::DEFAULT_SETTINGS_FILE));

    info!("live camera starting");
    match live_camera::run(settings_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("live camera stopped: {e}");
            ExitCode::FAILURE
        }
    }
}
