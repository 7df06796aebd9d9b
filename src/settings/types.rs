use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::camera::types::CameraEye;
use crate::preview::compress::DEFAULT_QUALITY;
use crate::realtime::protocol::{SetupConfig, DEFAULT_ENDPOINT};
use crate::realtime::throttle::DEFAULT_VIDEO_INTERVAL;

/// Contents of the settings file. Every field falls back to its default
/// when missing, so partial files are fine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveSettings {
    pub api_key: String,
    pub url: String,
    pub realtime_enabled: bool,
    pub setup: SetupConfig,
    pub camera_eye: CameraEye,
    pub jpeg_quality: u8,
    /// Minimum gap between video frames sent upstream.
    pub video_interval_ms: u64,
    /// Use the system audio devices; silence and a null sink otherwise.
    pub audio_enabled: bool,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: DEFAULT_ENDPOINT.to_string(),
            realtime_enabled: true,
            setup: SetupConfig::default(),
            camera_eye: CameraEye::Left,
            jpeg_quality: DEFAULT_QUALITY,
            video_interval_ms: DEFAULT_VIDEO_INTERVAL.as_millis() as u64,
            audio_enabled: true,
        }
    }
}

impl LiveSettings {
    pub fn video_interval(&self) -> Duration {
        Duration::from_millis(self.video_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_live_endpoint() {
        let settings = LiveSettings::default();
        assert_eq!(settings.api_key, "");
        assert_eq!(settings.url, DEFAULT_ENDPOINT);
        assert_eq!(settings.setup.model, "models/gemini-2.0-flash-exp");
        assert_eq!(settings.camera_eye, CameraEye::Left);
        assert_eq!(settings.jpeg_quality, 85);
        assert_eq!(settings.video_interval(), Duration::from_millis(333));
        assert!(settings.audio_enabled);
    }

    #[test]
    fn serialises_to_camel_case_json() {
        let json = serde_json::to_value(LiveSettings::default()).unwrap();

        assert!(json["apiKey"].is_string());
        assert_eq!(json["cameraEye"], "left");
        assert_eq!(json["jpegQuality"], 85);
        assert_eq!(json["videoIntervalMs"], 333);
        assert_eq!(json["setup"]["voiceName"], "Aoede");
        assert_eq!(json["setup"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let json = r#"{
            "apiKey": "abc",
            "cameraEye": "right",
            "setup": { "voiceName": "Puck" }
        }"#;

        let settings: LiveSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.api_key, "abc");
        assert_eq!(settings.camera_eye, CameraEye::Right);
        assert_eq!(settings.setup.voice_name, "Puck");
        assert_eq!(settings.setup.model, "models/gemini-2.0-flash-exp");
        assert_eq!(settings.url, DEFAULT_ENDPOINT);
        assert!(settings.realtime_enabled);
    }

    #[test]
    fn unknown_eye_is_rejected() {
        let result = serde_json::from_str::<LiveSettings>(r#"{"cameraEye":"middle"}"#);
        assert!(result.is_err());
    }
}
