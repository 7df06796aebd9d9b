//! JSON messages exchanged with the live generate-content endpoint.
//!
//! Outbound messages are wrapped in a single top-level key (`setup` or
//! `realtimeInput`). Inbound messages may carry `setupComplete` or
//! `serverContent`; anything else is ignored.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::preview::compress::EncodedFrame;
use crate::realtime::error::{RealtimeError, Result};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
pub const DEFAULT_VOICE: &str = "Aoede";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are looking through the camera of the user's headset. \
Answer questions about what you can see, and keep spoken answers short.";

/// Mime tag for microphone audio sent upstream.
pub const AUDIO_INPUT_MIME: &str = "audio/pcm;rate=16000";

/// Tunables for the `setup` handshake message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetupConfig {
    pub model: String,
    pub system_instruction: String,
    pub candidate_count: u32,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub response_modalities: Vec<String>,
    pub voice_name: String,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            candidate_count: 1,
            max_output_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
            response_modalities: vec!["AUDIO".to_string()],
            voice_name: DEFAULT_VOICE.to_string(),
        }
    }
}

// --- Outbound ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage<'a> {
    Setup(Setup<'a>),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    system_instruction: SystemContent<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    candidate_count: u32,
    max_output_tokens: u32,
    temperature: f32,
    top_p: f32,
    response_modalities: &'a [String],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
struct SystemContent<'a> {
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<Blob>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

/// The `setup` message, always the first thing sent on a new connection.
pub fn setup_message(config: &SetupConfig) -> Result<String> {
    let message = ClientMessage::Setup(Setup {
        model: &config.model,
        generation_config: GenerationConfig {
            candidate_count: config.candidate_count,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            response_modalities: &config.response_modalities,
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: &config.voice_name,
                    },
                },
            },
        },
        system_instruction: SystemContent {
            parts: vec![TextPart {
                text: &config.system_instruction,
            }],
        },
    });
    Ok(serde_json::to_string(&message)?)
}

pub fn video_message(frame: &EncodedFrame) -> Result<String> {
    let message = ClientMessage::RealtimeInput(RealtimeInput {
        video: Some(Blob {
            mime_type: frame.mime_type.to_string(),
            data: STANDARD.encode(&frame.data),
        }),
        audio: None,
    });
    Ok(serde_json::to_string(&message)?)
}

/// Wraps 16 kHz mono s16le PCM.
pub fn audio_message(pcm: &[u8]) -> Result<String> {
    let message = ClientMessage::RealtimeInput(RealtimeInput {
        video: None,
        audio: Some(Blob {
            mime_type: AUDIO_INPUT_MIME.to_string(),
            data: STANDARD.encode(pcm),
        }),
    });
    Ok(serde_json::to_string(&message)?)
}

// --- Inbound ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    text: Option<String>,
}

/// Something the server told us, in message order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    Text(String),
    /// Decoded 24 kHz mono s16le PCM.
    Audio(Bytes),
    InputTranscription(String),
}

/// Parse one inbound text frame.
///
/// A frame that is not valid JSON is a protocol error. Unknown fields and
/// non-audio inline data are ignored; an audio part that fails to decode is
/// skipped without affecting the rest of the message.
pub fn parse_server_message(text: &str) -> Result<Vec<ServerEvent>> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| RealtimeError::Protocol(e.to_string()))?;

    if message.setup_complete.is_some() {
        return Ok(vec![ServerEvent::SetupComplete]);
    }

    let mut events = Vec::new();
    let Some(content) = message.server_content else {
        return Ok(events);
    };

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(text) = part.text {
                events.push(ServerEvent::Text(text));
            }
            if let Some(inline) = part.inline_data {
                if !inline.mime_type.contains("audio") {
                    debug!("ignoring inline data of type {}", inline.mime_type);
                    continue;
                }
                match STANDARD.decode(inline.data.as_bytes()) {
                    Ok(pcm) => events.push(ServerEvent::Audio(Bytes::from(pcm))),
                    Err(e) => warn!("failed to decode audio response: {e}"),
                }
            }
        }
    }

    if let Some(text) = content.input_transcription.and_then(|t| t.text) {
        events.push(ServerEvent::InputTranscription(text));
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn as_json(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn setup_message_has_expected_shape() {
        let msg = as_json(&setup_message(&SetupConfig::default()).unwrap());
        let setup = &msg["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-exp");

        let gen = &setup["generationConfig"];
        assert_eq!(gen["candidateCount"], 1);
        assert_eq!(gen["maxOutputTokens"], 1024);
        assert!((gen["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert!((gen["topP"].as_f64().unwrap() - 0.9).abs() < 1e-6);
        assert_eq!(gen["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            gen["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );
        assert_eq!(
            setup["systemInstruction"]["parts"][0]["text"],
            DEFAULT_SYSTEM_INSTRUCTION
        );
    }

    #[test]
    fn video_message_carries_base64_jpeg() {
        let frame = EncodedFrame {
            data: Bytes::from_static(&[0xFF, 0xD8, 0xFF]),
            mime_type: "image/jpeg",
        };
        let msg = as_json(&video_message(&frame).unwrap());
        assert_eq!(
            msg,
            json!({"realtimeInput": {"video": {"mimeType": "image/jpeg", "data": "/9j/"}}})
        );
    }

    #[test]
    fn audio_message_carries_pcm_mime() {
        let msg = as_json(&audio_message(&[1, 2, 3]).unwrap());
        assert_eq!(
            msg,
            json!({"realtimeInput": {"audio": {"mimeType": "audio/pcm;rate=16000", "data": "AQID"}}})
        );
    }

    #[test]
    fn setup_complete_is_recognised() {
        let events = parse_server_message(r#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(events, [ServerEvent::SetupComplete]);
    }

    #[test]
    fn model_turn_parts_become_events_in_order() {
        let text = r#"{"serverContent":{"modelTurn":{"parts":[
            {"text":"hello"},
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQID"}},
            {"inlineData":{"mimeType":"image/png","data":"AAAA"}}
        ]},"inputTranscription":{"text":"what is this"}}}"#;

        let events = parse_server_message(text).unwrap();
        assert_eq!(
            events,
            [
                ServerEvent::Text("hello".into()),
                ServerEvent::Audio(Bytes::from_static(&[1, 2, 3])),
                ServerEvent::InputTranscription("what is this".into()),
            ]
        );
    }

    #[test]
    fn bad_audio_part_is_skipped() {
        let text = r#"{"serverContent":{"modelTurn":{"parts":[
            {"inlineData":{"mimeType":"audio/pcm","data":"not base64!"}},
            {"text":"still here"}
        ]}}}"#;
        let events = parse_server_message(text).unwrap();
        assert_eq!(events, [ServerEvent::Text("still here".into())]);
    }

    #[test]
    fn unknown_messages_yield_nothing() {
        assert!(parse_server_message(r#"{"toolCall":{}}"#).unwrap().is_empty());
        assert!(parse_server_message(r#"{"serverContent":{"turnComplete":true}}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        let err = parse_server_message("{not json").unwrap_err();
        assert!(matches!(err, RealtimeError::Protocol(_)));
    }

    #[test]
    fn setup_config_fills_missing_fields() {
        let config: SetupConfig = serde_json::from_str(r#"{"voiceName":"Puck"}"#).unwrap();
        assert_eq!(config.voice_name, "Puck");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_output_tokens, 1024);
    }
}
