//! Wire-level codec for the cloud streaming protocol
//!
//! Stateless translation between JSON text frames and typed protocol events.
//! Any cross-message context (turn ordering, session identity) belongs to the
//! session state machine, not here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{SessionConfig, Word};

/// Inbound wire messages, decoded into a closed set of events.
///
/// New server message kinds must fail closed: `decode` returns
/// [`DecodeError::UnrecognizedType`] and the caller logs and drops the frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Server acknowledged session begin; audio may flow after this
    SessionBegins { id: String, expires_at: i64 },
    /// Transcript update for the current or next turn
    Turn(TurnEvent),
    /// Server acknowledged termination
    SessionTerminates { audio_duration_seconds: Option<f64> },
    /// Server-reported error
    Error { message: String, code: Option<i64> },
}

/// Payload of an inbound transcript message.
///
/// `order` is absent on legacy partial/final transcript messages; the state
/// machine maps a missing order onto the open turn or the next ordinal.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnEvent {
    pub order: Option<u64>,
    pub transcript: String,
    pub words: Vec<Word>,
    pub end_of_turn: bool,
    pub is_formatted: bool,
    pub confidence: Option<f32>,
    pub end_of_turn_confidence: Option<f32>,
}

/// Failures while decoding an inbound frame
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("unrecognized message type: {0}")]
    UnrecognizedType(String),
    #[error("message carries no type discriminator")]
    MissingType,
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

#[derive(Debug, Serialize)]
struct SessionBeginMessage<'a> {
    sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    format_turns: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_of_turn_confidence_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_end_of_turn_silence_when_confident: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_turn_silence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SessionBeginsPayload {
    id: String,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct TurnPayload {
    turn_order: Option<u64>,
    transcript: String,
    #[serde(default)]
    words: Vec<Word>,
    end_of_turn: Option<bool>,
    turn_is_formatted: Option<bool>,
    confidence: Option<f32>,
    end_of_turn_confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct SessionTerminatesPayload {
    audio_duration_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: String,
    code: Option<i64>,
}

/// Serialize the session-begin control message.
///
/// Unset optional fields are omitted entirely, leaving server-side defaults
/// in force.
pub fn encode_session_begin(config: &SessionConfig) -> crate::Result<String> {
    let message = SessionBeginMessage {
        sample_rate: config.sample_rate,
        format_turns: config.format_turns,
        end_of_turn_confidence_threshold: config.end_of_turn_confidence_threshold,
        min_end_of_turn_silence_when_confident: config.min_end_of_turn_silence_when_confident,
        max_turn_silence: config.max_turn_silence,
        language: config.language.as_deref(),
    };
    Ok(serde_json::to_string(&message)?)
}

/// Serialize the termination request. Always the identical payload.
pub fn encode_session_terminate() -> String {
    r#"{"terminate_session":true}"#.to_string()
}

/// Decode one inbound frame into a [`ProtocolEvent`].
///
/// The type discriminator is tolerated under either `"message_type"` or
/// `"type"`; both names may appear within the same session.
pub fn decode(raw: &str) -> Result<ProtocolEvent, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;

    let discriminator = value
        .get("message_type")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;

    match discriminator {
        "SessionBegins" | "Begin" => {
            let payload: SessionBeginsPayload = serde_json::from_value(value)?;
            Ok(ProtocolEvent::SessionBegins {
                id: payload.id,
                expires_at: payload.expires_at,
            })
        }
        "PartialTranscript" | "FinalTranscript" | "Turn" => {
            // Legacy final-transcript messages close the turn implicitly
            let implies_end = discriminator == "FinalTranscript";
            let payload: TurnPayload = serde_json::from_value(value)?;
            Ok(ProtocolEvent::Turn(TurnEvent {
                order: payload.turn_order,
                transcript: payload.transcript,
                words: payload.words,
                end_of_turn: payload.end_of_turn.unwrap_or(implies_end),
                is_formatted: payload.turn_is_formatted.unwrap_or(false),
                confidence: payload.confidence,
                end_of_turn_confidence: payload.end_of_turn_confidence,
            }))
        }
        "SessionTerminates" => {
            let payload: SessionTerminatesPayload = serde_json::from_value(value)?;
            Ok(ProtocolEvent::SessionTerminates {
                audio_duration_seconds: payload.audio_duration_seconds,
            })
        }
        "Error" => {
            let payload: ErrorPayload = serde_json::from_value(value)?;
            Ok(ProtocolEvent::Error {
                message: payload.error,
                code: payload.code,
            })
        }
        other => Err(DecodeError::UnrecognizedType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionConfig;

    #[test]
    fn test_encode_session_begin_includes_set_fields() {
        let config = SessionConfig::new(16000).with_language("en");
        let encoded = encode_session_begin(&config).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["sample_rate"], 16000);
        assert_eq!(value["language"], "en");
    }

    #[test]
    fn test_encode_session_begin_omits_unset_fields() {
        let config = SessionConfig::new(16000).with_language("en");
        let encoded = encode_session_begin(&config).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        let object = value.as_object().unwrap();
        assert!(!object.contains_key("format_turns"));
        assert!(!object.contains_key("end_of_turn_confidence_threshold"));
        assert!(!object.contains_key("min_end_of_turn_silence_when_confident"));
        assert!(!object.contains_key("max_turn_silence"));
    }

    #[test]
    fn test_encode_session_begin_round_trips_every_set_field() {
        let config = SessionConfig::new(44100)
            .with_language("de")
            .with_format_turns(true)
            .with_end_of_turn_confidence_threshold(0.7)
            .with_min_end_of_turn_silence_when_confident(160)
            .with_max_turn_silence(2400);
        let encoded = encode_session_begin(&config).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["sample_rate"], 44100);
        assert_eq!(value["language"], "de");
        assert_eq!(value["format_turns"], true);
        let threshold = value["end_of_turn_confidence_threshold"].as_f64().unwrap();
        assert!((threshold - 0.7).abs() < 1e-6);
        assert_eq!(value["min_end_of_turn_silence_when_confident"], 160);
        assert_eq!(value["max_turn_silence"], 2400);
    }

    #[test]
    fn test_encode_session_terminate_is_idempotent() {
        assert_eq!(encode_session_terminate(), encode_session_terminate());
        let value: Value = serde_json::from_str(&encode_session_terminate()).unwrap();
        assert_eq!(value["terminate_session"], true);
    }

    #[test]
    fn test_decode_session_begins_under_both_discriminator_names() {
        let legacy = r#"{"message_type":"SessionBegins","id":"abc123","expires_at":1700000000}"#;
        let current = r#"{"type":"Begin","id":"abc123","expires_at":1700000000}"#;

        for raw in [legacy, current] {
            let event = decode(raw).unwrap();
            assert_eq!(
                event,
                ProtocolEvent::SessionBegins {
                    id: "abc123".to_string(),
                    expires_at: 1700000000,
                }
            );
        }
    }

    #[test]
    fn test_decode_turn_with_words() {
        let raw = r#"{
            "type": "Turn",
            "turn_order": 3,
            "transcript": "hello world",
            "words": [{"text": "hello", "start": 0, "end": 420, "confidence": 0.98}],
            "end_of_turn": true,
            "turn_is_formatted": true,
            "end_of_turn_confidence": 0.91
        }"#;

        let event = decode(raw).unwrap();
        match event {
            ProtocolEvent::Turn(turn) => {
                assert_eq!(turn.order, Some(3));
                assert_eq!(turn.transcript, "hello world");
                assert_eq!(turn.words.len(), 1);
                assert_eq!(turn.words[0].text, "hello");
                assert!(turn.end_of_turn);
                assert!(turn.is_formatted);
                assert_eq!(turn.end_of_turn_confidence, Some(0.91));
            }
            other => panic!("expected Turn, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_final_transcript_implies_end_of_turn() {
        let raw = r#"{"message_type":"FinalTranscript","transcript":"done"}"#;
        match decode(raw).unwrap() {
            ProtocolEvent::Turn(turn) => {
                assert!(turn.end_of_turn);
                assert_eq!(turn.order, None);
            }
            other => panic!("expected Turn, got {:?}", other),
        }

        // Partial transcripts stay open unless the field says otherwise
        let raw = r#"{"message_type":"PartialTranscript","transcript":"do"}"#;
        match decode(raw).unwrap() {
            ProtocolEvent::Turn(turn) => assert!(!turn.end_of_turn),
            other => panic!("expected Turn, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_session_terminates() {
        let raw = r#"{"message_type":"SessionTerminates","audio_duration_seconds":12.5}"#;
        assert_eq!(
            decode(raw).unwrap(),
            ProtocolEvent::SessionTerminates {
                audio_duration_seconds: Some(12.5),
            }
        );
    }

    #[test]
    fn test_decode_error_message() {
        let raw = r#"{"type":"Error","error":"usage limit exceeded","code":4002}"#;
        assert_eq!(
            decode(raw).unwrap(),
            ProtocolEvent::Error {
                message: "usage limit exceeded".to_string(),
                code: Some(4002),
            }
        );
    }

    #[test]
    fn test_decode_unknown_type_fails_closed() {
        let raw = r#"{"type":"SomethingNew","payload":1}"#;
        assert_eq!(
            decode(raw),
            Err(DecodeError::UnrecognizedType("SomethingNew".to_string()))
        );
    }

    #[test]
    fn test_decode_missing_discriminator() {
        assert_eq!(decode(r#"{"id":"abc"}"#), Err(DecodeError::MissingType));
    }

    #[test]
    fn test_decode_malformed_json() {
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"type":"Begin","id":42}"#),
            Err(DecodeError::Malformed(_))
        ));
    }
}
