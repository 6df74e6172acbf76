//! Core types used throughout Voxstream

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw audio frame (16-bit PCM, little-endian)
pub type AudioFrame = Vec<u8>;

/// Which concrete transcription backend an adapter wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// WebSocket-streamed cloud recognizer
    Cloud,
    /// Platform-native on-device recognizer
    OnDevice,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Cloud => write!(f, "cloud"),
            EngineKind::OnDevice => write!(f, "on-device"),
        }
    }
}

/// Public connection lifecycle of an engine adapter.
///
/// `Connected` is only entered once the backend has acknowledged the session
/// (for the cloud engine, a parsed session-begin message); `Streaming` only
/// from `Connected`, once audio is actually flowing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error(String),
}

impl ConnectionState {
    /// Whether the adapter currently holds a live backend connection.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

/// Relative battery cost of running an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryImpact {
    Low,
    Medium,
    High,
}

/// Static capability profile for one engine kind.
///
/// Constructed once per kind; never mutated.
#[derive(Debug, Clone)]
pub struct EngineDescriptor {
    pub kind: EngineKind,
    pub supports_offline: bool,
    pub supports_real_time: bool,
    pub requires_network: bool,
    pub max_audio_duration: Option<Duration>,
    pub supported_languages: Vec<String>,
    pub battery_impact: BatteryImpact,
}

/// One recognized word with timing and confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    /// Start offset in milliseconds from session start
    pub start: u64,
    /// End offset in milliseconds from session start
    pub end: u64,
    pub confidence: f32,
}

/// One contiguous span of recognized speech.
///
/// A turn is open until its `end_of_turn` flag is observed; afterwards it is
/// immutable and part of the running transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Ordinal position within the session
    pub order: u64,
    pub transcript: String,
    #[serde(default)]
    pub words: Vec<Word>,
    pub end_of_turn: bool,
    pub is_formatted: bool,
    pub confidence: Option<f32>,
    pub end_of_turn_confidence: Option<f32>,
}

/// One cloud-engine connection lifecycle, created when the server
/// acknowledges session begin.
#[derive(Debug, Clone)]
pub struct Session {
    /// Server-assigned session identifier
    pub id: String,
    pub expires_at: DateTime<Utc>,
    pub sample_rate: u32,
    pub language: Option<String>,
}

/// Engine-agnostic progress snapshot handed between adapters on a hot-swap.
///
/// Written once by the outgoing adapter's `export_state`, consumed exactly
/// once by the incoming adapter's `import_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    /// Running transcript accumulated so far
    pub transcript: String,
    /// Elapsed session duration at export time
    pub session_duration: Duration,
    /// Timestamp of the last transcript or connection activity
    pub last_activity: DateTime<Utc>,
    /// Opaque per-engine extension data
    #[serde(default)]
    pub extras: HashMap<String, String>,
}

/// Negotiation parameters for a cloud transcription session.
///
/// Only `sample_rate` is required; unset options are omitted from the wire
/// message so server-side defaults stay in force.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Sample rate of the audio in Hz
    pub sample_rate: u32,
    /// Language hint (ISO 639-1 code, e.g., "en")
    pub language: Option<String>,
    /// Ask the server to deliver formatted (punctuated, cased) turns
    pub format_turns: Option<bool>,
    /// Confidence above which the server may end a turn early
    pub end_of_turn_confidence_threshold: Option<f32>,
    /// Minimum silence (ms) to end a turn when confidence is high
    pub min_end_of_turn_silence_when_confident: Option<u32>,
    /// Silence (ms) after which a turn always ends
    pub max_turn_silence: Option<u32>,
}

impl SessionConfig {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            language: None,
            format_turns: None,
            end_of_turn_confidence_threshold: None,
            min_end_of_turn_silence_when_confident: None,
            max_turn_silence: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_format_turns(mut self, format_turns: bool) -> Self {
        self.format_turns = Some(format_turns);
        self
    }

    pub fn with_end_of_turn_confidence_threshold(mut self, threshold: f32) -> Self {
        self.end_of_turn_confidence_threshold = Some(threshold);
        self
    }

    pub fn with_min_end_of_turn_silence_when_confident(mut self, ms: u32) -> Self {
        self.min_end_of_turn_silence_when_confident = Some(ms);
        self
    }

    pub fn with_max_turn_silence(mut self, ms: u32) -> Self {
        self.max_turn_silence = Some(ms);
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        // 16 kHz mono is the common ground for speech backends
        Self::new(16000)
    }
}
