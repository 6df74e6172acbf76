//! Voxstream - speech-recognition engine abstraction and streaming protocol
//!
//! A unified interface over two interchangeable transcription engines (a
//! WebSocket-streamed cloud backend and a platform-native on-device
//! recognizer), the wire-level session/turn protocol for the cloud engine,
//! and the lifecycle machinery for connection recovery and mid-session
//! engine hot-swap without transcript loss.

pub mod coordinator;
pub mod engines;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Re-export the main engine components for convenience
pub use coordinator::EngineCoordinator;
pub use engines::{
    CloudEngine, EngineEvent, NativeRecognizer, OnDeviceEngine, RecognizerUpdate, SpeechEngine,
};
pub use protocol::{
    DecodeError, ProtocolEvent, TurnEvent, decode, encode_session_begin, encode_session_terminate,
};
pub use session::{CompletionReason, SessionPhase, SessionStateMachine};
pub use transport::{
    TokenProvider, Transport, TransportEvent, TransportFactory, WebSocketTransport,
    WebSocketTransportFactory,
};
