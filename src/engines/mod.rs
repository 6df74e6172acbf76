//! Engine adapter layer
//!
//! Two interchangeable transcription backends behind one control surface:
//! a WebSocket-streamed cloud engine and a platform-native on-device engine.

mod cloud;
mod device;

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{
    AudioFrame, BatteryImpact, ConnectionState, EngineDescriptor, EngineKind, EngineState, Turn,
};

pub use cloud::CloudEngine;
pub use device::{NativeRecognizer, OnDeviceEngine, RecognizerUpdate};

/// Capacity of each engine's event channel; slow subscribers lag rather
/// than block the driver.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Ordered notification stream emitted by an engine.
///
/// Emission order matches the order of the underlying state-machine
/// transitions.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(ConnectionState),
    TranscriptChanged(String),
    TurnFinalized(Turn),
    ErrorOccurred(Error),
}

/// Unified control surface over one concrete recognition backend.
///
/// Exactly two implementations exist, selected at construction time:
/// [`CloudEngine`] and [`OnDeviceEngine`].
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Static capability profile for this engine
    fn capabilities(&self) -> EngineDescriptor;

    /// Begin a recognition session.
    ///
    /// Suspends until the first observable transition out of
    /// `Disconnected`; an `Error` state resolves to `Err`.
    async fn start(&self) -> Result<()>;

    /// Graceful shutdown. Callable from any state; flushes any open turn
    /// into the running transcript and suspends until a terminal state.
    async fn stop(&self) -> Result<()>;

    /// Reset accumulated text without touching the connection
    fn clear_transcript(&self);

    /// Push one raw PCM frame from the audio source
    async fn push_audio(&self, frame: AudioFrame) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    /// Running transcript (finalized turns only)
    fn transcript_text(&self) -> String;

    fn last_error(&self) -> Option<Error>;

    /// Subscribe to the ordered engine event stream
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Stop accepting new audio ahead of a hot-swap, keeping accumulated
    /// state exportable
    async fn prepare_for_transition(&self);

    /// Snapshot engine-agnostic progress for a hot-swap
    fn export_state(&self) -> EngineState;

    /// Seed accumulated state from the outgoing engine's snapshot.
    /// Does not resume audio capture.
    async fn import_state(&self, snapshot: EngineState);

    /// Invoked by the coordinator once this engine becomes the active one
    fn did_become_active(&self);
}

/// Descriptor for one engine kind. Built once; engines hand out clones.
pub fn descriptor(kind: EngineKind) -> EngineDescriptor {
    match kind {
        EngineKind::Cloud => EngineDescriptor {
            kind,
            supports_offline: false,
            supports_real_time: true,
            requires_network: true,
            max_audio_duration: None,
            supported_languages: ["en", "es", "fr", "de", "it", "pt", "nl", "hi", "ja", "zh"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            battery_impact: BatteryImpact::Low,
        },
        EngineKind::OnDevice => EngineDescriptor {
            kind,
            supports_offline: true,
            supports_real_time: true,
            requires_network: false,
            // platform recognizers cap continuous recognition around a minute
            max_audio_duration: Some(Duration::from_secs(60)),
            supported_languages: vec!["en".to_string()],
            battery_impact: BatteryImpact::High,
        },
    }
}

/// Observable state shared by both adapters: connection state as a watch
/// channel (so `start`/`stop` can await transitions), last error, and the
/// ordered event broadcast.
pub(crate) struct Observables {
    state_tx: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<Error>>,
    events: broadcast::Sender<EngineEvent>,
}

impl Observables {
    pub(crate) fn new() -> Self {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state_tx,
            last_error: Mutex::new(None),
            events,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let changed = {
            let current = self.state_tx.borrow();
            *current != state
        };
        if changed {
            debug!("Connection state -> {:?}", state);
            let _ = self.state_tx.send(state.clone());
            self.publish(EngineEvent::StateChanged(state));
        }
    }

    pub(crate) fn last_error(&self) -> Option<Error> {
        self.last_error.lock().clone()
    }

    pub(crate) fn record_error(&self, error: Error) {
        *self.last_error.lock() = Some(error.clone());
        self.publish(EngineEvent::ErrorOccurred(error));
    }

    pub(crate) fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Resolve a `start()` call: suspend until the connection either comes
    /// up (`Connected`/`Streaming`), fails (`Error`), or is torn back down
    /// to `Disconnected` by a concurrent `stop()` — the last case resolves
    /// `Ok`, since the shutdown was deliberate.
    pub(crate) async fn await_start_outcome(
        mut rx: watch::Receiver<ConnectionState>,
        fallback: Error,
    ) -> Result<()> {
        let mut left_disconnected = false;
        loop {
            {
                let state = rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Error(detail) => {
                        return Err(Error::ConnectionFailed(detail));
                    }
                    ConnectionState::Connected | ConnectionState::Streaming => return Ok(()),
                    ConnectionState::Connecting => left_disconnected = true,
                    ConnectionState::Disconnected => {
                        if left_disconnected {
                            return Ok(());
                        }
                    }
                }
            }
            if rx.changed().await.is_err() {
                return Err(fallback);
            }
        }
    }
}

/// Engine-agnostic accumulated progress, shared between the adapter facade
/// and its driver task. Feeds `export_state` / `import_state`.
pub(crate) struct Progress {
    pub transcript: String,
    /// Session time carried over from an imported snapshot
    pub carried_duration: Duration,
    pub started_at: Option<std::time::Instant>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub extras: std::collections::HashMap<String, String>,
}

impl Progress {
    pub(crate) fn new() -> Self {
        Self {
            transcript: String::new(),
            carried_duration: Duration::ZERO,
            started_at: None,
            last_activity: chrono::Utc::now(),
            extras: std::collections::HashMap::new(),
        }
    }

    pub(crate) fn session_duration(&self) -> Duration {
        self.carried_duration
            + self
                .started_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO)
    }

    /// Fold the running clock into the carried duration. Called on every
    /// terminal transition so idle time between sessions never accrues;
    /// the next session start resumes the clock from here.
    pub(crate) fn stop_clock(&mut self) {
        if let Some(started) = self.started_at.take() {
            self.carried_duration += started.elapsed();
        }
    }

    pub(crate) fn export(&self) -> EngineState {
        EngineState {
            transcript: self.transcript.clone(),
            session_duration: self.session_duration(),
            last_activity: self.last_activity,
            extras: self.extras.clone(),
        }
    }

    pub(crate) fn import(&mut self, snapshot: EngineState) {
        self.transcript = snapshot.transcript;
        self.carried_duration = snapshot.session_duration;
        self.started_at = None;
        self.last_activity = snapshot.last_activity;
        self.extras = snapshot.extras;
    }
}
