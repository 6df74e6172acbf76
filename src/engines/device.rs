//! On-device engine wrapping a platform-native recognizer
//!
//! The recognizer itself (Speech framework, Android SpeechRecognizer, a
//! bundled model) lives behind [`NativeRecognizer`] and is supplied by
//! platform code; this adapter maps its update stream onto the shared
//! [`SpeechEngine`] vocabulary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{
    AudioFrame, ConnectionState, EngineDescriptor, EngineKind, EngineState, Turn,
};

use super::{EngineEvent, Observables, Progress, SpeechEngine, descriptor};

/// Updates pushed by a platform recognizer while a session runs
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerUpdate {
    /// Hypothesis for the in-flight utterance; may still change
    Partial(String),
    /// Utterance is final and will not change
    Finalized(String),
    /// Recognizer finished on its own (end of input, duration cap)
    Ended,
    Failed(String),
}

/// Contract platform code implements around its native recognizer.
///
/// `begin` hands back the update stream for one recognition run; the
/// adapter owns the receiving side until `end` or failure.
#[async_trait]
pub trait NativeRecognizer: Send + Sync {
    /// Ensure speech-recognition permission; `Error::PermissionDenied` if refused
    async fn authorize(&self) -> Result<()>;

    async fn begin(&self, language: Option<String>) -> Result<mpsc::Receiver<RecognizerUpdate>>;

    async fn push_audio(&self, frame: AudioFrame) -> Result<()>;

    /// Request the recognizer to finish; updates end with `Ended`
    async fn end(&self) -> Result<()>;
}

struct Shared {
    obs: Observables,
    progress: Mutex<Progress>,
    accepting_audio: AtomicBool,
    open_partial: Mutex<Option<String>>,
    /// Ordinals for synthesized turns; native recognizers have no numbering
    utterances: AtomicU64,
}

impl Shared {
    /// Append one finalized utterance and notify subscribers
    fn commit_utterance(&self, text: String) {
        if text.is_empty() {
            return;
        }
        let order = self.utterances.fetch_add(1, Ordering::SeqCst);
        let full = {
            let mut progress = self.progress.lock();
            if !progress.transcript.is_empty() && !text.starts_with(' ') {
                progress.transcript.push(' ');
            }
            progress.transcript.push_str(&text);
            progress.last_activity = Utc::now();
            progress.transcript.clone()
        };
        self.obs.publish(EngineEvent::TurnFinalized(Turn {
            order,
            transcript: text,
            words: vec![],
            end_of_turn: true,
            is_formatted: false,
            confidence: None,
            end_of_turn_confidence: None,
        }));
        self.obs.publish(EngineEvent::TranscriptChanged(full));
    }

    fn flush_open_partial(&self) {
        if let Some(partial) = self.open_partial.lock().take() {
            debug!("Flushing in-flight utterance on shutdown");
            self.commit_utterance(partial);
        }
    }
}

/// On-device transcription engine
pub struct OnDeviceEngine {
    recognizer: Arc<dyn NativeRecognizer>,
    language: Option<String>,
    shared: Arc<Shared>,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OnDeviceEngine {
    pub fn new(recognizer: Arc<dyn NativeRecognizer>, language: Option<String>) -> Self {
        Self {
            recognizer,
            language,
            shared: Arc::new(Shared {
                obs: Observables::new(),
                progress: Mutex::new(Progress::new()),
                accepting_audio: AtomicBool::new(false),
                open_partial: Mutex::new(None),
                utterances: AtomicU64::new(0),
            }),
            driver: tokio::sync::Mutex::new(None),
        }
    }

    async fn consume_updates(shared: Arc<Shared>, mut updates: mpsc::Receiver<RecognizerUpdate>) {
        loop {
            match updates.recv().await {
                Some(RecognizerUpdate::Partial(text)) => {
                    *shared.open_partial.lock() = Some(text);
                    // results flowing means audio is flowing
                    shared.obs.set_state(ConnectionState::Streaming);
                }
                Some(RecognizerUpdate::Finalized(text)) => {
                    *shared.open_partial.lock() = None;
                    shared.obs.set_state(ConnectionState::Streaming);
                    shared.commit_utterance(text);
                }
                Some(RecognizerUpdate::Ended) => {
                    info!("Recognizer finished");
                    shared.flush_open_partial();
                    shared.accepting_audio.store(false, Ordering::SeqCst);
                    shared.progress.lock().stop_clock();
                    shared.obs.set_state(ConnectionState::Disconnected);
                    return;
                }
                Some(RecognizerUpdate::Failed(detail)) => {
                    warn!("Recognizer failed: {}", detail);
                    shared.flush_open_partial();
                    shared.accepting_audio.store(false, Ordering::SeqCst);
                    shared.progress.lock().stop_clock();
                    let error = Error::Unavailable(detail);
                    shared.obs.record_error(error.clone());
                    shared.obs.set_state(ConnectionState::Error(error.to_string()));
                    return;
                }
                // recognizer dropped its sender without a proper Ended
                None => {
                    shared.flush_open_partial();
                    shared.accepting_audio.store(false, Ordering::SeqCst);
                    shared.progress.lock().stop_clock();
                    shared.obs.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl SpeechEngine for OnDeviceEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::OnDevice
    }

    fn capabilities(&self) -> EngineDescriptor {
        descriptor(EngineKind::OnDevice)
    }

    async fn start(&self) -> Result<()> {
        let state = self.shared.obs.state();
        if state.is_live() || state == ConnectionState::Connecting {
            return Err(Error::Unavailable("engine already started".to_string()));
        }
        self.shared.obs.clear_error();
        self.shared.obs.set_state(ConnectionState::Connecting);

        if let Err(e) = self.recognizer.authorize().await {
            self.shared.obs.record_error(e.clone());
            self.shared
                .obs
                .set_state(ConnectionState::Error(e.to_string()));
            return Err(e);
        }

        let updates = match self.recognizer.begin(self.language.clone()).await {
            Ok(updates) => updates,
            Err(e) => {
                self.shared.obs.record_error(e.clone());
                self.shared
                    .obs
                    .set_state(ConnectionState::Error(e.to_string()));
                return Err(e);
            }
        };

        self.shared.progress.lock().started_at = Some(std::time::Instant::now());
        self.shared.accepting_audio.store(true, Ordering::SeqCst);
        self.shared.obs.set_state(ConnectionState::Connected);

        let shared = self.shared.clone();
        *self.driver.lock().await = Some(tokio::spawn(Self::consume_updates(shared, updates)));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shared.accepting_audio.store(false, Ordering::SeqCst);
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = self.recognizer.end().await {
                warn!("Recognizer end failed: {}", e);
                handle.abort();
                self.shared.flush_open_partial();
                self.shared.progress.lock().stop_clock();
                self.shared.obs.set_state(ConnectionState::Disconnected);
                return Ok(());
            }
            let _ = handle.await;
        }
        Ok(())
    }

    fn clear_transcript(&self) {
        self.shared.progress.lock().transcript.clear();
        self.shared
            .obs
            .publish(EngineEvent::TranscriptChanged(String::new()));
    }

    async fn push_audio(&self, frame: AudioFrame) -> Result<()> {
        if !self.shared.accepting_audio.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.recognizer.push_audio(frame).await?;
        if self.shared.obs.state() == ConnectionState::Connected {
            self.shared.obs.set_state(ConnectionState::Streaming);
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.obs.state()
    }

    fn transcript_text(&self) -> String {
        self.shared.progress.lock().transcript.clone()
    }

    fn last_error(&self) -> Option<Error> {
        self.shared.obs.last_error()
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.obs.subscribe()
    }

    async fn prepare_for_transition(&self) {
        debug!("On-device engine preparing for transition");
        self.shared.accepting_audio.store(false, Ordering::SeqCst);
    }

    fn export_state(&self) -> EngineState {
        self.shared.progress.lock().export()
    }

    async fn import_state(&self, snapshot: EngineState) {
        let transcript = {
            let mut progress = self.shared.progress.lock();
            progress.import(snapshot);
            progress.transcript.clone()
        };
        self.shared
            .obs
            .publish(EngineEvent::TranscriptChanged(transcript));
    }

    fn did_become_active(&self) {
        debug!("On-device engine is now the active adapter");
        self.shared.accepting_audio.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, sleep};

    struct FakeRecognizer {
        deny: bool,
        updates_tx: Mutex<Option<mpsc::Sender<RecognizerUpdate>>>,
        pushed: Mutex<Vec<AudioFrame>>,
    }

    impl FakeRecognizer {
        fn new() -> Self {
            Self {
                deny: false,
                updates_tx: Mutex::new(None),
                pushed: Mutex::new(Vec::new()),
            }
        }

        fn denying() -> Self {
            Self {
                deny: true,
                ..Self::new()
            }
        }

        async fn emit(&self, update: RecognizerUpdate) {
            let tx = self.updates_tx.lock().clone().expect("not begun");
            tx.send(update).await.expect("driver gone");
        }
    }

    #[async_trait]
    impl NativeRecognizer for FakeRecognizer {
        async fn authorize(&self) -> Result<()> {
            if self.deny {
                Err(Error::PermissionDenied)
            } else {
                Ok(())
            }
        }

        async fn begin(&self, _language: Option<String>) -> Result<mpsc::Receiver<RecognizerUpdate>> {
            let (tx, rx) = mpsc::channel(32);
            *self.updates_tx.lock() = Some(tx);
            Ok(rx)
        }

        async fn push_audio(&self, frame: AudioFrame) -> Result<()> {
            self.pushed.lock().push(frame);
            Ok(())
        }

        async fn end(&self) -> Result<()> {
            self.emit(RecognizerUpdate::Ended).await;
            Ok(())
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces_and_stays_disconnected() {
        let engine = OnDeviceEngine::new(Arc::new(FakeRecognizer::denying()), None);
        let err = engine.start().await.unwrap_err();
        assert_eq!(err, Error::PermissionDenied);
        assert!(matches!(
            engine.connection_state(),
            ConnectionState::Error(_)
        ));
        assert_eq!(engine.last_error(), Some(Error::PermissionDenied));
    }

    #[tokio::test]
    async fn test_finalized_utterances_accumulate() {
        let recognizer = Arc::new(FakeRecognizer::new());
        let engine = OnDeviceEngine::new(recognizer.clone(), Some("en".to_string()));
        engine.start().await.unwrap();
        assert_eq!(engine.connection_state(), ConnectionState::Connected);

        recognizer
            .emit(RecognizerUpdate::Finalized("hello".to_string()))
            .await;
        recognizer
            .emit(RecognizerUpdate::Finalized("world".to_string()))
            .await;
        wait_for(|| engine.transcript_text() == "hello world").await;
        assert_eq!(engine.connection_state(), ConnectionState::Streaming);

        engine.stop().await.unwrap();
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
        // transcript survives shutdown
        assert_eq!(engine.transcript_text(), "hello world");
    }

    #[tokio::test]
    async fn test_stop_flushes_open_partial() {
        let recognizer = Arc::new(FakeRecognizer::new());
        let engine = OnDeviceEngine::new(recognizer.clone(), None);
        engine.start().await.unwrap();

        recognizer
            .emit(RecognizerUpdate::Partial("in flight".to_string()))
            .await;
        wait_for(|| engine.connection_state() == ConnectionState::Streaming).await;

        engine.stop().await.unwrap();
        assert_eq!(engine.transcript_text(), "in flight");
    }

    #[tokio::test]
    async fn test_audio_gated_after_stop() {
        let recognizer = Arc::new(FakeRecognizer::new());
        let engine = OnDeviceEngine::new(recognizer.clone(), None);
        engine.start().await.unwrap();

        engine.push_audio(vec![1u8; 320]).await.unwrap();
        assert_eq!(recognizer.pushed.lock().len(), 1);

        engine.stop().await.unwrap();
        engine.push_audio(vec![2u8; 320]).await.unwrap();
        assert_eq!(recognizer.pushed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_import_state_seeds_transcript() {
        let engine = OnDeviceEngine::new(Arc::new(FakeRecognizer::new()), None);
        let snapshot = EngineState {
            transcript: "carried over".to_string(),
            session_duration: Duration::from_secs(12),
            last_activity: Utc::now(),
            extras: Default::default(),
        };
        engine.import_state(snapshot).await;
        assert_eq!(engine.transcript_text(), "carried over");

        let exported = engine.export_state();
        assert_eq!(exported.transcript, "carried over");
        assert!(exported.session_duration >= Duration::from_secs(12));
    }

    #[tokio::test]
    async fn test_session_duration_frozen_after_stop() {
        let recognizer = Arc::new(FakeRecognizer::new());
        let engine = OnDeviceEngine::new(recognizer.clone(), None);
        engine.start().await.unwrap();
        recognizer
            .emit(RecognizerUpdate::Finalized("done".to_string()))
            .await;
        engine.stop().await.unwrap();

        let frozen = engine.export_state().session_duration;
        sleep(Duration::from_millis(150)).await;
        // idle time after shutdown never counts as session time
        assert_eq!(engine.export_state().session_duration, frozen);
    }

    #[tokio::test]
    async fn test_recognizer_failure_maps_to_error_state() {
        let recognizer = Arc::new(FakeRecognizer::new());
        let engine = OnDeviceEngine::new(recognizer.clone(), None);
        engine.start().await.unwrap();

        recognizer
            .emit(RecognizerUpdate::Failed("model crashed".to_string()))
            .await;
        wait_for(|| matches!(engine.connection_state(), ConnectionState::Error(_))).await;
        assert!(matches!(engine.last_error(), Some(Error::Unavailable(_))));
    }
}
