//! Cloud streaming engine
//!
//! Composes a transport, the protocol codec, and the session state machine
//! behind the [`SpeechEngine`] contract. One driver task owns the state
//! machine and serializes every input: transport events, audio frames, stop
//! requests, and timer expiries are processed one at a time, to completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol;
use crate::session::{SessionAction, SessionInput, SessionPhase, SessionStateMachine};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::{
    AudioFrame, ConnectionState, EngineDescriptor, EngineKind, EngineState, SessionConfig,
};

use super::{EngineEvent, Observables, Progress, SpeechEngine, descriptor};

/// Bound on connection establishment and on the session-begin
/// acknowledgment. The protocol itself specifies no such timeout; without
/// one an unresponsive server would stall `Connecting`/`AwaitingBegin`
/// forever.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the termination acknowledgment before forcing close
const TERMINATION_GRACE: Duration = Duration::from_secs(3);

/// Connection attempts (initial + retries) before surfacing the failure
const MAX_CONNECT_ATTEMPTS: u32 = 3;

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Audio frames buffered between the capture side and the driver task.
/// A full buffer drops frames rather than stalling capture.
const AUDIO_BUFFER_FRAMES: usize = 64;

#[derive(Debug)]
enum Control {
    Stop,
}

struct Shared {
    obs: Observables,
    progress: Mutex<Progress>,
    accepting_audio: AtomicBool,
}

/// WebSocket-streamed cloud transcription engine
pub struct CloudEngine {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    shared: Arc<Shared>,
    control_tx: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    audio_tx: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CloudEngine {
    pub fn new(config: SessionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            config,
            factory,
            shared: Arc::new(Shared {
                obs: Observables::new(),
                progress: Mutex::new(Progress::new()),
                accepting_audio: AtomicBool::new(false),
            }),
            control_tx: Mutex::new(None),
            audio_tx: Mutex::new(None),
            driver: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl SpeechEngine for CloudEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Cloud
    }

    fn capabilities(&self) -> EngineDescriptor {
        descriptor(EngineKind::Cloud)
    }

    async fn start(&self) -> Result<()> {
        let state = self.shared.obs.state();
        if state.is_live() || state == ConnectionState::Connecting {
            return Err(Error::Unavailable("engine already started".to_string()));
        }
        // a previous session's error is history once a new one starts
        self.shared.obs.clear_error();
        self.shared.obs.set_state(ConnectionState::Disconnected);

        if let Some(stale) = self.driver.lock().await.take() {
            stale.abort();
        }

        let state_rx = self.shared.obs.watch_state();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_BUFFER_FRAMES);
        *self.control_tx.lock() = Some(control_tx);
        *self.audio_tx.lock() = Some(audio_tx);
        self.shared.accepting_audio.store(true, Ordering::SeqCst);

        let driver = Driver {
            config: self.config.clone(),
            factory: self.factory.clone(),
            shared: self.shared.clone(),
            machine: SessionStateMachine::new(self.config.clone()),
            control_rx,
            audio_rx,
            synced_len: 0,
            synced_turns: 0,
            attempts: 0,
            streamed: false,
            deadline: None,
            audio_closed: false,
            control_closed: false,
        };
        *self.driver.lock().await = Some(tokio::spawn(driver.run()));

        let outcome = Observables::await_start_outcome(
            state_rx,
            Error::ConnectionFailed("engine task exited".to_string()),
        )
        .await;
        outcome.map_err(|e| self.shared.obs.last_error().unwrap_or(e))
    }

    async fn stop(&self) -> Result<()> {
        self.shared.accepting_audio.store(false, Ordering::SeqCst);
        if let Some(tx) = self.control_tx.lock().take() {
            let _ = tx.send(Control::Stop);
        }
        *self.audio_tx.lock() = None;
        if let Some(handle) = self.driver.lock().await.take() {
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
        let tx = self.audio_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.try_send(frame).is_err() {
                debug!("Audio buffer full, dropping frame");
            }
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
        debug!("Cloud engine preparing for transition");
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
        debug!("Cloud engine is now the active adapter");
        self.shared.accepting_audio.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    /// Waiting for the session-begin acknowledgment
    Begin,
    /// Waiting for the termination acknowledgment
    Grace,
}

enum ConnectionOutcome {
    /// Driver is finished; terminal state already published
    Done,
    /// Retryable failure; reconnect after the given backoff
    Retry(Duration),
}

enum Step {
    Control(Option<Control>),
    Deadline,
    Transport(TransportEvent),
    Audio(Option<AudioFrame>),
}

/// Owns the session state machine and the transport for the lifetime of one
/// `start()`; the only place machine inputs are applied.
struct Driver {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    shared: Arc<Shared>,
    machine: SessionStateMachine,
    control_rx: mpsc::UnboundedReceiver<Control>,
    audio_rx: mpsc::Receiver<AudioFrame>,
    /// Machine transcript length already folded into shared progress
    synced_len: usize,
    synced_turns: usize,
    attempts: u32,
    streamed: bool,
    deadline: Option<(Instant, DeadlineKind)>,
    audio_closed: bool,
    /// Latched once the control channel closes; the stop it signals is
    /// issued exactly once and the channel is never polled again
    control_closed: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            match self.run_connection().await {
                ConnectionOutcome::Done => return,
                ConnectionOutcome::Retry(delay) => {
                    warn!("Reconnecting in {:?} (attempt {})", delay, self.attempts + 1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.control_rx.recv() => {
                            self.shared.progress.lock().stop_clock();
                            self.shared.obs.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                    // finalized text is already folded into shared progress;
                    // the machine restarts clean for the new session
                    self.machine.handle(SessionInput::Reset);
                    self.synced_len = 0;
                    self.synced_turns = 0;
                    self.streamed = false;
                    self.deadline = None;
                    self.audio_closed = false;
                }
            }
        }
    }

    async fn run_connection(&mut self) -> ConnectionOutcome {
        self.machine.handle(SessionInput::StartRequested);
        self.shared.obs.set_state(ConnectionState::Connecting);
        let mut transport = self.factory.create();

        let connect_result = tokio::select! {
            biased;
            _ = self.control_rx.recv() => {
                self.machine.handle(SessionInput::StopRequested);
                self.shared.progress.lock().stop_clock();
                self.shared.obs.set_state(ConnectionState::Disconnected);
                return ConnectionOutcome::Done;
            }
            result = timeout(CONNECT_TIMEOUT, transport.connect()) => match result {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout("connection")),
            }
        };
        if let Err(e) = connect_result {
            self.machine.handle(SessionInput::TransportFailed(e.to_string()));
            return self.failure_outcome(e);
        }

        let actions = self.machine.handle(SessionInput::TransportConnected);
        if let Err(e) = self.execute(&mut transport, actions).await {
            return self.failure_outcome(e);
        }
        self.deadline = Some((Instant::now() + CONNECT_TIMEOUT, DeadlineKind::Begin));
        self.streamed = false;

        loop {
            self.publish_progress();
            self.sync_state();
            if let Some(outcome) = self.check_terminal(&mut transport).await {
                return outcome;
            }

            let deadline_at = self
                .deadline
                .map(|(at, _)| at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let step = tokio::select! {
                biased;
                ctrl = self.control_rx.recv(), if !self.control_closed => Step::Control(ctrl),
                _ = tokio::time::sleep_until(deadline_at), if self.deadline.is_some() => Step::Deadline,
                event = transport.next_event() => Step::Transport(event),
                frame = self.audio_rx.recv(),
                    if self.machine.can_stream() && !self.audio_closed => Step::Audio(frame),
            };

            let step_result = match step {
                // a dropped control channel means the engine is going away;
                // signalled once, then the channel is left alone so the
                // transport and timer branches can finish the shutdown
                Step::Control(ctrl) => {
                    if ctrl.is_none() {
                        self.control_closed = true;
                    }
                    let actions = self.machine.handle(SessionInput::StopRequested);
                    self.execute(&mut transport, actions).await
                }
                Step::Deadline => {
                    let (_, kind) = self.deadline.take().unwrap_or((Instant::now(), DeadlineKind::Begin));
                    match kind {
                        DeadlineKind::Begin => {
                            self.machine.handle(SessionInput::TimedOut("session begin"));
                            Ok(())
                        }
                        DeadlineKind::Grace => {
                            let actions = self.machine.handle(SessionInput::GraceExpired);
                            self.execute(&mut transport, actions).await
                        }
                    }
                }
                Step::Transport(event) => self.handle_transport_event(&mut transport, event).await,
                Step::Audio(None) => {
                    self.audio_closed = true;
                    Ok(())
                }
                Step::Audio(Some(frame)) => {
                    if self.shared.accepting_audio.load(Ordering::SeqCst) {
                        match transport.send_binary(frame).await {
                            Ok(()) => {
                                self.streamed = true;
                                Ok(())
                            }
                            Err(e) => {
                                self.machine
                                    .handle(SessionInput::TransportFailed(e.to_string()));
                                Ok(())
                            }
                        }
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(e) = step_result {
                return self.failure_outcome(e);
            }
        }
    }

    async fn handle_transport_event(
        &mut self,
        transport: &mut Box<dyn Transport>,
        event: TransportEvent,
    ) -> Result<()> {
        let input = match event {
            TransportEvent::Message(text) => match protocol::decode(&text) {
                Ok(event) => SessionInput::Inbound(event),
                Err(e) => SessionInput::DecodeFailed(e),
            },
            TransportEvent::Closed => SessionInput::TransportClosed,
            TransportEvent::Failed(detail) => SessionInput::TransportFailed(detail),
        };

        let violations_before = self.machine.protocol_error_count();
        let actions = self.machine.handle(input);

        if self.machine.protocol_error_count() > violations_before
            && !self.machine.phase().is_terminal()
        {
            // drop-and-continue: recorded for observers, session keeps going
            self.shared.obs.record_error(Error::Protocol(
                "malformed or out-of-order message dropped".to_string(),
            ));
        }

        // session became active: begin deadline is met
        if matches!(self.machine.phase(), SessionPhase::Active)
            && matches!(self.deadline, Some((_, DeadlineKind::Begin)))
        {
            self.deadline = None;
            self.attempts = 0;
            let mut progress = self.shared.progress.lock();
            if progress.started_at.is_none() {
                progress.started_at = Some(std::time::Instant::now());
            }
            if let Some(session) = self.machine.session() {
                progress
                    .extras
                    .insert("cloud.session_id".to_string(), session.id.clone());
            }
        }

        self.execute(transport, actions).await
    }

    async fn execute(
        &mut self,
        transport: &mut Box<dyn Transport>,
        actions: Vec<SessionAction>,
    ) -> Result<()> {
        for action in actions {
            match action {
                // connects are sequenced by run_connection itself
                SessionAction::Connect => {}
                SessionAction::SendSessionBegin => {
                    let frame = protocol::encode_session_begin(&self.config)?;
                    transport.send_text(frame).await?;
                }
                SessionAction::SendTerminate => {
                    // best effort; the grace timer covers a dead link
                    if let Err(e) = transport
                        .send_text(protocol::encode_session_terminate())
                        .await
                    {
                        warn!("Failed to send terminate request: {}", e);
                    }
                }
                SessionAction::StartGraceTimer => {
                    self.deadline = Some((Instant::now() + TERMINATION_GRACE, DeadlineKind::Grace));
                }
                SessionAction::CloseTransport => {
                    transport.close().await;
                }
            }
        }
        Ok(())
    }

    /// Fold newly finalized machine turns into the shared transcript and
    /// notify subscribers, preserving transition order.
    fn publish_progress(&mut self) {
        let turns = self.machine.turns();
        if turns.len() > self.synced_turns {
            for turn in &turns[self.synced_turns..] {
                self.shared
                    .obs
                    .publish(EngineEvent::TurnFinalized(turn.clone()));
            }
            self.synced_turns = turns.len();
        }

        let transcript = self.machine.transcript();
        if transcript.len() > self.synced_len {
            let delta = transcript[self.synced_len..].to_string();
            self.synced_len = transcript.len();
            let full = {
                let mut progress = self.shared.progress.lock();
                progress.transcript.push_str(&delta);
                progress.last_activity = Utc::now();
                progress.transcript.clone()
            };
            self.shared
                .obs
                .publish(EngineEvent::TranscriptChanged(full));
        }
    }

    fn sync_state(&self) {
        let state = match self.machine.phase() {
            SessionPhase::Closed => ConnectionState::Disconnected,
            SessionPhase::Connecting | SessionPhase::AwaitingBegin => ConnectionState::Connecting,
            SessionPhase::Active => {
                if self.streamed {
                    ConnectionState::Streaming
                } else {
                    ConnectionState::Connected
                }
            }
            SessionPhase::Terminating => ConnectionState::Connected,
            // Idle is transient inside the driver; Failed is published by
            // failure_outcome once retries are exhausted
            SessionPhase::Idle | SessionPhase::Failed(_) => return,
        };
        self.shared.obs.set_state(state);
    }

    async fn check_terminal(
        &mut self,
        transport: &mut Box<dyn Transport>,
    ) -> Option<ConnectionOutcome> {
        match self.machine.phase().clone() {
            SessionPhase::Closed => {
                transport.close().await;
                info!("Session closed: {:?}", self.machine.completion());
                self.shared.progress.lock().stop_clock();
                self.shared.obs.set_state(ConnectionState::Disconnected);
                Some(ConnectionOutcome::Done)
            }
            SessionPhase::Failed(error) => {
                transport.close().await;
                Some(self.failure_outcome(error))
            }
            _ => None,
        }
    }

    fn failure_outcome(&mut self, error: Error) -> ConnectionOutcome {
        self.attempts += 1;
        if error.is_retryable() && self.attempts < MAX_CONNECT_ATTEMPTS {
            let backoff = RETRY_BACKOFF_BASE * 2u32.pow(self.attempts - 1);
            return ConnectionOutcome::Retry(backoff);
        }
        warn!("Cloud engine giving up: {}", error);
        self.shared.progress.lock().stop_clock();
        self.shared.obs.record_error(error.clone());
        self.shared
            .obs
            .set_state(ConnectionState::Error(error.to_string()));
        ConnectionOutcome::Done
    }
}
