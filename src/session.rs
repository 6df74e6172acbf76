//! Session state machine for the cloud streaming engine
//!
//! Pure and I/O-free: the owning engine feeds [`SessionInput`]s in and
//! executes the returned [`SessionAction`]s (connect, send a frame, arm the
//! grace timer, close the transport). One input is processed to completion
//! before the next, so the machine never sees concurrent mutation.
//!
//! Lifecycle: `Idle -> Connecting -> AwaitingBegin -> Active -> Terminating
//! -> Closed`, with an absorbing `Failed(reason)` reachable from any
//! non-terminal state and `Closed | Failed -> Idle` on reset.
//!
//! The `AwaitingBegin` gate exists because sending audio before the server
//! acknowledges sample-rate/format negotiation silently degrades
//! transcription quality; the engine must not forward frames until the
//! machine reports `Active`.

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::protocol::{DecodeError, ProtocolEvent, TurnEvent};
use crate::types::{Session, SessionConfig, Turn};

/// Protocol violations tolerated per session before the machine fails.
///
/// A single garbled or out-of-order message is dropped and logged; a stream
/// of them means the connection is no longer trustworthy.
pub const PROTOCOL_ERROR_BUDGET: u32 = 5;

/// Lifecycle phase of one cloud session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    AwaitingBegin,
    Active,
    Terminating,
    Closed,
    Failed(Error),
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Closed | SessionPhase::Failed(_))
    }
}

/// How a session reached `Closed`
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionReason {
    /// Server acknowledged termination
    Graceful { audio_duration_seconds: Option<f64> },
    /// Grace timer expired before the termination acknowledgment arrived
    ForcedClose,
    /// Stopped before the session ever became active
    StoppedEarly,
}

/// Everything the outside world can tell the machine
#[derive(Debug)]
pub enum SessionInput {
    StartRequested,
    TransportConnected,
    Inbound(ProtocolEvent),
    DecodeFailed(DecodeError),
    TransportClosed,
    TransportFailed(String),
    StopRequested,
    GraceExpired,
    /// A driver-side deadline (connect or begin acknowledgment) elapsed
    TimedOut(&'static str),
    Reset,
}

/// Effects the owning engine must execute after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Connect,
    SendSessionBegin,
    SendTerminate,
    StartGraceTimer,
    CloseTransport,
}

/// Per-connection state machine driving session lifecycle and turn
/// accumulation.
#[derive(Debug)]
pub struct SessionStateMachine {
    config: SessionConfig,
    phase: SessionPhase,
    session: Option<Session>,
    turns: Vec<Turn>,
    open_turn: Option<Turn>,
    transcript: String,
    protocol_errors: u32,
    completion: Option<CompletionReason>,
    last_activity: DateTime<Utc>,
}

impl SessionStateMachine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            phase: SessionPhase::Idle,
            session: None,
            turns: Vec::new(),
            open_turn: None,
            transcript: String::new(),
            protocol_errors: 0,
            completion: None,
            last_activity: Utc::now(),
        }
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Finalized turns accepted into the running transcript, in order
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn open_turn(&self) -> Option<&Turn> {
        self.open_turn.as_ref()
    }

    /// Running transcript: concatenation of finalized turn texts
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn completion(&self) -> Option<&CompletionReason> {
        self.completion.as_ref()
    }

    pub fn protocol_error_count(&self) -> u32 {
        self.protocol_errors
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Audio frames may only be forwarded while this returns true
    pub fn can_stream(&self) -> bool {
        matches!(self.phase, SessionPhase::Active)
    }

    /// Process one input to completion, returning the effects to execute.
    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionAction> {
        match input {
            SessionInput::StartRequested => self.on_start(),
            SessionInput::TransportConnected => self.on_transport_connected(),
            SessionInput::Inbound(event) => self.on_inbound(event),
            SessionInput::DecodeFailed(error) => {
                warn!("Dropping undecodable frame: {}", error);
                self.record_protocol_error()
            }
            SessionInput::TransportClosed => self.on_transport_closed(),
            SessionInput::TransportFailed(detail) => {
                self.fail(Error::ConnectionFailed(detail))
            }
            SessionInput::StopRequested => self.on_stop(),
            SessionInput::GraceExpired => self.on_grace_expired(),
            SessionInput::TimedOut(what) => self.fail(Error::Timeout(what)),
            SessionInput::Reset => self.on_reset(),
        }
    }

    fn on_start(&mut self) -> Vec<SessionAction> {
        match self.phase {
            SessionPhase::Idle => {
                info!("Session starting");
                self.phase = SessionPhase::Connecting;
                vec![SessionAction::Connect]
            }
            ref other => {
                warn!("Ignoring start request in phase {:?}", other);
                vec![]
            }
        }
    }

    fn on_transport_connected(&mut self) -> Vec<SessionAction> {
        match self.phase {
            SessionPhase::Connecting => {
                debug!("Transport connected, negotiating session");
                self.phase = SessionPhase::AwaitingBegin;
                vec![SessionAction::SendSessionBegin]
            }
            ref other => {
                warn!("Ignoring transport-connected signal in phase {:?}", other);
                vec![]
            }
        }
    }

    fn on_inbound(&mut self, event: ProtocolEvent) -> Vec<SessionAction> {
        match event {
            ProtocolEvent::SessionBegins { id, expires_at } => self.on_session_begins(id, expires_at),
            ProtocolEvent::Turn(turn) => self.on_turn(turn),
            ProtocolEvent::SessionTerminates {
                audio_duration_seconds,
            } => self.on_session_terminates(audio_duration_seconds),
            ProtocolEvent::Error { message, code } => {
                self.fail(Error::Server { code, message })
            }
        }
    }

    fn on_session_begins(&mut self, id: String, expires_at: i64) -> Vec<SessionAction> {
        match self.phase {
            SessionPhase::AwaitingBegin => {
                let expires_at = Utc
                    .timestamp_opt(expires_at, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                info!("Session {} active, expires at {}", id, expires_at);
                self.session = Some(Session {
                    id,
                    expires_at,
                    sample_rate: self.config.sample_rate,
                    language: self.config.language.clone(),
                });
                self.phase = SessionPhase::Active;
                self.last_activity = Utc::now();
                vec![]
            }
            ref other => {
                warn!("Unexpected session-begin in phase {:?}", other);
                self.record_protocol_error()
            }
        }
    }

    fn on_turn(&mut self, event: TurnEvent) -> Vec<SessionAction> {
        match self.phase {
            SessionPhase::Active => self.apply_turn(event),
            // Turns racing a terminate request are expected, not violations
            SessionPhase::Terminating => {
                debug!("Dropping turn received while terminating");
                vec![]
            }
            ref other => {
                warn!("Unexpected turn in phase {:?}", other);
                self.record_protocol_error()
            }
        }
    }

    /// Accept, update, or reject one turn event.
    ///
    /// Contiguity is the core guarantee: with no open turn, only
    /// `last_accepted + 1` may start a new one (the first accepted turn
    /// establishes the base ordinal, since servers start numbering at 0 or 1
    /// depending on protocol generation). An event matching the open turn's
    /// ordinal updates it in place until `end_of_turn` seals it. Anything
    /// else is dropped and counted against the protocol-error budget.
    fn apply_turn(&mut self, event: TurnEvent) -> Vec<SessionAction> {
        let last_final = self.turns.last().map(|t| t.order);
        let implied_order = match &self.open_turn {
            Some(open) => open.order,
            None => last_final.map(|o| o.saturating_add(1)).unwrap_or(0),
        };
        let order = event.order.unwrap_or(implied_order);

        if let Some(open) = self.open_turn.as_mut() {
            if order != open.order {
                warn!(
                    "Out-of-order turn {} while turn {} is open; dropping",
                    order, open.order
                );
                return self.record_protocol_error();
            }
            open.transcript = event.transcript;
            open.words = event.words;
            open.is_formatted = event.is_formatted;
            open.confidence = event.confidence;
            open.end_of_turn_confidence = event.end_of_turn_confidence;
            open.end_of_turn = event.end_of_turn;
            if event.end_of_turn {
                self.finalize_open_turn();
            }
            return vec![];
        }

        // checked: an exhausted ordinal space can never admit another turn
        let contiguous = match last_final {
            None => true,
            Some(last) => last.checked_add(1) == Some(order),
        };
        if !contiguous {
            warn!(
                "Out-of-order turn {} (last accepted {:?}); dropping",
                order, last_final
            );
            return self.record_protocol_error();
        }

        let turn = Turn {
            order,
            transcript: event.transcript,
            words: event.words,
            end_of_turn: event.end_of_turn,
            is_formatted: event.is_formatted,
            confidence: event.confidence,
            end_of_turn_confidence: event.end_of_turn_confidence,
        };
        self.open_turn = Some(turn);
        if event.end_of_turn {
            self.finalize_open_turn();
        } else {
            self.last_activity = Utc::now();
        }
        vec![]
    }

    fn finalize_open_turn(&mut self) {
        if let Some(turn) = self.open_turn.take() {
            debug!("Turn {} finalized: {:?}", turn.order, turn.transcript);
            self.transcript.push_str(&turn.transcript);
            self.turns.push(turn);
            self.last_activity = Utc::now();
        }
    }

    fn on_session_terminates(
        &mut self,
        audio_duration_seconds: Option<f64>,
    ) -> Vec<SessionAction> {
        match self.phase {
            SessionPhase::Terminating => {
                info!(
                    "Session terminated gracefully ({:?}s of audio)",
                    audio_duration_seconds
                );
                self.phase = SessionPhase::Closed;
                self.completion = Some(CompletionReason::Graceful {
                    audio_duration_seconds,
                });
                vec![SessionAction::CloseTransport]
            }
            ref other => {
                warn!("Unexpected session-terminates in phase {:?}", other);
                self.record_protocol_error()
            }
        }
    }

    fn on_stop(&mut self) -> Vec<SessionAction> {
        match self.phase {
            SessionPhase::Active => {
                // Open turn content must survive the shutdown
                if let Some(open) = self.open_turn.as_mut() {
                    open.end_of_turn = true;
                    self.finalize_open_turn();
                }
                info!("Stop requested, terminating session");
                self.phase = SessionPhase::Terminating;
                vec![SessionAction::SendTerminate, SessionAction::StartGraceTimer]
            }
            SessionPhase::Connecting | SessionPhase::AwaitingBegin => {
                info!("Stop requested before session became active");
                self.phase = SessionPhase::Closed;
                self.completion = Some(CompletionReason::StoppedEarly);
                vec![SessionAction::CloseTransport]
            }
            SessionPhase::Idle
            | SessionPhase::Terminating
            | SessionPhase::Closed
            | SessionPhase::Failed(_) => vec![],
        }
    }

    fn on_grace_expired(&mut self) -> Vec<SessionAction> {
        match self.phase {
            SessionPhase::Terminating => {
                warn!("Termination grace timer expired, forcing close");
                self.phase = SessionPhase::Closed;
                self.completion = Some(CompletionReason::ForcedClose);
                vec![SessionAction::CloseTransport]
            }
            _ => vec![],
        }
    }

    fn on_transport_closed(&mut self) -> Vec<SessionAction> {
        match self.phase {
            // The server may drop the socket instead of acknowledging
            SessionPhase::Terminating => {
                debug!("Transport closed during termination");
                self.phase = SessionPhase::Closed;
                self.completion = Some(CompletionReason::ForcedClose);
                vec![]
            }
            SessionPhase::Connecting | SessionPhase::AwaitingBegin | SessionPhase::Active => {
                self.fail(Error::ConnectionFailed("connection closed".to_string()))
            }
            SessionPhase::Idle | SessionPhase::Closed | SessionPhase::Failed(_) => vec![],
        }
    }

    fn on_reset(&mut self) -> Vec<SessionAction> {
        match self.phase {
            SessionPhase::Closed | SessionPhase::Failed(_) => {
                debug!("Session machine reset");
                self.phase = SessionPhase::Idle;
                self.session = None;
                self.turns.clear();
                self.open_turn = None;
                self.transcript.clear();
                self.protocol_errors = 0;
                self.completion = None;
                vec![]
            }
            ref other => {
                warn!("Ignoring reset in phase {:?}", other);
                vec![]
            }
        }
    }

    fn record_protocol_error(&mut self) -> Vec<SessionAction> {
        self.protocol_errors += 1;
        if self.protocol_errors > PROTOCOL_ERROR_BUDGET && !self.phase.is_terminal() {
            return self.fail(Error::Protocol(format!(
                "{} protocol violations in one session",
                self.protocol_errors
            )));
        }
        vec![]
    }

    fn fail(&mut self, error: Error) -> Vec<SessionAction> {
        if self.phase.is_terminal() {
            return vec![];
        }
        warn!("Session failed: {}", error);
        self.phase = SessionPhase::Failed(error);
        vec![SessionAction::CloseTransport]
    }
}
