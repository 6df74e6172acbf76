//! Engine coordinator: single source of truth for the active engine
//!
//! Holds both adapters, exposes the unified control surface, and
//! orchestrates hot-swap between them. All swap mutations run under one
//! async lock, so the sequence prepare -> stop -> export -> import ->
//! activate -> start is never interleaved and two adapters can never both
//! hold a live connection.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engines::{EngineEvent, SpeechEngine};
use crate::error::{Error, Result};
use crate::types::{AudioFrame, ConnectionState, EngineDescriptor, EngineKind};

/// Capacity of the coordinator's re-published event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Owns both engine adapters and the notion of "active".
///
/// The non-active adapter is always fully stopped: no open transport, no
/// pending turns.
pub struct EngineCoordinator {
    cloud: Arc<dyn SpeechEngine>,
    device: Arc<dyn SpeechEngine>,
    active_kind: Mutex<EngineKind>,
    /// Serializes `switch_to` (held across the whole swap sequence) and the
    /// `start`/`stop` entry points, so neither can revive an adapter
    /// mid-swap
    switch_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<EngineEvent>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl EngineCoordinator {
    pub fn new(
        cloud: Arc<dyn SpeechEngine>,
        device: Arc<dyn SpeechEngine>,
        initial: EngineKind,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let coordinator = Self {
            cloud,
            device,
            active_kind: Mutex::new(initial),
            switch_lock: tokio::sync::Mutex::new(()),
            events,
            forwarder: Mutex::new(None),
        };
        coordinator.engine_for(initial).did_become_active();
        coordinator.spawn_forwarder(initial);
        coordinator
    }

    fn engine_for(&self, kind: EngineKind) -> &Arc<dyn SpeechEngine> {
        match kind {
            EngineKind::Cloud => &self.cloud,
            EngineKind::OnDevice => &self.device,
        }
    }

    fn active(&self) -> Arc<dyn SpeechEngine> {
        self.engine_for(*self.active_kind.lock()).clone()
    }

    pub fn active_kind(&self) -> EngineKind {
        *self.active_kind.lock()
    }

    /// Re-publish the given engine's events on the coordinator channel,
    /// replacing the previous forwarder.
    fn spawn_forwarder(&self, kind: EngineKind) {
        if let Some(old) = self.forwarder.lock().take() {
            old.abort();
        }
        let mut rx = self.engine_for(kind).subscribe();
        let tx = self.events.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = tx.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Event forwarder lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        *self.forwarder.lock() = Some(handle);
    }

    /// Hot-swap the active engine, carrying the accumulated transcript over.
    ///
    /// Suspends across the full sequence; the outgoing adapter is fully
    /// stopped before the incoming one is started. Switching to the
    /// already-active kind is a no-op. Does not resume audio capture — the
    /// capture side keeps pushing frames and the new adapter decides when to
    /// accept them.
    pub async fn switch_to(&self, target: EngineKind) -> Result<()> {
        let _guard = self.switch_lock.lock().await;

        let current = *self.active_kind.lock();
        if current == target {
            debug!("Engine {} already active", target);
            return Ok(());
        }
        info!("Switching engine: {} -> {}", current, target);

        let outgoing = self.engine_for(current).clone();
        let incoming = self.engine_for(target).clone();

        outgoing.prepare_for_transition().await;
        outgoing.stop().await?;
        let snapshot = outgoing.export_state();

        incoming.import_state(snapshot).await;

        *self.active_kind.lock() = target;
        self.spawn_forwarder(target);
        incoming.did_become_active();
        incoming.start().await
    }

    pub async fn start(&self) -> Result<()> {
        let _guard = self.switch_lock.lock().await;
        self.active().start().await
    }

    pub async fn stop(&self) -> Result<()> {
        let _guard = self.switch_lock.lock().await;
        self.active().stop().await
    }

    pub fn clear_transcript(&self) {
        self.active().clear_transcript();
    }

    pub async fn push_audio(&self, frame: AudioFrame) -> Result<()> {
        self.active().push_audio(frame).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.active().connection_state()
    }

    pub fn transcript_text(&self) -> String {
        self.active().transcript_text()
    }

    pub fn last_error(&self) -> Option<Error> {
        self.active().last_error()
    }

    pub fn capabilities(&self) -> EngineDescriptor {
        self.active().capabilities()
    }

    /// Subscribe to the active engine's events, re-published across swaps
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

impl Drop for EngineCoordinator {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
    }
}
