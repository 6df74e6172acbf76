//! Shared fakes for integration tests: a scripted transport standing in for
//! the cloud WebSocket and a fake platform recognizer.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};

use voxstream::{
    AudioFrame, Error, NativeRecognizer, RecognizerUpdate, Result, Transport, TransportEvent,
    TransportFactory,
};

/// Outbound traffic recorded by the scripted transport
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text(String),
    Binary(Vec<u8>),
}

/// Factory producing scripted in-memory transports.
///
/// Records everything the engine sends; test code injects server events
/// through [`ScriptedFactory::inject`]. With `auto_begin`/`auto_terminate`
/// the fake server acknowledges session begin and terminate on its own.
pub struct ScriptedFactory {
    sent: Arc<Mutex<Vec<Sent>>>,
    server: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    auto_begin: bool,
    auto_terminate: bool,
    connect_failures: Arc<AtomicU32>,
    connections: AtomicU32,
}

impl ScriptedFactory {
    pub fn new(auto_begin: bool, auto_terminate: bool) -> Arc<Self> {
        Arc::new(Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            server: Mutex::new(None),
            auto_begin,
            auto_terminate,
            connect_failures: Arc::new(AtomicU32::new(0)),
            connections: AtomicU32::new(0),
        })
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Inject a raw transport event into the current connection
    pub fn inject(&self, event: TransportEvent) {
        self.server
            .lock()
            .as_ref()
            .expect("no connection to inject into")
            .send(event)
            .expect("connection gone");
    }

    pub fn inject_message(&self, json: impl Into<String>) {
        self.inject(TransportEvent::Message(json.into()));
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Text(t) => Some(t.clone()),
                Sent::Binary(_) => None,
            })
            .collect()
    }

    pub fn binary_count(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|s| matches!(s, Sent::Binary(_)))
            .count()
    }

    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn Transport> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.server.lock() = Some(tx.clone());
        self.connections.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedTransport {
            sent: self.sent.clone(),
            connect_failures: self.connect_failures.clone(),
            server_rx: rx,
            reply_tx: tx,
            auto_begin: self.auto_begin,
            auto_terminate: self.auto_terminate,
            connected: false,
        })
    }
}

pub struct ScriptedTransport {
    sent: Arc<Mutex<Vec<Sent>>>,
    connect_failures: Arc<AtomicU32>,
    server_rx: mpsc::UnboundedReceiver<TransportEvent>,
    reply_tx: mpsc::UnboundedSender<TransportEvent>,
    auto_begin: bool,
    auto_terminate: bool,
    connected: bool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> Result<()> {
        let should_fail = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::ConnectionFailed("scripted connect failure".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        if !self.connected {
            return Err(Error::ConnectionFailed("not connected".to_string()));
        }
        let value: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        self.sent.lock().push(Sent::Text(text));

        if self.auto_begin && value.get("sample_rate").is_some() {
            let _ = self.reply_tx.send(TransportEvent::Message(
                r#"{"type":"Begin","id":"scripted-session","expires_at":1700000000}"#.to_string(),
            ));
        }
        if self.auto_terminate && value.get("terminate_session").is_some() {
            let _ = self.reply_tx.send(TransportEvent::Message(
                r#"{"type":"SessionTerminates","audio_duration_seconds":1.5}"#.to_string(),
            ));
        }
        Ok(())
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        if !self.connected {
            return Err(Error::ConnectionFailed("not connected".to_string()));
        }
        self.sent.lock().push(Sent::Binary(data));
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        match self.server_rx.recv().await {
            Some(event) => event,
            None => TransportEvent::Closed,
        }
    }

    async fn close(&mut self) {
        self.connected = false;
        self.server_rx.close();
    }
}

/// Fake platform recognizer for on-device engine tests
pub struct FakeRecognizer {
    deny: bool,
    updates_tx: Mutex<Option<mpsc::Sender<RecognizerUpdate>>>,
    pushed: Mutex<Vec<AudioFrame>>,
}

impl FakeRecognizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny: false,
            updates_tx: Mutex::new(None),
            pushed: Mutex::new(Vec::new()),
        })
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            updates_tx: Mutex::new(None),
            pushed: Mutex::new(Vec::new()),
        })
    }

    pub async fn emit(&self, update: RecognizerUpdate) {
        let tx = self.updates_tx.lock().clone().expect("recognizer not begun");
        tx.send(update).await.expect("engine driver gone");
    }

    pub fn pushed_frames(&self) -> usize {
        self.pushed.lock().len()
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

/// Poll `cond` until it holds, panicking after ~2 seconds
pub async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub fn turn_json(order: u64, transcript: &str, end_of_turn: bool) -> String {
    format!(
        r#"{{"type":"Turn","turn_order":{order},"transcript":{t},"end_of_turn":{end_of_turn},"turn_is_formatted":false}}"#,
        t = serde_json::to_string(transcript).unwrap(),
    )
}
