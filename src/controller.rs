//! Call Lifecycle Controller
//!
//! Verbindet die CallEngine mit einer Oberfläche. Alle Engine-Events werden
//! in Empfangsreihenfolge in Status-Texte und Phasen übersetzt und an den
//! `CallObserver` weitergereicht.

use crate::call_engine::{CallEngine, CallEngineError, CallEvent, CallState, ErrorKind};
use crate::gifts::GiftChannelMessage;
use crate::signaling::{CallId, CallRole};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

pub const STATUS_IDLE: &str = "Idle";
pub const STATUS_REQUESTING_MEDIA: &str = "Requesting camera/microphone...";
pub const STATUS_CREATING: &str = "Creating call...";
pub const STATUS_JOINING: &str = "Joining call...";
pub const STATUS_ANSWER_SENT: &str = "Answer sent. Waiting for connection...";
pub const STATUS_ANSWER_RECEIVED: &str = "Answer received. Connecting...";
pub const STATUS_ENDED: &str = "Call ended";
pub const STATUS_START_FAILED: &str = "Failed to start call";
pub const STATUS_ANSWER_FAILED: &str = "Failed to answer call";
pub const STATUS_ENTER_CALL_ID: &str = "Enter a Call ID to answer.";
pub const STATUS_GIFT_NOT_READY: &str =
    "Gift channel is not ready yet, wait for the call to connect.";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Enter a Call ID to answer")]
    EmptyCallId,

    #[error(transparent)]
    Engine(#[from] CallEngineError),
}

// ============================================================================
// OBSERVER
// ============================================================================

/// Phase aus Sicht der Oberfläche
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Idle,
    Creating,
    Joining,
    Connected,
    Ended,
}

/// Callbacks für die Oberfläche
///
/// Werden aus einem einzigen Task heraus aufgerufen, nie gleichzeitig.
pub trait CallObserver: Send + Sync {
    fn on_status_change(&self, status: &str);

    fn on_state_change(&self, phase: LifecyclePhase);

    fn on_gift_received(&self, gift: &GiftChannelMessage);

    fn on_gift_channel_ready(&self, ready: bool);

    fn on_error(&self, kind: ErrorKind, message: &str);
}

// ============================================================================
// CONTROLLER
// ============================================================================

#[derive(Debug)]
struct Progress {
    phase: LifecyclePhase,
    role: Option<CallRole>,
    failed: bool,
}

/// Steuert Anrufe für eine Oberfläche
pub struct CallController {
    engine: Arc<CallEngine>,
    observer: Arc<dyn CallObserver>,
    progress: Arc<Mutex<Progress>>,
    forwarder: JoinHandle<()>,
}

impl CallController {
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden
    pub fn new(engine: CallEngine, observer: Arc<dyn CallObserver>) -> Self {
        let engine = Arc::new(engine);
        let progress = Arc::new(Mutex::new(Progress {
            phase: LifecyclePhase::Idle,
            role: None,
            failed: false,
        }));

        let forwarder = tokio::spawn(forward_events(
            engine.subscribe(),
            Arc::clone(&observer),
            Arc::clone(&progress),
        ));

        observer.on_status_change(STATUS_IDLE);

        Self {
            engine,
            observer,
            progress,
            forwarder,
        }
    }

    pub fn engine(&self) -> &CallEngine {
        &self.engine
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.progress.lock().phase
    }

    pub fn is_gift_channel_ready(&self) -> bool {
        self.engine.is_gift_channel_ready()
    }

    /// Startet einen Anruf und gibt die zu teilende Call-ID zurück
    pub async fn start_call(&self) -> Result<CallId, ControllerError> {
        Ok(self.engine.start_call().await?)
    }

    /// Tritt einem Anruf bei; leere IDs werden abgelehnt, bevor irgendetwas passiert
    pub async fn join_call(&self, call_id: &str) -> Result<(), ControllerError> {
        let call_id = call_id.trim();
        if call_id.is_empty() {
            self.observer.on_status_change(STATUS_ENTER_CALL_ID);
            return Err(ControllerError::EmptyCallId);
        }

        self.engine.answer_call(&CallId::from(call_id)).await?;
        Ok(())
    }

    /// Sendet ein Gift, sofern der Gift-Kanal offen ist
    pub async fn send_gift(&self, gift: &GiftChannelMessage) -> bool {
        if !self.engine.is_gift_channel_ready() {
            self.observer.on_status_change(STATUS_GIFT_NOT_READY);
            return false;
        }
        self.engine.send_gift(gift).await
    }

    pub async fn hang_up(&self) {
        self.engine.hang_up().await;
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Übersetzt Engine-Events in Observer-Aufrufe
async fn forward_events(
    mut events: broadcast::Receiver<CallEvent>,
    observer: Arc<dyn CallObserver>,
    progress: Arc<Mutex<Progress>>,
) {
    let set_phase = |phase: LifecyclePhase| {
        let changed = {
            let mut progress = progress.lock();
            std::mem::replace(&mut progress.phase, phase) != phase
        };
        if changed {
            observer.on_state_change(phase);
        }
    };

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Controller skipped {} call events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            CallEvent::SessionStarted(role) => {
                {
                    let mut progress = progress.lock();
                    progress.role = Some(role);
                    progress.failed = false;
                }
                match role {
                    CallRole::Caller => {
                        set_phase(LifecyclePhase::Creating);
                        observer.on_status_change(STATUS_CREATING);
                    }
                    CallRole::Answerer => {
                        set_phase(LifecyclePhase::Joining);
                        observer.on_status_change(STATUS_JOINING);
                    }
                }
            }
            CallEvent::StateChanged(CallState::AcquiringMedia) => {
                observer.on_status_change(STATUS_REQUESTING_MEDIA);
            }
            CallEvent::StateChanged(CallState::Connected) => {
                set_phase(LifecyclePhase::Connected);
            }
            CallEvent::StateChanged(CallState::Closed) => {
                let failed = progress.lock().failed;
                set_phase(LifecyclePhase::Ended);
                // Eine Fehlermeldung bleibt stehen
                if !failed {
                    observer.on_status_change(STATUS_ENDED);
                }
            }
            CallEvent::StateChanged(_) => {}
            CallEvent::CallCreated(call_id) => {
                observer.on_status_change(&format!("Call created. Share this ID: {}", call_id));
            }
            CallEvent::AnswerSent => observer.on_status_change(STATUS_ANSWER_SENT),
            CallEvent::AnswerReceived => observer.on_status_change(STATUS_ANSWER_RECEIVED),
            CallEvent::ConnectionStateChanged(state) => {
                observer.on_status_change(&format!("Connection state: {}", state));
            }
            CallEvent::RemoteTrackAdded(track) => {
                tracing::debug!("Remote {:?} track {}", track.kind(), track.id());
            }
            CallEvent::GiftChannelReady(ready) => observer.on_gift_channel_ready(ready),
            CallEvent::GiftReceived(gift) => observer.on_gift_received(&gift),
            CallEvent::Error { kind, message } => {
                let role = {
                    let mut progress = progress.lock();
                    progress.failed = true;
                    progress.role
                };
                observer.on_error(kind, &message);
                observer.on_status_change(match role {
                    Some(CallRole::Answerer) => STATUS_ANSWER_FAILED,
                    _ => STATUS_START_FAILED,
                });
            }
        }
    }
}
