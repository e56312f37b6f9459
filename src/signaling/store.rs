//! Abstrakte Schnittstelle zum geteilten Signaling-Store
//!
//! Der Store ist eine Dokument-Datenbank mit Call-Records und zwei
//! Append-only Candidate-Collections pro Call. Alle Operationen sind
//! asynchron und können mit einem Verbindungsfehler scheitern.

use super::records::{CallId, CallRecord, CandidateSide, IceCandidate, SessionDescription};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Signaling store unavailable: {0}")]
    Unavailable(String),

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("offer not found")]
    OfferNotFound,

    #[error("Offer already exists for call {0}")]
    DuplicateOffer(String),

    #[error("Answer already exists for call {0}")]
    DuplicateAnswer(String),

    #[error("Invalid record in store: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for SignalingError {
    fn from(e: rusqlite::Error) -> Self {
        SignalingError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(e: serde_json::Error) -> Self {
        SignalingError::Serialization(e.to_string())
    }
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// Meldet einen Listener beim Store ab. Wird beim Drop automatisch ausgelöst.
pub struct CancelHandle(Option<Box<dyn FnOnce() + Send + Sync>>);

impl CancelHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    /// Handle ohne Aufräumarbeit
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("active", &self.0.is_some())
            .finish()
    }
}

/// Laufendes Abonnement: Empfänger plus explizites Abmelden
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancel: CancelHandle,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, cancel: CancelHandle) -> Self {
        Self { rx, cancel }
    }

    /// Wartet auf die nächste Änderung. `None` sobald abgemeldet.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Nicht-blockierend: nächste bereits zugestellte Änderung
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Trennt Empfänger und Abmelde-Handle, z.B. um den Empfänger in einen Task zu verschieben
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<T>, CancelHandle) {
        (self.rx, self.cancel)
    }

    pub fn cancel(self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Geteilter Dokument-Store für Offer/Answer/Candidates
///
/// Offer und Answer sind jeweils genau einmal schreibbar; doppelte Writes
/// werden abgelehnt statt überschrieben.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Legt einen neuen, leeren Call-Record an
    async fn create_call_record(&self) -> Result<CallId, SignalingError>;

    async fn get_call_record(&self, id: &CallId) -> Result<Option<CallRecord>, SignalingError>;

    /// Schreibt das Offer (scheitert, wenn bereits eins existiert)
    async fn set_offer(&self, id: &CallId, offer: SessionDescription)
        -> Result<(), SignalingError>;

    /// Schreibt das Answer (scheitert ohne Offer oder bei vorhandenem Answer)
    async fn set_answer(
        &self,
        id: &CallId,
        answer: SessionDescription,
    ) -> Result<(), SignalingError>;

    async fn append_candidate(
        &self,
        id: &CallId,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError>;

    /// Liefert zuerst den aktuellen Stand, danach jede Änderung
    async fn subscribe_call_record(
        &self,
        id: &CallId,
    ) -> Result<Subscription<CallRecord>, SignalingError>;

    /// Liefert zuerst alle vorhandenen Candidates, danach jeden neuen (at-least-once)
    async fn subscribe_candidates(
        &self,
        id: &CallId,
        side: CandidateSide,
    ) -> Result<Subscription<IceCandidate>, SignalingError>;
}
