//! In-Process Signaling-Store
//!
//! Hält alle Call-Records im Speicher und benachrichtigt Listener synchron
//! beim Schreiben. Für Tests und Demos mit beiden Teilnehmern im selben Prozess.

use super::records::{
    CallId, CallRecord, CallRole, CallStatus, CandidateSide, IceCandidate, SessionDescription,
};
use super::store::{CancelHandle, SignalingError, SignalingStore, Subscription};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

// ============================================================================
// INTERNAL STATE
// ============================================================================

#[derive(Default)]
struct CallEntry {
    record: Option<CallRecord>,
    offerer_candidates: Vec<IceCandidate>,
    answerer_candidates: Vec<IceCandidate>,
    record_listeners: Vec<(u64, mpsc::UnboundedSender<CallRecord>)>,
    offerer_listeners: Vec<(u64, mpsc::UnboundedSender<IceCandidate>)>,
    answerer_listeners: Vec<(u64, mpsc::UnboundedSender<IceCandidate>)>,
}

impl CallEntry {
    fn candidates(&mut self, side: CandidateSide) -> &mut Vec<IceCandidate> {
        match side {
            CandidateSide::Offerer => &mut self.offerer_candidates,
            CandidateSide::Answerer => &mut self.answerer_candidates,
        }
    }

    fn candidate_listeners(
        &mut self,
        side: CandidateSide,
    ) -> &mut Vec<(u64, mpsc::UnboundedSender<IceCandidate>)> {
        match side {
            CandidateSide::Offerer => &mut self.offerer_listeners,
            CandidateSide::Answerer => &mut self.answerer_listeners,
        }
    }

    fn notify_record(&mut self) {
        if let Some(record) = &self.record {
            self.record_listeners
                .retain(|(_, tx)| tx.send(record.clone()).is_ok());
        }
    }
}

#[derive(Default)]
struct StoreInner {
    calls: Mutex<HashMap<CallId, CallEntry>>,
    next_listener: AtomicU64,
    unavailable: AtomicBool,
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// Signaling-Store im Speicher (klonbar, alle Klone teilen denselben Zustand)
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simuliert einen Verbindungsabbruch zum Store
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Anzahl der Candidates in einer Collection (für Diagnose und Tests)
    pub fn candidate_count(&self, id: &CallId, side: CandidateSide) -> usize {
        self.inner
            .calls
            .lock()
            .get_mut(id)
            .map(|entry| entry.candidates(side).len())
            .unwrap_or(0)
    }

    /// Anzahl aktiver Listener auf einem Call (Record + beide Collections)
    pub fn listener_count(&self, id: &CallId) -> usize {
        self.inner
            .calls
            .lock()
            .get(id)
            .map(|entry| {
                entry.record_listeners.len()
                    + entry.offerer_listeners.len()
                    + entry.answerer_listeners.len()
            })
            .unwrap_or(0)
    }

    /// Schließt alle Abonnements eines Calls, wie bei einem Verbindungsabbruch
    pub fn disconnect_subscribers(&self, id: &CallId) {
        if let Some(entry) = self.inner.calls.lock().get_mut(id) {
            entry.record_listeners.clear();
            entry.offerer_listeners.clear();
            entry.answerer_listeners.clear();
        }
    }

    fn ensure_available(&self) -> Result<(), SignalingError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(SignalingError::Unavailable(
                "memory store offline".to_string(),
            ));
        }
        Ok(())
    }

    fn listener_id(&self) -> u64 {
        self.inner.next_listener.fetch_add(1, Ordering::Relaxed)
    }

    fn cancel_handle(
        &self,
        id: &CallId,
        listener: u64,
        remove: fn(&mut CallEntry, u64),
    ) -> CancelHandle {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let id = id.clone();
        CancelHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(entry) = inner.calls.lock().get_mut(&id) {
                    remove(entry, listener);
                }
            }
        })
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn create_call_record(&self) -> Result<CallId, SignalingError> {
        self.ensure_available()?;
        let id = CallId::generate();
        let entry = CallEntry {
            record: Some(CallRecord::new(id.clone())),
            ..Default::default()
        };
        self.inner.calls.lock().insert(id.clone(), entry);
        tracing::debug!("Created call record {}", id);
        Ok(id)
    }

    async fn get_call_record(&self, id: &CallId) -> Result<Option<CallRecord>, SignalingError> {
        self.ensure_available()?;
        Ok(self
            .inner
            .calls
            .lock()
            .get(id)
            .and_then(|entry| entry.record.clone()))
    }

    async fn set_offer(
        &self,
        id: &CallId,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.ensure_available()?;
        let mut calls = self.inner.calls.lock();
        let entry = calls
            .get_mut(id)
            .ok_or_else(|| SignalingError::CallNotFound(id.to_string()))?;
        let record = entry
            .record
            .as_mut()
            .ok_or_else(|| SignalingError::CallNotFound(id.to_string()))?;

        if record.offer.is_some() {
            return Err(SignalingError::DuplicateOffer(id.to_string()));
        }

        record.offer = Some(offer);
        record.offered_by = Some(CallRole::Caller);
        record.status = CallStatus::Offered;
        entry.notify_record();
        Ok(())
    }

    async fn set_answer(
        &self,
        id: &CallId,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.ensure_available()?;
        let mut calls = self.inner.calls.lock();
        let entry = calls
            .get_mut(id)
            .ok_or_else(|| SignalingError::CallNotFound(id.to_string()))?;
        let record = entry
            .record
            .as_mut()
            .ok_or_else(|| SignalingError::CallNotFound(id.to_string()))?;

        if record.offer.is_none() {
            return Err(SignalingError::OfferNotFound);
        }
        if record.answer.is_some() {
            return Err(SignalingError::DuplicateAnswer(id.to_string()));
        }

        record.answer = Some(answer);
        record.answered_by = Some(CallRole::Answerer);
        record.answered_at = Some(Utc::now());
        record.status = CallStatus::Answered;
        entry.notify_record();
        Ok(())
    }

    async fn append_candidate(
        &self,
        id: &CallId,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.ensure_available()?;
        let mut calls = self.inner.calls.lock();
        let entry = calls
            .get_mut(id)
            .ok_or_else(|| SignalingError::CallNotFound(id.to_string()))?;

        entry.candidates(side).push(candidate.clone());
        entry
            .candidate_listeners(side)
            .retain(|(_, tx)| tx.send(candidate.clone()).is_ok());
        Ok(())
    }

    async fn subscribe_call_record(
        &self,
        id: &CallId,
    ) -> Result<Subscription<CallRecord>, SignalingError> {
        self.ensure_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.listener_id();

        {
            let mut calls = self.inner.calls.lock();
            let entry = calls.entry(id.clone()).or_default();
            if let Some(record) = &entry.record {
                let _ = tx.send(record.clone());
            }
            entry.record_listeners.push((listener, tx));
        }

        let cancel = self.cancel_handle(id, listener, |entry, listener| {
            entry.record_listeners.retain(|(l, _)| *l != listener);
        });
        Ok(Subscription::new(rx, cancel))
    }

    async fn subscribe_candidates(
        &self,
        id: &CallId,
        side: CandidateSide,
    ) -> Result<Subscription<IceCandidate>, SignalingError> {
        self.ensure_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.listener_id();

        {
            let mut calls = self.inner.calls.lock();
            let entry = calls.entry(id.clone()).or_default();
            for candidate in entry.candidates(side).iter() {
                let _ = tx.send(candidate.clone());
            }
            entry.candidate_listeners(side).push((listener, tx));
        }

        let cancel = match side {
            CandidateSide::Offerer => self.cancel_handle(id, listener, |entry, listener| {
                entry.offerer_listeners.retain(|(l, _)| *l != listener);
            }),
            CandidateSide::Answerer => self.cancel_handle(id, listener, |entry, listener| {
                entry.answerer_listeners.retain(|(l, _)| *l != listener);
            }),
        };
        Ok(Subscription::new(rx, cancel))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("calls", &self.inner.calls.lock().len())
            .field("available", &!self.inner.unavailable.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
