//! ICE Candidate Buffer
//!
//! Remote Candidates dürfen erst nach der Remote Description auf die Peer
//! Connection. Bis dahin werden sie in Ankunftsreihenfolge gepuffert und
//! beim `flush()` genau einmal angewendet.

use super::transport::{PeerTransport, TransportError};
use crate::signaling::IceCandidate;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Ein einzelner Candidate konnte nicht angewendet werden (wird geloggt und übersprungen)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to apply ICE candidate '{candidate}': {source}")]
pub struct CandidateApplicationError {
    pub candidate: String,
    #[source]
    pub source: TransportError,
}

/// Ergebnis von `enqueue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Remote Description fehlt noch, Candidate wartet
    Queued,
    Applied,
    /// Anwendung fehlgeschlagen, geloggt und verworfen
    Skipped,
    /// Session bereits beendet
    Discarded,
}

#[derive(Debug, Default)]
struct BufferState {
    remote_ready: bool,
    cleared: bool,
    pending: Vec<IceCandidate>,
}

/// Puffer für Remote Candidates einer Session
pub struct IceCandidateBuffer {
    transport: Arc<dyn PeerTransport>,
    state: Mutex<BufferState>,
    // Serialisiert das Anwenden, damit Candidates während eines Flushs hinten anstehen
    apply_lock: tokio::sync::Mutex<()>,
}

impl IceCandidateBuffer {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(BufferState::default()),
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Puffert den Candidate oder wendet ihn sofort an, falls die Remote Description gesetzt ist
    pub async fn enqueue(&self, candidate: IceCandidate) -> Enqueued {
        let _guard = self.apply_lock.lock().await;

        {
            let mut state = self.state.lock();
            if state.cleared {
                return Enqueued::Discarded;
            }
            if !state.remote_ready {
                tracing::debug!("Queueing remote ICE candidate until remote description is set");
                state.pending.push(candidate);
                return Enqueued::Queued;
            }
        }

        if self.apply(candidate).await {
            Enqueued::Applied
        } else {
            Enqueued::Skipped
        }
    }

    /// Markiert die Remote Description als gesetzt und wendet alle gepufferten Candidates an
    ///
    /// Gibt die Anzahl erfolgreich angewendeter Candidates zurück. Ein zweiter
    /// Aufruf findet eine leere Queue vor und tut nichts.
    pub async fn flush(&self) -> usize {
        let _guard = self.apply_lock.lock().await;

        let pending = {
            let mut state = self.state.lock();
            if state.cleared {
                return 0;
            }
            state.remote_ready = true;
            std::mem::take(&mut state.pending)
        };

        if !pending.is_empty() {
            tracing::debug!("Flushing {} queued ICE candidate(s)", pending.len());
        }

        let mut applied = 0;
        for candidate in pending {
            if self.apply(candidate).await {
                applied += 1;
            }
        }
        applied
    }

    /// Verwirft alle gepufferten Candidates; spätere `enqueue`-Aufrufe sind No-ops
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.cleared = true;
        state.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_remote_ready(&self) -> bool {
        self.state.lock().remote_ready
    }

    async fn apply(&self, candidate: IceCandidate) -> bool {
        let raw = candidate.candidate.clone();
        match self.transport.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(source) => {
                let err = CandidateApplicationError {
                    candidate: raw,
                    source,
                };
                tracing::warn!("{}", err);
                false
            }
        }
    }
}

impl std::fmt::Debug for IceCandidateBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceCandidateBuffer")
            .field("state", &*self.state.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
