//! Peer Session - alle Ressourcen eines aktiven Anrufs
//!
//! Gehört exklusiv der CallEngine. Beim Auflegen oder beim Start eines
//! neuen Anrufs wird die Session komplett freigegeben.

use super::candidates::IceCandidateBuffer;
use super::media::{LocalMedia, RemoteStream};
use super::transport::PeerTransport;
use crate::gifts::GiftChannel;
use crate::signaling::{CallId, CallRole, CancelHandle};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub(crate) struct PeerSession {
    /// Generation; Completions mit anderer ID sind veraltet
    pub id: u64,
    pub role: CallRole,
    pub call_id: Option<CallId>,
    pub transport: Option<Arc<dyn PeerTransport>>,
    pub local_media: Option<LocalMedia>,
    pub remote_stream: RemoteStream,
    pub gift_channel: Option<GiftChannel>,
    pub gift_ready: bool,
    pub candidates: Option<Arc<IceCandidateBuffer>>,
    pub answer_applied: bool,
    subscriptions: Vec<CancelHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerSession {
    pub fn new(id: u64, role: CallRole) -> Self {
        Self {
            id,
            role,
            call_id: None,
            transport: None,
            local_media: None,
            remote_stream: RemoteStream::default(),
            gift_channel: None,
            gift_ready: false,
            candidates: None,
            answer_applied: false,
            subscriptions: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn adopt_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn adopt_subscription(&mut self, cancel: CancelHandle) {
        self.subscriptions.push(cancel);
    }

    /// Synchroner Teil des Auflegens
    ///
    /// Meldet alle Abonnements ab, bricht die Hintergrund-Tasks ab, stoppt
    /// alle Tracks und leert den Candidate-Puffer. Was asynchron geschlossen
    /// werden muss, steckt im zurückgegebenen `Teardown`.
    pub fn release(mut self) -> Teardown {
        for cancel in self.subscriptions.drain(..) {
            cancel.cancel();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(media) = &self.local_media {
            media.stop_all();
        }
        self.remote_stream.stop_all();

        if let Some(buffer) = &self.candidates {
            buffer.clear();
        }

        Teardown {
            session_id: self.id,
            gift_channel: self.gift_channel.take(),
            transport: self.transport.take(),
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("call_id", &self.call_id)
            .field("gift_ready", &self.gift_ready)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// Asynchroner Rest des Auflegens: Gift-Kanal und Peer Connection schließen
pub(crate) struct Teardown {
    session_id: u64,
    gift_channel: Option<GiftChannel>,
    transport: Option<Arc<dyn PeerTransport>>,
}

impl Teardown {
    pub async fn close(self) {
        if let Some(channel) = self.gift_channel {
            channel.close().await;
        }
        if let Some(transport) = self.transport {
            if let Err(e) = transport.close().await {
                tracing::warn!("Closing peer connection of session {} failed: {}", self.session_id, e);
            }
        }
        tracing::debug!("Session {} closed", self.session_id);
    }
}
