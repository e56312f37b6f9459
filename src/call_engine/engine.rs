//! WebRTC Call Engine
//!
//! Verwaltet die Peer Connection einer Session und koordiniert den
//! Offer/Answer/ICE-Austausch über den Signaling-Store.
//!
//! Zustände: `Idle → AcquiringMedia → AwaitingRemoteDescription → Connected → Closed`

use super::candidates::IceCandidateBuffer;
use super::media::{LocalTrack, MediaAccessError, MediaSource, RemoteTrack, RtcMediaSource};
use super::rtc::RtcConnector;
use super::session::{PeerSession, Teardown};
use super::transport::{
    ConnectionState, PeerConnector, PeerEvent, PeerEvents, PeerTransport, TransportError,
};
use crate::config::CallConfig;
use crate::gifts::{self, GiftChannel, GiftChannelMessage, GiftListener};
use crate::signaling::{
    CallId, CallRecord, CallRole, IceCandidate, SignalingError, SignalingStore,
    Subscription,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Media error: {0}")]
    Media(#[from] MediaAccessError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Session wurde während des Aufbaus beendet
    #[error("Call setup cancelled")]
    Cancelled,
}

/// Fehlerklasse für die UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MediaAccess,
    Signaling,
    Transport,
}

impl CallEngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallEngineError::Media(_) => ErrorKind::MediaAccess,
            CallEngineError::Signaling(_) => ErrorKind::Signaling,
            CallEngineError::Transport(_) | CallEngineError::Cancelled => ErrorKind::Transport,
        }
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Noch kein Anruf
    Idle,
    /// Kamera/Mikrofon werden angefordert
    AcquiringMedia,
    /// Offer geschrieben (Anrufer) bzw. Offer gelesen (Angerufener)
    AwaitingRemoteDescription,
    /// Beide Descriptions gesetzt
    Connected,
    /// Aufgelegt oder fehlgeschlagen
    Closed,
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Neue Session; eine vorherige wurde bereits beendet
    SessionStarted(CallRole),
    StateChanged(CallState),
    /// Anrufer: Call-Record mit Offer angelegt
    CallCreated(CallId),
    /// Anrufer: Answer der Gegenseite gesetzt
    AnswerReceived,
    /// Angerufener: Answer in den Store geschrieben
    AnswerSent,
    ConnectionStateChanged(ConnectionState),
    RemoteTrackAdded(RemoteTrack),
    GiftChannelReady(bool),
    GiftReceived(GiftChannelMessage),
    Error { kind: ErrorKind, message: String },
}

// ============================================================================
// CALL ENGINE
// ============================================================================

struct EngineShared {
    config: CallConfig,
    store: Arc<dyn SignalingStore>,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn MediaSource>,
    state: Mutex<CallState>,
    session: Mutex<Option<PeerSession>>,
    generation: AtomicU64,
    event_tx: broadcast::Sender<CallEvent>,
}

/// WebRTC Call Engine
pub struct CallEngine {
    shared: Arc<EngineShared>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine mit expliziten Kollaborateuren
    pub fn new(
        config: CallConfig,
        store: Arc<dyn SignalingStore>,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: Arc::new(EngineShared {
                config,
                store,
                connector,
                media,
                state: Mutex::new(CallState::Idle),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                event_tx,
            }),
        }
    }

    /// CallEngine mit webrtc-rs Peer Connections und Sample-Tracks
    pub fn with_webrtc(config: CallConfig, store: Arc<dyn SignalingStore>) -> Self {
        let media = Arc::new(RtcMediaSource::new(config.media.clone()));
        Self::new(config, store, Arc::new(RtcConnector::new()), media)
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn config(&self) -> &CallConfig {
        &self.shared.config
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn state(&self) -> CallState {
        *self.shared.state.lock()
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.shared
            .session
            .lock()
            .as_ref()
            .and_then(|s| s.call_id.clone())
    }

    pub fn role(&self) -> Option<CallRole> {
        self.shared.session.lock().as_ref().map(|s| s.role)
    }

    /// Gifts sind erst möglich, wenn der Gift-Kanal offen ist
    pub fn is_gift_channel_ready(&self) -> bool {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|s| s.gift_ready)
            .unwrap_or(false)
    }

    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.shared
            .session
            .lock()
            .as_ref()
            .and_then(|s| s.local_media.as_ref().map(|m| m.tracks.clone()))
            .unwrap_or_default()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|s| s.remote_stream.tracks().to_vec())
            .unwrap_or_default()
    }

    /// Anzahl der Remote Candidates, die noch auf die Remote Description warten
    pub fn pending_candidates(&self) -> usize {
        self.shared
            .session
            .lock()
            .as_ref()
            .and_then(|s| s.candidates.as_ref().map(|b| b.pending_len()))
            .unwrap_or(0)
    }

    /// Sendet ein Gift über den Gift-Kanal (best-effort)
    pub async fn send_gift(&self, gift: &GiftChannelMessage) -> bool {
        let channel = self
            .shared
            .session
            .lock()
            .as_ref()
            .and_then(|s| s.gift_channel.clone());
        gifts::send_gift(channel.as_ref(), gift).await
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Gibt die ID des Call-Records zurück, die der Gegenseite mitgeteilt wird.
    pub async fn start_call(&self) -> Result<CallId, CallEngineError> {
        // Nie zwei Sessions übereinander
        self.hang_up().await;

        let id = self.shared.begin_session(CallRole::Caller);
        tracing::info!("Starting call (session {})", id);

        match self.shared.run_caller(id).await {
            Ok(call_id) => Ok(call_id),
            Err(e) => {
                self.shared.abort_setup(id, &e).await;
                Err(e)
            }
        }
    }

    /// Nimmt einen Anruf anhand der Call-ID an
    pub async fn answer_call(&self, call_id: &CallId) -> Result<(), CallEngineError> {
        self.hang_up().await;

        let id = self.shared.begin_session(CallRole::Answerer);
        tracing::info!("Answering call {} (session {})", call_id, id);

        match self.shared.run_answerer(id, call_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.abort_setup(id, &e).await;
                Err(e)
            }
        }
    }

    /// Beendet den aktuellen Anruf
    ///
    /// Abonnements und Tasks werden abgemeldet, bevor die Funktion zum
    /// ersten Mal suspendiert. Ohne aktive Session landet die Engine
    /// trotzdem in `Closed`, allerdings ohne Event.
    pub async fn hang_up(&self) {
        match self.shared.teardown(None) {
            Some(teardown) => {
                tracing::info!("Hanging up");
                close_session(teardown).await;
            }
            None => *self.shared.state.lock() = CallState::Closed,
        }
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        if let Some(teardown) = self.shared.teardown(None) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(teardown.close());
            }
        }
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .field("session", &*self.shared.session.lock())
            .finish()
    }
}

// ============================================================================
// SESSION BOOKKEEPING
// ============================================================================

impl EngineShared {
    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Sendet das Event nur, wenn die Session noch aktuell ist
    fn emit_for(&self, id: u64, event: CallEvent) {
        if self.is_current(id) {
            self.emit(event);
        }
    }

    fn is_current(&self, id: u64) -> bool {
        self.session.lock().as_ref().map(|s| s.id) == Some(id)
    }

    fn begin_session(&self, role: CallRole) -> u64 {
        let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.session.lock() = Some(PeerSession::new(id, role));
        self.emit(CallEvent::SessionStarted(role));
        id
    }

    /// Führt `f` auf der Session aus, sofern sie noch aktuell ist
    fn update<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut PeerSession) -> R,
    ) -> Result<R, CallEngineError> {
        match self.session.lock().as_mut() {
            Some(session) if session.id == id => Ok(f(session)),
            _ => Err(CallEngineError::Cancelled),
        }
    }

    fn transition(&self, id: u64, new_state: CallState) -> Result<(), CallEngineError> {
        {
            let session = self.session.lock();
            match session.as_ref() {
                Some(s) if s.id == id => *self.state.lock() = new_state,
                _ => return Err(CallEngineError::Cancelled),
            }
        }
        tracing::debug!("Session {} -> {:?}", id, new_state);
        self.emit(CallEvent::StateChanged(new_state));
        Ok(())
    }

    /// Hängt einen Hintergrund-Task (plus Abonnement) an die Session
    fn adopt(
        &self,
        id: u64,
        task: JoinHandle<()>,
        cancel: Option<crate::signaling::CancelHandle>,
    ) -> Result<(), CallEngineError> {
        let mut session = self.session.lock();
        match session.as_mut() {
            Some(s) if s.id == id => {
                s.adopt_task(task);
                if let Some(cancel) = cancel {
                    s.adopt_subscription(cancel);
                }
                Ok(())
            }
            _ => {
                task.abort();
                Err(CallEngineError::Cancelled)
            }
        }
    }

    /// Nimmt die Session heraus (nur `expected`, falls angegeben) und gibt sie frei
    fn teardown(&self, expected: Option<u64>) -> Option<Teardown> {
        let session = {
            let mut guard = self.session.lock();
            let current = guard.as_ref().map(|s| s.id)?;
            if expected.is_some_and(|id| id != current) {
                return None;
            }
            guard.take()
        }?;

        let was_ready = session.gift_ready;
        let teardown = session.release();
        *self.state.lock() = CallState::Closed;
        if was_ready {
            self.emit(CallEvent::GiftChannelReady(false));
        }
        self.emit(CallEvent::StateChanged(CallState::Closed));
        Some(teardown)
    }

    /// Fehler aus einem Hintergrund-Task: melden und Session beenden
    fn fail(&self, id: u64, err: CallEngineError) {
        if !self.is_current(id) {
            return;
        }
        tracing::error!("Call failed: {}", err);
        self.emit(CallEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
        if let Some(teardown) = self.teardown(Some(id)) {
            tokio::spawn(teardown.close());
        }
    }

    /// Fehler während start/answer: melden und aufräumen (Session landet in Closed)
    async fn abort_setup(&self, id: u64, err: &CallEngineError) {
        if *err == CallEngineError::Cancelled {
            tracing::debug!("Setup of session {} cancelled", id);
            return;
        }

        tracing::error!("Call setup failed: {}", err);
        self.emit(CallEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
        if let Some(teardown) = self.teardown(Some(id)) {
            close_session(teardown).await;
        }
    }
}

/// Schließt Channel und Peer Connection in einem eigenen Task
async fn close_session(teardown: Teardown) {
    if let Err(e) = tokio::spawn(teardown.close()).await {
        tracing::warn!("Closing session failed: {}", e);
    }
}

fn subscription_closed(what: &str) -> CallEngineError {
    SignalingError::Unavailable(format!("{} subscription closed", what)).into()
}

// ============================================================================
// CALL SETUP
// ============================================================================

impl EngineShared {
    /// Media holen, Peer Connection erstellen, lokale Tracks hinzufügen
    async fn prepare_peer(
        &self,
        id: u64,
    ) -> Result<(Arc<dyn PeerTransport>, Arc<IceCandidateBuffer>, PeerEvents), CallEngineError>
    {
        self.transition(id, CallState::AcquiringMedia)?;

        let media = self.media.acquire().await?;
        if let Err(e) = self.update(id, |s| s.local_media = Some(media.clone())) {
            media.stop_all();
            return Err(e);
        }

        let (transport, events) = self
            .connector
            .connect(&self.config.ice_servers, self.config.ice_candidate_pool_size)
            .await?;
        let buffer = Arc::new(IceCandidateBuffer::new(Arc::clone(&transport)));

        let attached = self.update(id, |s| {
            s.transport = Some(Arc::clone(&transport));
            s.candidates = Some(Arc::clone(&buffer));
        });
        if let Err(e) = attached {
            let _ = transport.close().await;
            return Err(e);
        }

        for track in &media.tracks {
            transport.add_track(track).await?;
        }

        Ok((transport, buffer, events))
    }

    /// Anrufer-Pfad
    async fn run_caller(self: &Arc<Self>, id: u64) -> Result<CallId, CallEngineError> {
        let (transport, buffer, events) = self.prepare_peer(id).await?;

        // Der Gift-Kanal muss vor dem Offer existieren, sonst sieht ihn die Gegenseite nicht
        let channel = GiftChannel::open(transport.as_ref()).await?;
        self.install_gift_channel(id, channel)?;

        let call_id = self.store.create_call_record().await?;
        self.update(id, |s| s.call_id = Some(call_id.clone()))?;

        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.store.set_offer(&call_id, offer).await?;

        self.transition(id, CallState::AwaitingRemoteDescription)?;
        self.emit_for(id, CallEvent::CallCreated(call_id.clone()));

        let record_sub = self.store.subscribe_call_record(&call_id).await?;
        self.watch_answer(id, record_sub, Arc::clone(&transport), Arc::clone(&buffer))?;

        let candidate_sub = self
            .store
            .subscribe_candidates(&call_id, CallRole::Caller.remote_side())
            .await?;
        self.watch_remote_candidates(id, candidate_sub, buffer)?;

        self.pump_peer_events(id, events, call_id.clone(), CallRole::Caller)?;

        tracing::info!("Call {} created", call_id);
        Ok(call_id)
    }

    /// Angerufener-Pfad
    async fn run_answerer(self: &Arc<Self>, id: u64, call_id: &CallId) -> Result<(), CallEngineError> {
        let (transport, buffer, events) = self.prepare_peer(id).await?;
        self.update(id, |s| s.call_id = Some(call_id.clone()))?;

        let offer = self
            .store
            .get_call_record(call_id)
            .await?
            .and_then(|record| record.offer)
            .ok_or(SignalingError::OfferNotFound)?;

        self.transition(id, CallState::AwaitingRemoteDescription)?;
        transport.set_remote_description(offer).await?;
        buffer.flush().await;

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.store.set_answer(call_id, answer).await?;

        self.transition(id, CallState::Connected)?;
        self.emit_for(id, CallEvent::AnswerSent);

        let candidate_sub = self
            .store
            .subscribe_candidates(call_id, CallRole::Answerer.remote_side())
            .await?;
        self.watch_remote_candidates(id, candidate_sub, buffer)?;

        self.pump_peer_events(id, events, call_id.clone(), CallRole::Answerer)?;

        tracing::info!("Answered call {}", call_id);
        Ok(())
    }

    /// Speichert den Gift-Kanal in der Session und startet den Empfang
    fn install_gift_channel(
        self: &Arc<Self>,
        id: u64,
        channel: GiftChannel,
    ) -> Result<(), CallEngineError> {
        let listener = Arc::new(SessionGiftListener {
            shared: Arc::downgrade(self),
            session_id: id,
        });
        let task = gifts::attach_receiver(&channel, listener);

        let mut session = self.session.lock();
        match session.as_mut() {
            Some(s) if s.id == id => {
                if let Some(previous) = s.gift_channel.replace(channel) {
                    tokio::spawn(async move { previous.close().await });
                }
                if let Some(task) = task {
                    s.adopt_task(task);
                }
                Ok(())
            }
            _ => {
                drop(session);
                if let Some(task) = task {
                    task.abort();
                }
                tokio::spawn(async move { channel.close().await });
                Err(CallEngineError::Cancelled)
            }
        }
    }

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    /// Anrufer: wartet auf das erste Answer im Call-Record
    fn watch_answer(
        self: &Arc<Self>,
        id: u64,
        subscription: Subscription<CallRecord>,
        transport: Arc<dyn PeerTransport>,
        buffer: Arc<IceCandidateBuffer>,
    ) -> Result<(), CallEngineError> {
        let (mut records, cancel) = subscription.into_parts();
        let shared = Arc::clone(self);

        let task = tokio::spawn(async move {
            loop {
                let Some(record) = records.recv().await else {
                    // Store hat das Abonnement verloren
                    shared.fail(id, subscription_closed("call record"));
                    break;
                };
                let Some(answer) = record.answer else {
                    continue;
                };

                // Nur das erste Answer zählt, spätere Zustellungen werden ignoriert
                let first = match shared.update(id, |s| !std::mem::replace(&mut s.answer_applied, true)) {
                    Ok(first) => first,
                    Err(_) => break,
                };
                if !first {
                    continue;
                }

                tracing::info!("Answer received for session {}", id);
                if let Err(e) = transport.set_remote_description(answer).await {
                    shared.fail(id, e.into());
                    break;
                }
                buffer.flush().await;

                shared.emit_for(id, CallEvent::AnswerReceived);
                if shared.transition(id, CallState::Connected).is_err() {
                    break;
                }
            }
        });

        self.adopt(id, task, Some(cancel))
    }

    /// Remote Candidates aus dem Store in den Puffer
    fn watch_remote_candidates(
        self: &Arc<Self>,
        id: u64,
        subscription: Subscription<IceCandidate>,
        buffer: Arc<IceCandidateBuffer>,
    ) -> Result<(), CallEngineError> {
        let (mut candidates, cancel) = subscription.into_parts();
        let shared = Arc::clone(self);

        let task = tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                if !shared.is_current(id) {
                    return;
                }
                buffer.enqueue(candidate).await;
            }
            shared.fail(id, subscription_closed("candidate"));
        });

        self.adopt(id, task, Some(cancel))
    }

    /// Verarbeitet die Events der Peer Connection
    ///
    /// Startet erst, nachdem die eigene Description im Store steht; bis dahin
    /// erzeugte lokale Candidates warten im Channel und gehen danach raus.
    fn pump_peer_events(
        self: &Arc<Self>,
        id: u64,
        mut events: PeerEvents,
        call_id: CallId,
        role: CallRole,
    ) -> Result<(), CallEngineError> {
        let shared = Arc::clone(self);

        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !shared.is_current(id) {
                    break;
                }

                match event {
                    PeerEvent::LocalCandidate(Some(candidate)) => {
                        let result = shared
                            .store
                            .append_candidate(&call_id, role.local_side(), candidate)
                            .await;
                        if let Err(e) = result {
                            shared.fail(id, e.into());
                            break;
                        }
                    }
                    PeerEvent::LocalCandidate(None) => {
                        tracing::debug!("ICE gathering complete");
                    }
                    PeerEvent::RemoteTrack(track) => {
                        let added = shared
                            .update(id, |s| s.remote_stream.add_track(track.clone()))
                            .unwrap_or(false);
                        if added {
                            shared.emit_for(id, CallEvent::RemoteTrackAdded(track));
                        }
                    }
                    PeerEvent::DataChannel(channel) => {
                        if let Some(channel) = GiftChannel::accept(channel) {
                            if shared.install_gift_channel(id, channel).is_err() {
                                break;
                            }
                        }
                    }
                    PeerEvent::ConnectionState(state) => {
                        shared.emit_for(id, CallEvent::ConnectionStateChanged(state));
                    }
                }
            }
        });

        self.adopt(id, task, None)
    }
}

/// Leitet Gift-Events der aktuellen Session an die Engine weiter
struct SessionGiftListener {
    shared: Weak<EngineShared>,
    session_id: u64,
}

impl GiftListener for SessionGiftListener {
    fn on_ready(&self, open: bool) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.update(self.session_id, |s| s.gift_ready = open).is_ok() {
            shared.emit(CallEvent::GiftChannelReady(open));
        }
    }

    fn on_gift(&self, gift: GiftChannelMessage) {
        if let Some(shared) = self.shared.upgrade() {
            tracing::info!("Gift received: {}", gift.title);
            shared.emit_for(self.session_id, CallEvent::GiftReceived(gift));
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::TrackKind;
    use crate::gifts::GiftBackground;
    use crate::signaling::{CandidateSide, MemoryStore, SessionDescription};
    use crate::testing::{eventually, FakeMedia, FakeNetwork};
    use std::time::Duration;

    struct Harness {
        store: MemoryStore,
        network: FakeNetwork,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                network: FakeNetwork::new(),
            }
        }

        fn engine(&self) -> CallEngine {
            self.engine_with(FakeMedia::new())
        }

        fn engine_with(&self, media: Arc<FakeMedia>) -> CallEngine {
            CallEngine::new(
                CallConfig::default(),
                Arc::new(self.store.clone()),
                self.network.connector(),
                media,
            )
        }

        async fn connected_pair(&self) -> (CallEngine, CallEngine, CallId) {
            let caller = self.engine();
            let callee = self.engine();

            let call_id = caller.start_call().await.unwrap();
            callee.answer_call(&call_id).await.unwrap();

            assert!(eventually(|| caller.state() == CallState::Connected).await);
            assert!(
                eventually(|| caller.is_gift_channel_ready() && callee.is_gift_channel_ready())
                    .await
            );
            (caller, callee, call_id)
        }
    }

    async fn next_gift(events: &mut broadcast::Receiver<CallEvent>) -> GiftChannelMessage {
        let wait = async {
            loop {
                if let Ok(CallEvent::GiftReceived(gift)) = events.recv().await {
                    return gift;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("no gift received")
    }

    fn roses() -> GiftChannelMessage {
        GiftChannelMessage::new("roses.webm", GiftBackground::Roses, "Roses")
    }

    #[tokio::test]
    async fn test_caller_and_callee_connect() {
        let harness = Harness::new();
        let caller = harness.engine();
        let callee = harness.engine();
        let mut caller_events = caller.subscribe();

        let call_id = caller.start_call().await.unwrap();
        assert_eq!(caller.state(), CallState::AwaitingRemoteDescription);
        assert_eq!(caller.call_id(), Some(call_id.clone()));
        assert_eq!(caller.role(), Some(CallRole::Caller));

        let record = harness.store.get_call_record(&call_id).await.unwrap().unwrap();
        assert_eq!(record.offer, harness.network.transports()[0].local_description());
        assert!(record.answer.is_none());

        callee.answer_call(&call_id).await.unwrap();
        assert_eq!(callee.state(), CallState::Connected);
        assert_eq!(callee.role(), Some(CallRole::Answerer));

        assert!(eventually(|| caller.state() == CallState::Connected).await);
        assert!(eventually(|| caller.remote_tracks().len() == 2).await);
        assert!(eventually(|| callee.remote_tracks().len() == 2).await);
        assert!(eventually(|| caller.is_gift_channel_ready()).await);
        assert!(eventually(|| callee.is_gift_channel_ready()).await);

        let mut saw_created = false;
        let mut saw_answer = false;
        while let Ok(event) = caller_events.try_recv() {
            match event {
                CallEvent::CallCreated(id) => saw_created = id == call_id,
                CallEvent::AnswerReceived => saw_answer = true,
                _ => {}
            }
        }
        assert!(saw_created);
        assert!(saw_answer);
    }

    #[tokio::test]
    async fn test_candidates_cross_over_once_descriptions_are_set() {
        let harness = Harness::new();
        let (_caller, _callee, call_id) = harness.connected_pair().await;
        let transports = harness.network.transports();
        let (caller_pc, callee_pc) = (&transports[0], &transports[1]);

        assert!(eventually(|| callee_pc.applied_candidates().len() == 1).await);
        assert!(eventually(|| caller_pc.applied_candidates().len() == 1).await);
        assert!(callee_pc.applied_candidates()[0].contains("fake-0"));
        assert!(caller_pc.applied_candidates()[0].contains("fake-1"));

        // Das Ende des Gatherings wird nicht in den Store geschrieben
        assert_eq!(harness.store.candidate_count(&call_id, CandidateSide::Offerer), 1);
        assert_eq!(harness.store.candidate_count(&call_id, CandidateSide::Answerer), 1);
    }

    #[tokio::test]
    async fn test_gifts_flow_in_both_directions() {
        let harness = Harness::new();
        let (caller, callee, _) = harness.connected_pair().await;
        let mut caller_events = caller.subscribe();
        let mut callee_events = callee.subscribe();

        assert!(caller.send_gift(&roses()).await);
        assert_eq!(next_gift(&mut callee_events).await, roses());

        let car = GiftChannelMessage::new("car.webm", GiftBackground::Car, "Car");
        assert!(callee.send_gift(&car).await);
        assert_eq!(next_gift(&mut caller_events).await, car);
    }

    #[tokio::test]
    async fn test_gift_before_channel_opens_is_dropped() {
        let harness = Harness::new();
        let caller = harness.engine();
        caller.start_call().await.unwrap();

        assert!(!caller.is_gift_channel_ready());
        assert!(!caller.send_gift(&roses()).await);

        let channels = harness.network.transports()[0].data_channels();
        assert_eq!(channels.len(), 1);
        assert!(channels[0].sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_hang_up_releases_everything() {
        let harness = Harness::new();
        let (caller, callee, call_id) = harness.connected_pair().await;
        let local_tracks = caller.local_tracks();
        assert_eq!(local_tracks.len(), 2);

        caller.hang_up().await;

        assert_eq!(caller.state(), CallState::Closed);
        assert!(caller.call_id().is_none());
        assert!(!caller.is_gift_channel_ready());
        assert!(local_tracks.iter().all(|t| t.is_stopped()));
        assert!(harness.network.transports()[0].is_closed());

        // Die Gegenseite sieht den Gift-Kanal schließen
        assert!(eventually(|| !callee.is_gift_channel_ready()).await);

        callee.hang_up().await;
        assert_eq!(harness.store.listener_count(&call_id), 0);

        // Zweimal auflegen ist harmlos
        caller.hang_up().await;
        assert_eq!(caller.state(), CallState::Closed);
    }

    #[tokio::test]
    async fn test_answer_after_hang_up_is_ignored() {
        let harness = Harness::new();
        let caller = harness.engine();
        let mut events = caller.subscribe();

        let call_id = caller.start_call().await.unwrap();
        caller.hang_up().await;

        harness
            .store
            .set_answer(&call_id, SessionDescription::answer("fake-answer:99"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(caller.state(), CallState::Closed);
        assert!(harness.network.transports()[0].remote_description().is_none());
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, CallEvent::AnswerReceived));
        }
    }

    #[tokio::test]
    async fn test_restart_hangs_up_previous_session() {
        let harness = Harness::new();
        let media = FakeMedia::new();
        let caller = harness.engine_with(media.clone());

        let first = caller.start_call().await.unwrap();
        let second = caller.start_call().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(caller.call_id(), Some(second.clone()));
        assert_eq!(caller.state(), CallState::AwaitingRemoteDescription);

        let acquired = media.acquired();
        assert_eq!(acquired.len(), 2);
        assert!(acquired[0].tracks.iter().all(|t| t.is_stopped()));
        assert!(acquired[1].tracks.iter().all(|t| !t.is_stopped()));
        assert!(harness.network.transports()[0].is_closed());
        assert_eq!(harness.store.listener_count(&first), 0);
        assert_eq!(harness.store.listener_count(&second), 2);
    }

    #[tokio::test]
    async fn test_media_denied_closes_session() {
        let harness = Harness::new();
        let caller = harness.engine_with(FakeMedia::denied());
        let mut events = caller.subscribe();

        let err = caller.start_call().await.unwrap_err();
        assert!(matches!(err, CallEngineError::Media(MediaAccessError::PermissionDenied(_))));
        assert_eq!(err.kind(), ErrorKind::MediaAccess);
        assert_eq!(caller.state(), CallState::Closed);
        assert!(harness.network.transports().is_empty());

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Error { kind, .. } = event {
                saw_error = kind == ErrorKind::MediaAccess;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_unavailable_store_tears_down() {
        let harness = Harness::new();
        harness.store.set_available(false);
        let caller = harness.engine();

        let err = caller.start_call().await.unwrap_err();
        assert!(matches!(err, CallEngineError::Signaling(SignalingError::Unavailable(_))));
        assert_eq!(err.kind(), ErrorKind::Signaling);
        assert_eq!(caller.state(), CallState::Closed);
        assert!(harness.network.transports()[0].is_closed());
        assert!(caller.local_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_answer_unknown_call_reports_missing_offer() {
        let harness = Harness::new();
        let callee = harness.engine();

        let err = callee.answer_call(&CallId::generate()).await.unwrap_err();
        assert_eq!(err, CallEngineError::Signaling(SignalingError::OfferNotFound));
        assert_eq!(callee.state(), CallState::Closed);
    }

    #[tokio::test]
    async fn test_second_answer_is_rejected() {
        let harness = Harness::new();
        let (caller, _callee, call_id) = harness.connected_pair().await;
        let intruder = harness.engine();

        let err = intruder.answer_call(&call_id).await.unwrap_err();
        assert!(matches!(err, CallEngineError::Signaling(SignalingError::DuplicateAnswer(_))));
        assert_eq!(intruder.state(), CallState::Closed);

        // Der bestehende Anruf bleibt unberührt
        assert_eq!(caller.state(), CallState::Connected);
        assert!(caller.is_gift_channel_ready());
    }

    #[tokio::test]
    async fn test_remote_track_is_added_once() {
        let harness = Harness::new();
        let caller = harness.engine();
        caller.start_call().await.unwrap();

        let pc = &harness.network.transports()[0];
        pc.emit(PeerEvent::RemoteTrack(RemoteTrack::new("t1", TrackKind::Audio)));
        pc.emit(PeerEvent::RemoteTrack(RemoteTrack::new("t1", TrackKind::Audio)));

        assert!(eventually(|| caller.remote_tracks().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(caller.remote_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_connects_over_sqlite_store() {
        let store = crate::signaling::SqliteStore::open_in_memory("calls")
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        let network = FakeNetwork::new();
        let engine = || {
            CallEngine::new(
                CallConfig::default(),
                Arc::new(store.clone()),
                network.connector(),
                FakeMedia::new(),
            )
        };
        let caller = engine();
        let callee = engine();

        let call_id = caller.start_call().await.unwrap();
        callee.answer_call(&call_id).await.unwrap();

        assert!(eventually(|| caller.state() == CallState::Connected).await);
        assert!(eventually(|| caller.is_gift_channel_ready()).await);
        assert!(eventually(|| network.transports()[1].applied_candidates().len() == 1).await);
        assert!(eventually(|| network.transports()[0].applied_candidates().len() == 1).await);
    }

    #[tokio::test]
    async fn test_remote_candidates_wait_for_answer() {
        let harness = Harness::new();
        let caller = harness.engine();
        let call_id = caller.start_call().await.unwrap();

        harness
            .store
            .append_candidate(&call_id, CandidateSide::Answerer, IceCandidate::new("early"))
            .await
            .unwrap();
        assert!(eventually(|| caller.pending_candidates() == 1).await);
        assert!(harness.network.transports()[0].applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_queued_candidates_apply_in_order_after_answer() {
        let harness = Harness::new();
        let caller = harness.engine();
        let call_id = caller.start_call().await.unwrap();

        for candidate in ["C1", "C2"] {
            harness
                .store
                .append_candidate(&call_id, CandidateSide::Answerer, IceCandidate::new(candidate))
                .await
                .unwrap();
        }
        assert!(eventually(|| caller.pending_candidates() == 2).await);

        harness
            .store
            .set_answer(&call_id, SessionDescription::answer("fake-answer:99"))
            .await
            .unwrap();

        let pc = &harness.network.transports()[0];
        assert!(eventually(|| pc.applied_candidates().len() == 2).await);
        assert_eq!(pc.applied_candidates(), vec!["C1".to_string(), "C2".to_string()]);
        assert_eq!(caller.pending_candidates(), 0);
        assert!(eventually(|| caller.state() == CallState::Connected).await);
    }

    #[tokio::test]
    async fn test_answer_without_offer_reports_missing_offer() {
        let harness = Harness::new();
        let callee = harness.engine();
        let call_id = harness.store.create_call_record().await.unwrap();

        let err = callee.answer_call(&call_id).await.unwrap_err();
        assert_eq!(err, CallEngineError::Signaling(SignalingError::OfferNotFound));
        assert_eq!(callee.state(), CallState::Closed);
        assert!(callee.call_id().is_none());
    }

    #[tokio::test]
    async fn test_hang_up_without_call_closes() {
        let harness = Harness::new();
        let engine = harness.engine();
        let mut events = engine.subscribe();
        assert_eq!(engine.state(), CallState::Idle);

        engine.hang_up().await;

        assert_eq!(engine.state(), CallState::Closed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lost_answer_subscription_fails_call() {
        let harness = Harness::new();
        let caller = harness.engine();
        let mut events = caller.subscribe();
        let call_id = caller.start_call().await.unwrap();
        assert_eq!(caller.state(), CallState::AwaitingRemoteDescription);

        harness.store.disconnect_subscribers(&call_id);

        assert!(eventually(|| caller.state() == CallState::Closed).await);
        assert!(harness.network.transports()[0].is_closed());

        let mut signaling_error = false;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Error { kind, .. } = event {
                signaling_error |= kind == ErrorKind::Signaling;
            }
        }
        assert!(signaling_error);
    }

    #[tokio::test]
    async fn test_zero_poll_interval_sqlite_store_connects() {
        let store = crate::signaling::SqliteStore::open_in_memory("calls")
            .unwrap()
            .with_poll_interval(Duration::ZERO);
        let network = FakeNetwork::new();
        let engine = || {
            CallEngine::new(
                CallConfig::default(),
                Arc::new(store.clone()),
                network.connector(),
                FakeMedia::new(),
            )
        };
        let caller = engine();
        let callee = engine();

        let call_id = caller.start_call().await.unwrap();
        callee.answer_call(&call_id).await.unwrap();

        assert!(eventually(|| caller.state() == CallState::Connected).await);
    }
}
