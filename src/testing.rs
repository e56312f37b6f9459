//! Test-Doubles für Peer Connections, Data Channels und Media
//!
//! `FakeNetwork` verbindet zwei `FakeTransport`s, sobald der Anrufer das
//! Answer als Remote Description setzt: Data Channels des Anrufers werden
//! gespiegelt und geöffnet, Tracks ausgetauscht, beide Seiten melden `Connected`.

use crate::call_engine::{
    ChannelEvent, ChannelEvents, ConnectionState, DataChannel, LocalMedia, LocalTrack,
    MediaAccessError, MediaSource, PeerConnector, PeerEvent, PeerEvents, PeerTransport,
    RemoteTrack, TrackKind, TransportError,
};
use crate::config::IceServerConfig;
use crate::gifts::{GiftChannelMessage, GiftListener};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// NETWORK
// ============================================================================

#[derive(Default)]
struct NetworkInner {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

/// Gemeinsames "Netz" aller Fake-Transports eines Tests
#[derive(Clone, Default)]
pub struct FakeNetwork {
    inner: Arc<NetworkInner>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Einzelner Transport ohne Event-Empfänger
    pub fn transport(&self) -> Arc<FakeTransport> {
        self.create().0
    }

    pub fn connector(&self) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            network: self.clone(),
        })
    }

    /// Alle erzeugten Transports in Erstellungsreihenfolge
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.inner.transports.lock().clone()
    }

    fn create(&self) -> (Arc<FakeTransport>, PeerEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut transports = self.inner.transports.lock();
        let transport = Arc::new(FakeTransport {
            id: transports.len(),
            network: Arc::downgrade(&self.inner),
            events_tx,
            state: Mutex::new(TransportState::default()),
        });
        transports.push(Arc::clone(&transport));
        (transport, events_rx)
    }

    fn find(&self, id: usize) -> Option<Arc<FakeTransport>> {
        self.inner.transports.lock().get(id).cloned()
    }
}

pub struct FakeConnector {
    network: FakeNetwork,
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        _ice_servers: &[IceServerConfig],
        _ice_candidate_pool_size: u8,
    ) -> Result<(Arc<dyn PeerTransport>, PeerEvents), TransportError> {
        let (transport, events) = self.network.create();
        let transport: Arc<dyn PeerTransport> = transport;
        Ok((transport, events))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Default)]
struct TransportState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<LocalTrack>,
    channels: Vec<Arc<FakeDataChannel>>,
    applied: Vec<String>,
    peer: Option<usize>,
    closed: bool,
}

pub struct FakeTransport {
    id: usize,
    network: Weak<NetworkInner>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<TransportState>,
}

impl FakeTransport {
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn data_channels(&self) -> Vec<Arc<FakeDataChannel>> {
        self.state.lock().channels.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Setzt eine Remote Description ohne Gegenseite
    pub fn force_remote_description(&self) {
        self.state.lock().remote = Some(SessionDescription::answer("fake-answer:forced"));
    }

    /// Schiebt ein Event in den Event-Stream dieser Peer Connection
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn candidate_name(&self) -> String {
        format!("candidate:fake-{} 1 udp 2122260223 10.0.0.{} 5000 typ host", self.id, self.id)
    }

    fn network(&self) -> Option<FakeNetwork> {
        self.network.upgrade().map(|inner| FakeNetwork { inner })
    }

    /// Verbindet Anrufer (`self`) und Angerufenen
    fn link(&self, answerer: &FakeTransport) {
        let (channels, tracks) = {
            let mut state = self.state.lock();
            state.peer = Some(answerer.id);
            (state.channels.clone(), state.tracks.clone())
        };
        let answerer_tracks = {
            let mut state = answerer.state.lock();
            state.peer = Some(self.id);
            state.tracks.clone()
        };

        for local in channels {
            let remote = FakeDataChannel::new(local.label());
            FakeDataChannel::pair(&local, &remote);
            answerer.state.lock().channels.push(Arc::clone(&remote));
            let incoming: Arc<dyn DataChannel> = remote.clone();
            answerer.emit(PeerEvent::DataChannel(incoming));
            local.set_open(true);
            remote.set_open(true);
        }

        for track in &tracks {
            answerer.emit(PeerEvent::RemoteTrack(RemoteTrack::new(track.id(), track.kind())));
        }
        for track in &answerer_tracks {
            self.emit(PeerEvent::RemoteTrack(RemoteTrack::new(track.id(), track.kind())));
        }

        self.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        answerer.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.lock().closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.lock().tracks.push(track.clone());
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.ensure_open()?;
        let channel = FakeDataChannel::new(label);
        self.state.lock().channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let channels = self.state.lock().channels.len();
        Ok(SessionDescription::offer(format!("fake-offer:{}:{}", self.id, channels)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if self.state.lock().remote.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        Ok(SessionDescription::answer(format!("fake-answer:{}", self.id)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.lock().local = Some(desc);

        // Gathering: ein Host-Candidate, danach das Ende-Signal
        self.emit(PeerEvent::LocalCandidate(Some(IceCandidate::new(self.candidate_name()))));
        self.emit(PeerEvent::LocalCandidate(None));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !desc.sdp.starts_with("fake-") {
            return Err(TransportError::InvalidSdp(desc.sdp));
        }
        self.state.lock().remote = Some(desc.clone());

        if desc.sdp_type == SdpType::Answer {
            let answerer = desc
                .sdp
                .strip_prefix("fake-answer:")
                .and_then(|id| id.parse::<usize>().ok())
                .and_then(|id| self.network().and_then(|n| n.find(id)));
            if let Some(answerer) = answerer {
                self.link(&answerer);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.remote.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        if candidate.candidate.contains("malformed") {
            return Err(TransportError::WebRTC(format!(
                "invalid candidate: {}",
                candidate.candidate
            )));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (channels, peer) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (state.channels.clone(), state.peer)
        };

        for channel in channels {
            channel.close().await;
        }
        self.emit(PeerEvent::ConnectionState(ConnectionState::Closed));

        if let Some(peer) = peer.and_then(|id| self.network().and_then(|n| n.find(id))) {
            peer.emit(PeerEvent::ConnectionState(ConnectionState::Disconnected));
        }
        Ok(())
    }
}

// ============================================================================
// DATA CHANNEL
// ============================================================================

pub struct FakeDataChannel {
    label: String,
    open: AtomicBool,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<ChannelEvents>>,
    sent: Mutex<Vec<String>>,
    peer: Mutex<Weak<FakeDataChannel>>,
}

impl FakeDataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sent: Mutex::new(Vec::new()),
            peer: Mutex::new(Weak::new()),
        })
    }

    /// Verbindet zwei Kanäle; gesendete Frames kommen beim jeweils anderen an
    pub fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    pub fn set_open(&self, open: bool) {
        if self.open.swap(open, Ordering::SeqCst) == open {
            return;
        }
        let event = if open { ChannelEvent::Open } else { ChannelEvent::Closed };
        let _ = self.events_tx.send(event);
    }

    /// Simuliert einen eingehenden Frame
    pub fn deliver(&self, frame: &str) {
        let _ = self.events_tx.send(ChannelEvent::Message(frame.to_string()));
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen);
        }
        self.sent.lock().push(text.clone());
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.deliver(&text);
        }
        Ok(())
    }

    async fn close(&self) {
        self.set_open(false);
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.set_open(false);
        }
    }

    fn take_events(&self) -> Option<ChannelEvents> {
        self.events_rx.lock().take()
    }
}

// ============================================================================
// MEDIA
// ============================================================================

/// Media-Quelle mit abschaltbarer Berechtigung
#[derive(Default)]
pub struct FakeMedia {
    deny: AtomicBool,
    acquired: Mutex<Vec<LocalMedia>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denied() -> Arc<Self> {
        let media = Self::default();
        media.deny.store(true, Ordering::SeqCst);
        Arc::new(media)
    }

    pub fn acquired(&self) -> Vec<LocalMedia> {
        self.acquired.lock().clone()
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self) -> Result<LocalMedia, MediaAccessError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaAccessError::PermissionDenied("denied by user".to_string()));
        }

        let stream_id = format!("stream-{}", uuid::Uuid::new_v4());
        let media = LocalMedia {
            tracks: vec![
                LocalTrack::new(format!("{}-audio", stream_id), TrackKind::Audio, &stream_id),
                LocalTrack::new(format!("{}-video", stream_id), TrackKind::Video, &stream_id),
            ],
            stream_id,
        };
        self.acquired.lock().push(media.clone());
        Ok(media)
    }
}

// ============================================================================
// LISTENER / HELPERS
// ============================================================================

#[derive(Default)]
pub struct RecordingGiftListener {
    ready: Mutex<Vec<bool>>,
    gifts: Mutex<Vec<GiftChannelMessage>>,
}

impl RecordingGiftListener {
    pub fn ready_changes(&self) -> Vec<bool> {
        self.ready.lock().clone()
    }

    pub fn gifts(&self) -> Vec<GiftChannelMessage> {
        self.gifts.lock().clone()
    }
}

impl GiftListener for RecordingGiftListener {
    fn on_ready(&self, open: bool) {
        self.ready.lock().push(open);
    }

    fn on_gift(&self, gift: GiftChannelMessage) {
        self.gifts.lock().push(gift);
    }
}

/// Wartet bis zu zwei Sekunden darauf, dass `cond` wahr wird
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
