//! Abstraktion über die Peer Connection
//!
//! Die CallEngine spricht nur mit diesen Traits. Callbacks der Peer
//! Connection (ICE Candidates, Tracks, Data Channels, Verbindungsstatus)
//! kommen als Events über einen Channel an.

use super::media::{LocalTrack, RemoteTrack};
use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer connection closed")]
    Closed,

    #[error("Remote description not set")]
    NoRemoteDescription,

    #[error("Data channel not open")]
    ChannelNotOpen,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Verbindungsstatus der Peer Connection (wie `RTCPeerConnectionState`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events der Peer Connection
#[derive(Clone)]
pub enum PeerEvent {
    /// Lokaler ICE Candidate; `None` signalisiert das Ende des Gatherings
    LocalCandidate(Option<IceCandidate>),
    /// Eingehender Track der Gegenseite
    RemoteTrack(RemoteTrack),
    /// Von der Gegenseite ausgehandelter Data Channel
    DataChannel(Arc<dyn DataChannel>),
    ConnectionState(ConnectionState),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(t).finish(),
            PeerEvent::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            PeerEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
        }
    }
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// Events eines Data Channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    /// Ein Frame als Text (binäre Frames werden als UTF-8 interpretiert)
    Message(String),
    Closed,
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

// ============================================================================
// TRAITS
// ============================================================================

/// Bidirektionaler Data Channel auf einer Peer Connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Sendet einen Text-Frame
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self);

    /// Event-Empfänger; kann genau einmal abgeholt werden
    fn take_events(&self) -> Option<ChannelEvents>;
}

/// Eine Peer Connection (eine pro Session)
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erstellt Peer Connections mit der gegebenen ICE-Server-Konfiguration
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        ice_servers: &[IceServerConfig],
        ice_candidate_pool_size: u8,
    ) -> Result<(Arc<dyn PeerTransport>, PeerEvents), TransportError>;
}
