//! Call Engine Module - WebRTC Peer Connections
//!
//! Dieses Modul verwaltet:
//! - Peer Connections (webrtc-rs oder austauschbar über `PeerConnector`)
//! - Lokale und entfernte Media-Tracks
//! - Den ICE Candidate Buffer
//! - Den Ablauf einer Session (Anrufen, Annehmen, Auflegen)

mod candidates;
mod engine;
mod media;
mod rtc;
mod session;
mod transport;

pub use candidates::{CandidateApplicationError, Enqueued, IceCandidateBuffer};
pub use engine::{CallEngine, CallEngineError, CallEvent, CallState, ErrorKind};
pub use media::{
    LocalMedia, LocalTrack, MediaAccessError, MediaSource, RemoteStream, RemoteTrack,
    RtcMediaSource, TrackKind,
};
pub use rtc::{RtcConnector, RtcDataChannel, RtcPeerTransport};
pub use transport::{
    ChannelEvent, ChannelEvents, ConnectionState, DataChannel, PeerConnector, PeerEvent,
    PeerEvents, PeerTransport, TransportError,
};
