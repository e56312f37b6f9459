//! WebRTC Peer Transport
//!
//! Implementiert die Transport-Traits mit webrtc-rs. Die Callbacks der
//! RTCPeerConnection werden in `PeerEvent`s übersetzt.

use super::media::{LocalTrack, RemoteTrack, TrackKind};
use super::transport::{
    ChannelEvent, ChannelEvents, ConnectionState, DataChannel, PeerConnector, PeerEvent,
    PeerEvents, PeerTransport, TransportError,
};
use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn webrtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRTC(e.to_string())
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(TransportError::InvalidSdp(
                "rollback is not supported".to_string(),
            ))
        }
    };
    result.map_err(|e| TransportError::InvalidSdp(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TransportError::InvalidSdp("unspecified sdp type".to_string()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn from_rtc_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Erstellt webrtc-rs Peer Connections
#[derive(Debug, Clone, Default)]
pub struct RtcConnector;

impl RtcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        ice_servers: &[IceServerConfig],
        ice_candidate_pool_size: u8,
    ) -> Result<(Arc<dyn PeerTransport>, PeerEvents), TransportError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        // RTCConfiguration mit ICE Servern
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ice_candidate_pool_size,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        register_handlers(&pc, event_tx);

        Ok((Arc::new(RtcPeerTransport { pc }), event_rx))
    }
}

/// Registriert Event Handler für die Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, event_tx: mpsc::UnboundedSender<PeerEvent>) {
    // Connection State Handler
    let tx = event_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        let _ = tx.send(PeerEvent::ConnectionState(from_rtc_state(s)));
        Box::pin(async {})
    }));

    // ICE Candidate Handler
    let tx = event_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let event = match candidate {
            Some(c) => match c.to_json() {
                Ok(init) => Some(PeerEvent::LocalCandidate(Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                }))),
                Err(e) => {
                    tracing::warn!("Failed to serialize local ICE candidate: {}", e);
                    None
                }
            },
            None => Some(PeerEvent::LocalCandidate(None)),
        };
        if let Some(event) = event {
            let _ = tx.send(event);
        }
        Box::pin(async {})
    }));

    // Track Handler (eingehende Media der Gegenseite)
    let tx = event_tx.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        tracing::info!("Received {:?} track: {:?}", kind, track.codec());
        let _ = tx.send(PeerEvent::RemoteTrack(RemoteTrack::new(
            track.id().to_string(),
            kind,
        )));
        Box::pin(async {})
    }));

    // Data Channels, die die Gegenseite ausgehandelt hat
    let tx = event_tx;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        tracing::info!("Incoming data channel '{}'", dc.label());
        let channel: Arc<dyn DataChannel> = RtcDataChannel::wrap(dc);
        let _ = tx.send(PeerEvent::DataChannel(channel));
        Box::pin(async {})
    }));
}

// ============================================================================
// PEER TRANSPORT
// ============================================================================

/// Peer Connection auf Basis von `RTCPeerConnection`
pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let rtc_track = track.rtc_track().ok_or_else(|| {
            TransportError::WebRTC(format!("track {} has no RTP source", track.id()))
        })?;

        self.pc
            .add_track(rtc_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        // Ohne Init: ordered + reliable
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(webrtc_err)?;
        Ok(RtcDataChannel::wrap(dc))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(webrtc_err)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(webrtc_err)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(webrtc_err)
    }
}

// ============================================================================
// DATA CHANNEL
// ============================================================================

/// `RTCDataChannel` mit Events über einen Channel
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    events: Mutex<Option<ChannelEvents>>,
}

impl RtcDataChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let close_tx = tx.clone();
        dc.on_close(Box::new(move || {
            let _ = close_tx.send(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            let _ = tx.send(ChannelEvent::Message(text));
            Box::pin(async {})
        }));

        Arc::new(Self {
            label: dc.label().to_string(),
            dc,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen);
        }
        self.dc.send_text(text).await.map_err(webrtc_err)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            tracing::debug!("Closing data channel '{}' failed: {}", self.label, e);
        }
    }

    fn take_events(&self) -> Option<ChannelEvents> {
        self.events.lock().take()
    }
}
