//! Gift Data Channel
//!
//! Eigener, zuverlässiger und geordneter Data Channel mit festem Label.
//! Der Anrufer legt ihn vor dem Offer an, damit er im ersten
//! Offer/Answer-Austausch mit ausgehandelt wird.

use super::message::{GiftChannelError, GiftChannelMessage};
use crate::call_engine::{ChannelEvent, DataChannel, PeerTransport, TransportError};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Label, an dem die Gegenseite den Gift-Kanal erkennt
pub const GIFT_CHANNEL_LABEL: &str = "gifts";

/// Empfänger-Seite des Gift-Protokolls
pub trait GiftListener: Send + Sync {
    /// Kanal offen (`true`) oder geschlossen (`false`)
    fn on_ready(&self, open: bool);

    fn on_gift(&self, gift: GiftChannelMessage);
}

/// Handle auf den Gift Data Channel einer Session
#[derive(Clone)]
pub struct GiftChannel {
    channel: Arc<dyn DataChannel>,
}

impl GiftChannel {
    /// Legt den Kanal auf der Anrufer-Seite an (Default: reliable + ordered)
    pub async fn open(transport: &dyn PeerTransport) -> Result<Self, TransportError> {
        let channel = transport.create_data_channel(GIFT_CHANNEL_LABEL).await?;
        tracing::debug!("Created gift data channel");
        Ok(Self { channel })
    }

    /// Übernimmt einen eingehenden Kanal, falls er das Gift-Label trägt
    pub fn accept(channel: Arc<dyn DataChannel>) -> Option<Self> {
        if channel.label() != GIFT_CHANNEL_LABEL {
            tracing::debug!("Ignoring data channel '{}'", channel.label());
            return None;
        }
        Some(Self { channel })
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn label(&self) -> &str {
        self.channel.label()
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}

impl std::fmt::Debug for GiftChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GiftChannel")
            .field("label", &self.channel.label())
            .field("open", &self.channel.is_open())
            .finish()
    }
}

/// Startet den Empfangs-Task für einen Gift-Kanal
///
/// Meldet `on_ready(true)` beim Öffnen, `on_ready(false)` beim Schließen und
/// jede gültige Nachricht über `on_gift`. Ungültige Frames werden geloggt und
/// verworfen. `None`, falls die Events des Kanals schon abgeholt wurden.
pub fn attach_receiver(
    channel: &GiftChannel,
    listener: Arc<dyn GiftListener>,
) -> Option<JoinHandle<()>> {
    let mut events = channel.channel.take_events()?;
    let mut ready = channel.is_open();
    if ready {
        listener.on_ready(true);
    }

    Some(tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => {
                    if !ready {
                        ready = true;
                        tracing::info!("Gift channel open");
                        listener.on_ready(true);
                    }
                }
                ChannelEvent::Message(frame) => match GiftChannelMessage::parse_frame(&frame) {
                    Ok(gift) => listener.on_gift(gift),
                    Err(e) => tracing::warn!("Dropping gift frame: {}", e),
                },
                ChannelEvent::Closed => {
                    tracing::info!("Gift channel closed");
                    if ready {
                        ready = false;
                        listener.on_ready(false);
                    }
                    break;
                }
            }
        }
    }))
}

/// Sendet ein Gift, falls der Kanal existiert und offen ist
///
/// Best-effort: ohne offenen Kanal passiert nichts, es wird nichts für
/// später vorgemerkt. Gibt zurück, ob der Frame übergeben wurde.
pub async fn send_gift(channel: Option<&GiftChannel>, gift: &GiftChannelMessage) -> bool {
    let Some(channel) = channel.filter(|c| c.is_open()) else {
        tracing::debug!("{}; gift '{}' dropped", GiftChannelError::NotOpen, gift.title);
        return false;
    };

    let frame = match gift.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("{}", e);
            return false;
        }
    };

    match channel.channel.send_text(frame).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("{}", GiftChannelError::Send(e.to_string()));
            false
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
