//! Gifts Module - Gift-Events über einen eigenen Data Channel
//!
//! Dieses Modul verwaltet:
//! - Das JSON Wire-Format der Gift-Nachrichten
//! - Anlegen/Annehmen des Gift Data Channels
//! - Senden (best-effort) und Empfangen von Gifts

mod channel;
mod message;

pub use channel::{attach_receiver, send_gift, GiftChannel, GiftListener, GIFT_CHANNEL_LABEL};
pub use message::{GiftBackground, GiftChannelError, GiftChannelMessage, GIFT_MESSAGE_TYPE};
