//! Wire-Format der Gift-Nachrichten
//!
//! Ein Frame auf dem Gift Data Channel ist genau ein JSON-Objekt:
//! `{type: "GIFT", videoUrl, background, title}`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Wert des `type`-Felds jeder Gift-Nachricht
pub const GIFT_MESSAGE_TYPE: &str = "GIFT";

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler auf dem Gift-Kanal; wird nie zu einem Call-Fehler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GiftChannelError {
    #[error("Malformed gift message: {0}")]
    Malformed(String),

    #[error("Unexpected message type: {0}")]
    UnexpectedType(String),

    #[error("Gift channel is not open")]
    NotOpen,

    #[error("Failed to send gift: {0}")]
    Send(String),
}

// ============================================================================
// BACKGROUND
// ============================================================================

/// Hintergrund-Variante der Gift-Animation
///
/// Wird nur transportiert, nie interpretiert. Unbekannte Tags landen bei `Default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GiftBackground {
    Roses,
    Explosion,
    Car,
    #[default]
    Default,
}

impl GiftBackground {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiftBackground::Roses => "roses",
            GiftBackground::Explosion => "explosion",
            GiftBackground::Car => "car",
            GiftBackground::Default => "default",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "roses" => GiftBackground::Roses,
            "explosion" => GiftBackground::Explosion,
            "car" => GiftBackground::Car,
            _ => GiftBackground::Default,
        }
    }
}

impl Serialize for GiftBackground {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for GiftBackground {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(GiftBackground::parse(&raw))
    }
}

// ============================================================================
// MESSAGE
// ============================================================================

/// Eine Gift-Nachricht auf dem Data Channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftChannelMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "videoUrl")]
    pub video_url: String,
    pub background: GiftBackground,
    pub title: String,
}

impl GiftChannelMessage {
    pub fn new(
        video_url: impl Into<String>,
        background: GiftBackground,
        title: impl Into<String>,
    ) -> Self {
        Self {
            msg_type: GIFT_MESSAGE_TYPE.to_string(),
            video_url: video_url.into(),
            background,
            title: title.into(),
        }
    }

    /// Serialisiert als einzelner Text-Frame
    pub fn to_frame(&self) -> Result<String, GiftChannelError> {
        serde_json::to_string(self).map_err(|e| GiftChannelError::Malformed(e.to_string()))
    }

    /// Parst einen empfangenen Frame; alles außer `type: "GIFT"` wird abgelehnt
    pub fn parse_frame(frame: &str) -> Result<Self, GiftChannelError> {
        let value: serde_json::Value =
            serde_json::from_str(frame).map_err(|e| GiftChannelError::Malformed(e.to_string()))?;

        match value.get("type").and_then(|t| t.as_str()) {
            Some(GIFT_MESSAGE_TYPE) => {}
            Some(other) => return Err(GiftChannelError::UnexpectedType(other.to_string())),
            None => return Err(GiftChannelError::Malformed("missing type".to_string())),
        }

        serde_json::from_value(value).map_err(|e| GiftChannelError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_uses_wire_field_names() {
        let gift = GiftChannelMessage::new("roses.webm", GiftBackground::Roses, "Roses");
        let value: serde_json::Value = serde_json::from_str(&gift.to_frame().unwrap()).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "type": "GIFT",
                "videoUrl": "roses.webm",
                "background": "roses",
                "title": "Roses"
            })
        );
    }

    #[test]
    fn test_rejects_other_types_and_garbage() {
        assert!(matches!(
            GiftChannelMessage::parse_frame(r#"{"type":"CHAT","text":"hi"}"#),
            Err(GiftChannelError::UnexpectedType(t)) if t == "CHAT"
        ));
        assert!(matches!(
            GiftChannelMessage::parse_frame("not json"),
            Err(GiftChannelError::Malformed(_))
        ));
        assert!(matches!(
            GiftChannelMessage::parse_frame(r#"{"videoUrl":"x"}"#),
            Err(GiftChannelError::Malformed(_))
        ));
        assert!(matches!(
            GiftChannelMessage::parse_frame(r#"{"type":"GIFT","title":"no video"}"#),
            Err(GiftChannelError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_background_falls_back_to_default() {
        let gift = GiftChannelMessage::parse_frame(
            r#"{"type":"GIFT","videoUrl":"u.webm","background":"fireworks","title":"F"}"#,
        )
        .unwrap();
        assert_eq!(gift.background, GiftBackground::Default);
    }
}
