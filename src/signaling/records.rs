//! Dokument-Typen des Signaling-Stores
//!
//! Diese Strukturen spiegeln das Dokument-Schema des geteilten Stores wider:
//! ein Call-Record mit Offer/Answer sowie zwei Candidate-Collections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Opake ID eines Call-Records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Erzeugt eine neue, zufällige ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// SESSION DESCRIPTION
// ============================================================================

/// SDP-Typ einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offer" => Some(SdpType::Offer),
            "answer" => Some(SdpType::Answer),
            "pranswer" => Some(SdpType::Pranswer),
            "rollback" => Some(SdpType::Rollback),
            _ => None,
        }
    }
}

/// `{type, sdp}` wie im Store abgelegt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

// ============================================================================
// ICE CANDIDATES
// ============================================================================

/// Rohe ICE-Candidate-Felder, so wie der Browser sie in `toJSON()` liefert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Welche der beiden Candidate-Collections eines Calls gemeint ist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateSide {
    /// `offererCandidates`: vom Anrufer geschrieben, vom Angerufenen gelesen
    #[serde(rename = "offererCandidates")]
    Offerer,
    /// `answererCandidates`: vom Angerufenen geschrieben, vom Anrufer gelesen
    #[serde(rename = "answererCandidates")]
    Answerer,
}

impl CandidateSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateSide::Offerer => "offererCandidates",
            CandidateSide::Answerer => "answererCandidates",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offererCandidates" => Some(CandidateSide::Offerer),
            "answererCandidates" => Some(CandidateSide::Answerer),
            _ => None,
        }
    }
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Rolle eines Teilnehmers (nur Diagnose, nicht protokollrelevant)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Answerer,
}

impl CallRole {
    /// Collection, in die diese Rolle ihre eigenen Candidates schreibt
    pub fn local_side(&self) -> CandidateSide {
        match self {
            CallRole::Caller => CandidateSide::Offerer,
            CallRole::Answerer => CandidateSide::Answerer,
        }
    }

    /// Collection, aus der diese Rolle die Candidates der Gegenseite liest
    pub fn remote_side(&self) -> CandidateSide {
        match self {
            CallRole::Caller => CandidateSide::Answerer,
            CallRole::Answerer => CandidateSide::Offerer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallRole::Caller => "caller",
            CallRole::Answerer => "answerer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "caller" => Some(CallRole::Caller),
            "answerer" => Some(CallRole::Answerer),
            _ => None,
        }
    }
}

/// Lebenszyklus eines Call-Records im Store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// ID vergeben, Offer noch nicht geschrieben
    Created,
    Offered,
    Answered,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Created => "created",
            CallStatus::Offered => "offered",
            CallStatus::Answered => "answered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(CallStatus::Created),
            "offered" => Some(CallStatus::Offered),
            "answered" => Some(CallStatus::Answered),
            _ => None,
        }
    }
}

/// Eine Signaling-Session im Store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offered_by: Option<CallRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_by: Option<CallRole>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    /// Frischer Record ohne Offer
    pub fn new(id: CallId) -> Self {
        Self {
            id,
            status: CallStatus::Created,
            offer: None,
            answer: None,
            offered_by: None,
            answered_by: None,
            created_at: Utc::now(),
            answered_at: None,
        }
    }
}
