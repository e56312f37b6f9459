//! Gift Call - P2P Video Calls mit Gift-Kanal
//!
//! Eine serverlose P2P Video-Call-Bibliothek mit:
//! - Geteiltem Dokument-Store als Signaling (SQLite oder im Speicher)
//! - WebRTC für Audio/Video zwischen genau zwei Teilnehmern
//! - Einem eigenen Data Channel für animierte Gifts
//! - Einem Controller, der Engine-Events für eine Oberfläche aufbereitet

pub mod call_engine;
pub mod config;
pub mod controller;
pub mod gifts;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testing;

pub use call_engine::{CallEngine, CallEngineError, CallEvent, CallState, ErrorKind};
pub use config::{CallConfig, ConfigError};
pub use controller::{CallController, CallObserver, ControllerError, LifecyclePhase};
pub use gifts::{GiftBackground, GiftChannelMessage};
pub use signaling::{CallId, MemoryStore, SignalingError, SignalingStore, SqliteStore};

/// Standard-Filter, falls `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "gift_call=debug,webrtc=warn";

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging (mehrfacher Aufruf ist harmlos)
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
