//! Signaling Module - Offer/Answer/Candidate-Austausch über einen Dokument-Store
//!
//! Dieses Modul verwaltet:
//! - Call-Records mit Offer und Answer (jeweils genau einmal schreibbar)
//! - Zwei Append-only Candidate-Collections pro Call
//! - Abonnements mit explizitem Abmelden
//!

mod memory;
mod records;
mod sqlite;
mod store;

pub use memory::MemoryStore;
pub use records::*;
pub use sqlite::{SqliteStore, DEFAULT_POLL_INTERVAL, MIN_POLL_INTERVAL};
pub use store::{CancelHandle, SignalingError, SignalingStore, Subscription};
