//! rendezvous-core – Gemeinsame Typen
//!
//! Stellt die ID-Newtypes bereit, die von Protokoll, Relay und
//! Call-Controller gemeinsam genutzt werden. Fehler definiert jedes Crate
//! selbst (`SignalingError`, `CallError`).

pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use types::{CallId, MatchId, MessageId, UserId};
