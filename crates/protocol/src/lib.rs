//! rendezvous-protocol – Signal-Vokabular und Wire-Format
//!
//! Definiert alle Events die zwischen Client und Relay ausgetauscht werden,
//! das Chat-Nachrichtenmodell (inkl. Anruf-Nachrichten) und den
//! Frame-Codec fuer die TCP-Verbindung.

pub mod message;
pub mod signal;
pub mod wire;

pub use message::{Benachrichtigung, ChatNachricht, NachrichtenTyp};
pub use signal::{AblehnGrund, ClientSignal, IceKandidat, RelaySignal, SitzungsBeschreibung};
pub use wire::FrameCodec;
