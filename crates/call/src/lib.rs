//! rendezvous-call – Anruf-Controller fuer Sprachanrufe zwischen Matches
//!
//! Steuert den Lebenszyklus eines 1:1-Sprachanrufs auf Client-Seite:
//! Berechtigungs-Handshake, Klingeln mit Frist, Aufbau der
//! Peer-Verbindung, Auflegen und die Anruf-Nachrichten in der
//! Match-History.
//!
//! ## Architektur
//!
//! ```text
//! Oberflaeche
//!     |  CallHandle (Befehle, Zustand via watch, Ereignisse via broadcast)
//!     v
//! CallController-Task (ein Task pro Sitzung, besitzt den Zustand)
//!     |-- SignalKanal   (RelayClient: Events an/vom Relay)
//!     |-- MediaQuelle   (Mikrofon: CpalMikrofon)
//!     |-- PeerFabrik    (WebRTC-Engine: WebRtcPeerFabrik)
//!     '-- Persistenz    (lokaler Cache + Backend)
//! ```
//!
//! Die Geraete-Anbindung haengt am Feature `geraete` (Standard). Mit
//! `test-util` stehen ein simuliertes Mikrofon und eine simulierte
//! Peer-Engine bereit.

pub mod config;
pub mod controller;
pub mod ereignis;
pub mod error;
pub mod handle;
pub mod kanal;
pub mod media;
#[cfg(feature = "geraete")]
pub mod mikrofon;
pub mod peer;
pub mod permission;
pub mod persistence;
#[cfg(feature = "geraete")]
pub mod rtc;
#[cfg(any(test, feature = "test-util"))]
pub mod simulation;
pub mod state;

pub use config::CallKonfiguration;
pub use controller::CallController;
pub use ereignis::{AbschlussGrund, CallEreignis};
pub use error::{CallError, CallResult};
pub use handle::CallHandle;
pub use kanal::SignalKanal;
pub use media::{MediaQuelle, MediaStream};
#[cfg(feature = "geraete")]
pub use mikrofon::{CpalMikrofon, MikrofonKonfiguration};
pub use peer::{PeerFabrik, PeerVerbindung};
pub use permission::BerechtigungsCache;
pub use persistence::{LokalerCache, MatchSpeicher, NachrichtenSpeicher, Persistenz, RestSpeicher};
#[cfg(feature = "geraete")]
pub use rtc::{RemotePaket, WebRtcPeerFabrik};
#[cfg(any(test, feature = "test-util"))]
pub use simulation::{SimuliertePeerFabrik, SimuliertesMikrofon};
pub use state::{CallRolle, CallSession, CallStatus, CallZustand};
