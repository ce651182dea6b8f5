//! rendezvous-signaling – Relay fuer Anruf-Signale
//!
//! Der Relay ist eine duenne Pub/Sub-Leitung: Clients registrieren sich mit
//! ihrer User-ID (`add-user`) und adressieren Events an andere User-IDs.
//! Der Relay uebersetzt jedes ausgehende Event in das passende eingehende
//! Event des Empfaengers und setzt den Absender. Es gibt keine
//! Bestaetigungen und keine Wiederholungen.
//!
//! ## Architektur
//!
//! ```text
//! TCP Listener (RelayServer)
//!     |
//!     v
//! ClientConnection (pro Verbindung ein Task)
//!     |  State Machine: Verbunden -> Registriert -> Trennend
//!     |
//!     v
//! SignalRouter  ->  EventBroadcaster (UserId -> Send-Queue)
//!
//! PresenceManager – Wer ist online (Quelle fuer `get-users`)
//!
//! RelayClient (Client-Seite) – ueberwachte Verbindung mit Reconnect/Backoff
//! ```

pub mod broadcast;
pub mod client;
pub mod connection;
pub mod error;
pub mod presence;
pub mod router;
pub mod server_state;
pub mod tcp;

// Bequeme Re-Exporte
pub use broadcast::EventBroadcaster;
pub use client::{RelayClient, RelayClientKonfiguration, RelayStatus};
pub use connection::ClientConnection;
pub use error::{SignalingError, SignalingResult};
pub use presence::PresenceManager;
pub use router::SignalRouter;
pub use server_state::{RelayKonfiguration, RelayState};
pub use tcp::RelayServer;
