//! Signal-Kanal des Controllers
//!
//! Abstraktion ueber den Relay-Client, damit der Controller auch ohne
//! TCP-Verbindung betrieben werden kann.

use rendezvous_core::types::UserId;
use rendezvous_protocol::{ClientSignal, RelaySignal};
use rendezvous_signaling::{RelayClient, RelayStatus};
use tokio::sync::{broadcast, watch};

/// Verbindung zum Relay aus Sicht des Controllers
pub trait SignalKanal: Send + Sync {
    /// Beim Relay registrierte eigene User-ID
    fn eigene_id(&self) -> UserId;

    /// Sendet ein Event (fire-and-forget); `false` wenn verworfen
    fn senden(&self, signal: ClientSignal) -> bool;

    fn abonnieren(&self) -> broadcast::Receiver<RelaySignal>;

    fn status_abonnieren(&self) -> watch::Receiver<RelayStatus>;
}

impl SignalKanal for RelayClient {
    fn eigene_id(&self) -> UserId {
        self.user_id()
    }

    fn senden(&self, signal: ClientSignal) -> bool {
        RelayClient::senden(self, signal)
    }

    fn abonnieren(&self) -> broadcast::Receiver<RelaySignal> {
        RelayClient::abonnieren(self)
    }

    fn status_abonnieren(&self) -> watch::Receiver<RelayStatus> {
        RelayClient::status_abonnieren(self)
    }
}
