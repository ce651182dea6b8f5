//! Peer-Verbindung (WebRTC-Naht)
//!
//! Die WebRTC-Engine selbst liegt hinter `PeerFabrik` / `PeerVerbindung`
//! (`rtc::WebRtcPeerFabrik`, fuer Tests `simulation::SimuliertePeerFabrik`).
//! Zwei Modi:
//! - Initiator: erzeugt nach dem Erstellen ein Offer
//! - Responder: erzeugt nach `remote_beschreibung_setzen(offer)` ein Answer
//!
//! Beide melden lokale Beschreibungen, ICE-Kandidaten und den Remote-Stream
//! ueber einen `PeerEreignisSender`. Jedes Ereignis traegt die
//! Versuchsnummer des Anrufs, damit Ereignisse eines abgebauten Versuchs
//! erkannt werden. Kein Datenkanal, kein Video, keine Neuverhandlung.

use async_trait::async_trait;
use rendezvous_protocol::signal::SdpTyp;
use rendezvous_protocol::{IceKandidat, SitzungsBeschreibung};
use tokio::sync::mpsc;

use crate::error::{CallError, CallResult};
use crate::media::MediaStream;

// ---------------------------------------------------------------------------
// Konfiguration und Ereignisse
// ---------------------------------------------------------------------------

/// Rolle der Peer-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRolle {
    Initiator,
    Responder,
}

/// Konfiguration einer Peer-Verbindung
#[derive(Debug, Clone)]
pub struct PeerKonfiguration {
    pub rolle: PeerRolle,
    /// Einziger ICE-Server, kein TURN
    pub stun_server: String,
}

/// Ereignisse einer Peer-Verbindung
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEreignis {
    /// Lokales Offer oder Answer, muss ueber den Relay zugestellt werden
    LokaleBeschreibung(SitzungsBeschreibung),
    /// Lokaler ICE-Kandidat
    IceKandidat(IceKandidat),
    /// Audio des Gegenuebers ist da
    RemoteStream { stream_id: String },
    /// ICE/DTLS abgeschlossen
    Verbunden,
    /// Verbindung wurde von der Gegenseite oder vom Netz beendet
    Geschlossen,
}

/// Sender fuer Peer-Ereignisse eines bestimmten Anrufversuchs
#[derive(Debug, Clone)]
pub struct PeerEreignisSender {
    versuch: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEreignis)>,
}

impl PeerEreignisSender {
    pub fn neu(versuch: u64, tx: mpsc::UnboundedSender<(u64, PeerEreignis)>) -> Self {
        Self { versuch, tx }
    }

    pub fn versuch(&self) -> u64 {
        self.versuch
    }

    /// Meldet ein Ereignis; `false` wenn der Controller nicht mehr laeuft
    pub fn senden(&self, ereignis: PeerEreignis) -> bool {
        self.tx.send((self.versuch, ereignis)).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Erzeugt Peer-Verbindungen
#[async_trait]
pub trait PeerFabrik: Send + Sync {
    /// Erstellt eine Verbindung mit dem lokalen Mikrofon-Stream
    async fn erstellen(
        &self,
        konfig: PeerKonfiguration,
        stream: MediaStream,
        ereignisse: PeerEreignisSender,
    ) -> CallResult<Box<dyn PeerVerbindung>>;
}

/// Eine einzelne Peer-Verbindung
pub trait PeerVerbindung: Send {
    /// Setzt Offer (Responder) oder Answer (Initiator) der Gegenseite
    fn remote_beschreibung_setzen(&mut self, beschreibung: SitzungsBeschreibung) -> CallResult<()>;

    fn ice_kandidat_hinzufuegen(&mut self, kandidat: IceKandidat) -> CallResult<()>;

    /// Schliesst die Verbindung; weitere Aufrufe sind wirkungslos
    fn schliessen(&mut self);
}

/// Prueft ob eine Remote-Beschreibung zur Rolle passt
///
/// Der Responder erwartet genau ein Offer, der Initiator genau ein Answer.
pub(crate) fn remote_beschreibung_pruefen(
    rolle: PeerRolle,
    typ: SdpTyp,
    bereits_gesetzt: bool,
) -> CallResult<()> {
    if bereits_gesetzt {
        return Err(CallError::peer("Neuverhandlung wird nicht unterstuetzt"));
    }
    match (rolle, typ) {
        (PeerRolle::Responder, SdpTyp::Offer) | (PeerRolle::Initiator, SdpTyp::Answer) => Ok(()),
        (rolle, typ) => Err(CallError::peer(format!(
            "{typ:?} passt nicht zur Rolle {rolle:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beschreibung_passend_zur_rolle() {
        assert!(remote_beschreibung_pruefen(PeerRolle::Responder, SdpTyp::Offer, false).is_ok());
        assert!(remote_beschreibung_pruefen(PeerRolle::Initiator, SdpTyp::Answer, false).is_ok());
        assert!(remote_beschreibung_pruefen(PeerRolle::Initiator, SdpTyp::Offer, false).is_err());
        assert!(remote_beschreibung_pruefen(PeerRolle::Responder, SdpTyp::Answer, false).is_err());
        assert!(matches!(
            remote_beschreibung_pruefen(PeerRolle::Initiator, SdpTyp::Answer, true),
            Err(CallError::Peer(_))
        ));
    }

    #[tokio::test]
    async fn sender_traegt_versuch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = PeerEreignisSender::neu(3, tx);
        assert!(sender.senden(PeerEreignis::Verbunden));
        assert_eq!(rx.recv().await, Some((3, PeerEreignis::Verbunden)));

        drop(rx);
        assert!(!sender.senden(PeerEreignis::Geschlossen));
    }
}
