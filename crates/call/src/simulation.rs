//! Mikrofon und Peer-Engine ohne Hardware und Netzwerk
//!
//! Nur mit `cfg(test)` oder dem Feature `test-util` verfuegbar.

use async_trait::async_trait;
use parking_lot::Mutex;
use rendezvous_protocol::signal::SdpTyp;
use rendezvous_protocol::{IceKandidat, SitzungsBeschreibung};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{CallError, CallResult};
use crate::media::{MediaQuelle, MediaStream};
use crate::peer::{
    remote_beschreibung_pruefen, PeerEreignis, PeerEreignisSender, PeerFabrik, PeerKonfiguration,
    PeerRolle, PeerVerbindung,
};

// ---------------------------------------------------------------------------
// Mikrofon
// ---------------------------------------------------------------------------

/// Mikrofon ohne Hardware
///
/// Erzeugt stille Streams und merkt sich alle ausgegebenen Handles, damit
/// geprueft werden kann ob jeder Stream wieder freigegeben wurde.
#[derive(Debug, Default)]
pub struct SimuliertesMikrofon {
    verweigern: AtomicBool,
    zaehler: AtomicU64,
    ausgegeben: Mutex<Vec<MediaStream>>,
}

impl SimuliertesMikrofon {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Simuliert einen verweigerten Mikrofon-Zugriff
    pub fn verweigern_setzen(&self, verweigern: bool) {
        self.verweigern.store(verweigern, Ordering::Relaxed);
    }

    /// Alle bisher ausgegebenen Streams
    pub fn ausgegeben(&self) -> Vec<MediaStream> {
        self.ausgegeben.lock().clone()
    }

    /// Anzahl der noch laufenden Streams
    pub fn aktive_anzahl(&self) -> usize {
        self.ausgegeben
            .lock()
            .iter()
            .filter(|s| s.ist_aktiv())
            .count()
    }
}

#[async_trait]
impl MediaQuelle for SimuliertesMikrofon {
    async fn mikrofon_anfordern(&self) -> CallResult<MediaStream> {
        if self.verweigern.load(Ordering::Relaxed) {
            return Err(CallError::medien("Zugriff auf das Mikrofon verweigert"));
        }
        let nr = self.zaehler.fetch_add(1, Ordering::Relaxed) + 1;
        let stream = MediaStream::neu(format!("mikrofon-{nr}"));
        self.ausgegeben.lock().push(stream.clone());
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Peer-Engine
// ---------------------------------------------------------------------------

/// Peer-Engine ohne Netzwerk
///
/// Erzeugt syntaktisch gueltige SDP-Beschreibungen und meldet die
/// Verbindung als hergestellt sobald beide Beschreibungen gesetzt sind.
#[derive(Debug, Default)]
pub struct SimuliertePeerFabrik {
    fehlschlagen: AtomicBool,
    erstellt: AtomicUsize,
    geschlossen: Arc<AtomicUsize>,
    letzte: Mutex<Option<PeerEreignisSender>>,
}

impl SimuliertePeerFabrik {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Laesst das naechste `erstellen` fehlschlagen
    pub fn fehlschlagen_setzen(&self, fehlschlagen: bool) {
        self.fehlschlagen.store(fehlschlagen, Ordering::Relaxed);
    }

    pub fn erstellt(&self) -> usize {
        self.erstellt.load(Ordering::Relaxed)
    }

    pub fn geschlossen(&self) -> usize {
        self.geschlossen.load(Ordering::Relaxed)
    }

    /// Meldet fuer die zuletzt erstellte Verbindung einen Netzabbruch
    pub fn verbindung_abbrechen(&self) -> bool {
        match self.letzte.lock().as_ref() {
            Some(sender) => sender.senden(PeerEreignis::Geschlossen),
            None => false,
        }
    }
}

#[async_trait]
impl PeerFabrik for SimuliertePeerFabrik {
    async fn erstellen(
        &self,
        konfig: PeerKonfiguration,
        stream: MediaStream,
        ereignisse: PeerEreignisSender,
    ) -> CallResult<Box<dyn PeerVerbindung>> {
        if self.fehlschlagen.load(Ordering::Relaxed) {
            return Err(CallError::peer("ICE-Agent konnte nicht gestartet werden"));
        }
        self.erstellt.fetch_add(1, Ordering::Relaxed);
        *self.letzte.lock() = Some(ereignisse.clone());

        tracing::debug!(
            rolle = ?konfig.rolle,
            stun = %konfig.stun_server,
            versuch = ereignisse.versuch(),
            "Simulierte Peer-Verbindung erstellt"
        );

        let peer = SimulierterPeer {
            konfig,
            stream,
            ereignisse,
            remote_gesetzt: false,
            geschlossen: false,
            geschlossen_zaehler: Arc::clone(&self.geschlossen),
        };
        if peer.konfig.rolle == PeerRolle::Initiator {
            peer.beschreibung_melden(SdpTyp::Offer);
        }
        Ok(Box::new(peer))
    }
}

struct SimulierterPeer {
    konfig: PeerKonfiguration,
    stream: MediaStream,
    ereignisse: PeerEreignisSender,
    remote_gesetzt: bool,
    geschlossen: bool,
    geschlossen_zaehler: Arc<AtomicUsize>,
}

impl SimulierterPeer {
    fn beschreibung_melden(&self, typ: SdpTyp) {
        let sdp = sdp_erzeugen(self.ereignisse.versuch(), self.stream.id());
        let beschreibung = match typ {
            SdpTyp::Offer => SitzungsBeschreibung::offer(sdp),
            SdpTyp::Answer => SitzungsBeschreibung::answer(sdp),
        };
        self.ereignisse
            .senden(PeerEreignis::LokaleBeschreibung(beschreibung));
        self.ereignisse.senden(PeerEreignis::IceKandidat(IceKandidat {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
    }

    fn verbindung_melden(&self) {
        self.ereignisse.senden(PeerEreignis::RemoteStream {
            stream_id: format!("remote-{}", self.ereignisse.versuch()),
        });
        self.ereignisse.senden(PeerEreignis::Verbunden);
    }
}

impl PeerVerbindung for SimulierterPeer {
    fn remote_beschreibung_setzen(&mut self, beschreibung: SitzungsBeschreibung) -> CallResult<()> {
        if self.geschlossen {
            return Err(CallError::peer("Verbindung bereits geschlossen"));
        }
        remote_beschreibung_pruefen(self.konfig.rolle, beschreibung.typ, self.remote_gesetzt)?;
        self.remote_gesetzt = true;
        if self.konfig.rolle == PeerRolle::Responder {
            self.beschreibung_melden(SdpTyp::Answer);
        }
        self.verbindung_melden();
        Ok(())
    }

    fn ice_kandidat_hinzufuegen(&mut self, kandidat: IceKandidat) -> CallResult<()> {
        if self.geschlossen {
            return Err(CallError::peer("Verbindung bereits geschlossen"));
        }
        tracing::trace!(kandidat = %kandidat.candidate, "Remote-Kandidat hinzugefuegt");
        Ok(())
    }

    fn schliessen(&mut self) {
        if !self.geschlossen {
            self.geschlossen = true;
            self.geschlossen_zaehler.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Minimale Audio-SDP (Opus)
fn sdp_erzeugen(versuch: u64, stream_id: &str) -> String {
    format!(
        "v=0\r\no=- {versuch} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n\
         a=msid:{stream_id} audio\r\n"
    )
}
