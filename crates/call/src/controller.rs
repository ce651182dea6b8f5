//! Anruf-Controller
//!
//! Ein Controller pro angemeldeter Sitzung, als eigener tokio-Task. Der
//! Task ist alleiniger Besitzer des Anrufzustands und wartet per
//! `select!` auf:
//! - Befehle der Oberflaeche (`CallHandle`)
//! - eingehende Relay-Events
//! - Ereignisse der Peer-Verbindung
//! - die Frist des aktuellen Versuchs
//! - den Verbindungsstatus des Relays
//!
//! Es gibt hoechstens einen aktiven Anrufversuch. Jeder Versuch hat eine
//! `CallId` (auf dem Draht) und eine lokale Versuchsnummer (fuer
//! Peer-Ereignisse); Signale eines anderen Versuchs werden verworfen.
//! Beim Wechsel nach `idle` werden Mikrofon, Peer-Verbindung und Frist
//! genau einmal freigegeben.

use rendezvous_core::types::{CallId, MatchId, UserId};
use rendezvous_observability::AnrufMetriken;
use rendezvous_protocol::signal::SdpTyp;
use rendezvous_protocol::{
    AblehnGrund, ChatNachricht, ClientSignal, IceKandidat, NachrichtenTyp, RelaySignal,
    SitzungsBeschreibung,
};
use rendezvous_signaling::RelayStatus;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::CallKonfiguration;
use crate::ereignis::{AbschlussGrund, CallEreignis};
use crate::error::{CallError, CallResult};
use crate::handle::{CallBefehl, CallHandle};
use crate::kanal::SignalKanal;
use crate::media::{MediaQuelle, MediaStream};
use crate::peer::{
    PeerEreignis, PeerEreignisSender, PeerFabrik, PeerKonfiguration, PeerRolle, PeerVerbindung,
};
use crate::permission::BerechtigungsCache;
use crate::persistence::Persistenz;
use crate::state::{CallRolle, CallSession, CallStatus, CallZustand};

/// Groesse der Befehls-Queue
const BEFEHL_QUEUE_GROESSE: usize = 32;
/// Groesse des Ereignis-Kanals
const EREIGNIS_KANAL_GROESSE: usize = 128;
/// Obergrenze fuer ICE-Kandidaten die vor der Peer-Verbindung eintreffen
const MAX_AUSSTEHENDE_KANDIDATEN: usize = 64;

// Labels fuer `rendezvous_calls_total`
const ERGEBNIS_GESTARTET: &str = "gestartet";
const ERGEBNIS_VERBUNDEN: &str = "verbunden";
const ERGEBNIS_VERPASST: &str = "verpasst";
const ERGEBNIS_ABGELEHNT: &str = "abgelehnt";
const ERGEBNIS_FEHLGESCHLAGEN: &str = "fehlgeschlagen";

// ---------------------------------------------------------------------------
// CallController (Aufbau)
// ---------------------------------------------------------------------------

/// Baut und startet den Anruf-Controller einer Sitzung
pub struct CallController {
    konfig: CallKonfiguration,
    kanal: Arc<dyn SignalKanal>,
    media: Arc<dyn MediaQuelle>,
    peers: Arc<dyn PeerFabrik>,
    persistenz: Persistenz,
    metriken: Option<AnrufMetriken>,
}

impl CallController {
    pub fn neu(
        kanal: Arc<dyn SignalKanal>,
        media: Arc<dyn MediaQuelle>,
        peers: Arc<dyn PeerFabrik>,
        persistenz: Persistenz,
    ) -> Self {
        Self {
            konfig: CallKonfiguration::default(),
            kanal,
            media,
            peers,
            persistenz,
            metriken: None,
        }
    }

    pub fn mit_konfiguration(mut self, konfig: CallKonfiguration) -> Self {
        self.konfig = konfig;
        self
    }

    pub fn mit_metriken(mut self, metriken: AnrufMetriken) -> Self {
        self.metriken = Some(metriken);
        self
    }

    /// Startet den Controller-Task
    ///
    /// Muss innerhalb einer tokio-Runtime aufgerufen werden. Der Task
    /// endet mit `CallHandle::beenden` oder wenn alle Handles gedroppt sind.
    pub fn starten(self) -> CallHandle {
        let (befehl_tx, befehl_rx) = mpsc::channel(BEFEHL_QUEUE_GROESSE);
        let (zustand_tx, zustand_rx) = watch::channel(CallZustand::default());
        let (ereignis_tx, _) = broadcast::channel(EREIGNIS_KANAL_GROESSE);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        // Vor dem Spawn abonnieren, damit kein Event verloren geht
        let relay_rx = self.kanal.abonnieren();
        let status_rx = self.kanal.status_abonnieren();

        let aktor = Aktor {
            eigene_id: self.kanal.eigene_id(),
            berechtigungen: BerechtigungsCache::neu(self.konfig.berechtigung_ttl),
            konfig: self.konfig,
            kanal: self.kanal,
            media: self.media,
            peers: self.peers,
            persistenz: self.persistenz,
            metriken: self.metriken,
            anruf: None,
            letzter_versuch: 0,
            relay_verbunden: false,
            zustand_tx,
            ereignis_tx: ereignis_tx.clone(),
            peer_tx,
        };
        tokio::spawn(aktor.laufen(befehl_rx, relay_rx, status_rx, peer_rx));

        CallHandle {
            befehl_tx,
            zustand_rx,
            ereignis_tx,
        }
    }
}

// ---------------------------------------------------------------------------
// Aktiver Anrufversuch
// ---------------------------------------------------------------------------

struct AktiverAnruf {
    session: CallSession,
    media: Option<MediaStream>,
    peer: Option<Box<dyn PeerVerbindung>>,
    /// Ablauf der Frist in `requesting` / `outgoing`
    frist: Option<Instant>,
    /// Offer aus `call-made`, bis der Anruf angenommen wird
    remote_offer: Option<SitzungsBeschreibung>,
    /// ICE-Kandidaten die vor der Peer-Verbindung eintrafen
    ausstehende_kandidaten: VecDeque<IceKandidat>,
}

impl AktiverAnruf {
    fn neu(session: CallSession) -> Self {
        Self {
            session,
            media: None,
            peer: None,
            frist: None,
            remote_offer: None,
            ausstehende_kandidaten: VecDeque::new(),
        }
    }

    /// Puffert einen Kandidaten; bei vollem Puffer faellt der aelteste weg
    fn kandidat_puffern(&mut self, kandidat: IceKandidat) {
        if self.ausstehende_kandidaten.len() >= MAX_AUSSTEHENDE_KANDIDATEN {
            self.ausstehende_kandidaten.pop_front();
            tracing::debug!(call_id = %self.session.call_id, "Kandidaten-Puffer voll, aeltester verworfen");
        }
        self.ausstehende_kandidaten.push_back(kandidat);
    }
}

async fn frist_abwarten(frist: Option<Instant>) {
    match frist {
        Some(zeitpunkt) => tokio::time::sleep_until(zeitpunkt).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Aktor
// ---------------------------------------------------------------------------

struct Aktor {
    eigene_id: UserId,
    konfig: CallKonfiguration,
    kanal: Arc<dyn SignalKanal>,
    media: Arc<dyn MediaQuelle>,
    peers: Arc<dyn PeerFabrik>,
    persistenz: Persistenz,
    metriken: Option<AnrufMetriken>,
    berechtigungen: BerechtigungsCache,
    anruf: Option<AktiverAnruf>,
    letzter_versuch: u64,
    relay_verbunden: bool,
    zustand_tx: watch::Sender<CallZustand>,
    ereignis_tx: broadcast::Sender<CallEreignis>,
    peer_tx: mpsc::UnboundedSender<(u64, PeerEreignis)>,
}

impl Aktor {
    async fn laufen(
        mut self,
        mut befehl_rx: mpsc::Receiver<CallBefehl>,
        mut relay_rx: broadcast::Receiver<RelaySignal>,
        mut status_rx: watch::Receiver<RelayStatus>,
        mut peer_rx: mpsc::UnboundedReceiver<(u64, PeerEreignis)>,
    ) {
        self.relay_verbunden = *status_rx.borrow_and_update() == RelayStatus::Verbunden;
        tracing::info!(user_id = %self.eigene_id, "Anruf-Controller gestartet");

        let mut fertig: Option<oneshot::Sender<()>> = None;

        loop {
            let frist = self.anruf.as_ref().and_then(|a| a.frist);

            tokio::select! {
                befehl = befehl_rx.recv() => {
                    let Some(befehl) = befehl else { break };
                    if let ControlFlow::Break(tx) = self.befehl_verarbeiten(befehl).await {
                        fertig = Some(tx);
                        break;
                    }
                }

                signal = relay_rx.recv() => {
                    match signal {
                        Ok(signal) => self.signal_verarbeiten(signal).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(verpasst = n, "Relay-Events verpasst");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::warn!("Relay-Client beendet");
                            break;
                        }
                    }
                }

                Some((versuch, ereignis)) = peer_rx.recv() => {
                    self.peer_ereignis(versuch, ereignis);
                }

                _ = frist_abwarten(frist) => self.frist_abgelaufen(),

                aenderung = status_rx.changed() => {
                    match aenderung {
                        Ok(()) => {
                            let status = *status_rx.borrow_and_update();
                            self.relay_status(status);
                        }
                        Err(_) => {
                            self.relay_status(RelayStatus::Beendet);
                            break;
                        }
                    }
                }
            }
        }

        self.sitzung_beenden();
        tracing::info!(user_id = %self.eigene_id, "Anruf-Controller beendet");
        if let Some(tx) = fertig {
            let _ = tx.send(());
        }
    }

    // -----------------------------------------------------------------------
    // Befehle
    // -----------------------------------------------------------------------

    /// `Break` beendet die Sitzung
    async fn befehl_verarbeiten(&mut self, befehl: CallBefehl) -> ControlFlow<oneshot::Sender<()>> {
        match befehl {
            CallBefehl::Anrufen {
                gegenueber,
                match_id,
                antwort,
            } => {
                let ergebnis = self.anrufen(gegenueber, match_id).await;
                let _ = antwort.send(ergebnis);
            }
            CallBefehl::BerechtigungBeantworten { erlauben, antwort } => {
                let _ = antwort.send(self.berechtigung_beantworten(erlauben));
            }
            CallBefehl::Annehmen { antwort } => {
                let ergebnis = self.annehmen().await;
                let _ = antwort.send(ergebnis);
            }
            CallBefehl::Ablehnen { antwort } => {
                let _ = antwort.send(self.ablehnen());
            }
            CallBefehl::Auflegen { antwort } => {
                let _ = antwort.send(self.auflegen());
            }
            CallBefehl::StummSchalten { stumm, antwort } => {
                let _ = antwort.send(self.stumm_schalten(stumm));
            }
            CallBefehl::Minimieren { minimiert, antwort } => {
                let _ = antwort.send(self.minimieren(minimiert));
            }
            CallBefehl::Beenden { fertig } => return ControlFlow::Break(fertig),
        }
        ControlFlow::Continue(())
    }

    async fn anrufen(&mut self, gegenueber: UserId, match_id: MatchId) -> CallResult<CallId> {
        if self.anruf.is_some() {
            return Err(CallError::BereitsAktiv);
        }
        if gegenueber == self.eigene_id {
            return Err(CallError::UngueltigerEmpfaenger(
                "eigene User-ID".to_string(),
            ));
        }
        if !self.relay_verbunden {
            return Err(CallError::RelayGetrennt);
        }

        let erlaubt = self.berechtigung_pruefen(gegenueber, match_id).await;
        let call_id = CallId::new();
        let versuch = self.naechster_versuch();
        self.anruf = Some(AktiverAnruf::neu(CallSession::neu(
            call_id,
            versuch,
            gegenueber,
            match_id,
            CallRolle::Anrufer,
            CallStatus::Idle,
        )));
        self.metrik(ERGEBNIS_GESTARTET);

        if erlaubt {
            tracing::info!(call_id = %call_id, gegenueber = %gegenueber, "Berechtigung vorhanden – direkter Anruf");
            self.status_setzen(CallStatus::Outgoing);
            self.ausgehend_starten().await?;
        } else {
            tracing::info!(call_id = %call_id, gegenueber = %gegenueber, "Berechtigung wird angefragt");
            self.status_setzen(CallStatus::Requesting);
            self.senden(ClientSignal::RequestVoicePermission {
                to: gegenueber,
                match_id,
                call_id,
            });
            self.protokollieren(NachrichtenTyp::CallRequest);
        }
        Ok(call_id)
    }

    fn berechtigung_beantworten(&mut self, erlauben: bool) -> CallResult<()> {
        let session = self.erwarte(CallStatus::IncomingRequest, "berechtigung beantworten")?;
        let (gegenueber, match_id, call_id) = (session.gegenueber, session.match_id, session.call_id);

        if erlauben {
            self.senden(ClientSignal::VoicePermissionAccepted {
                to: gegenueber,
                match_id,
                call_id,
            });
            self.protokollieren(NachrichtenTyp::CallAccepted);
            self.berechtigungen.gewaehren(gegenueber);
            self.persistenz.berechtigung_setzen(match_id, true);
            self.abbauen(AbschlussGrund::BerechtigungErteilt);
        } else {
            self.senden(ClientSignal::VoicePermissionRejected {
                to: gegenueber,
                match_id,
                call_id,
                grund: AblehnGrund::Abgelehnt,
            });
            self.protokollieren(NachrichtenTyp::CallDeclined);
            self.berechtigungen.entziehen(&gegenueber);
            self.persistenz.berechtigung_setzen(match_id, false);
            self.abbauen(AbschlussGrund::Abgelehnt);
        }
        Ok(())
    }

    async fn annehmen(&mut self) -> CallResult<()> {
        let session = self.erwarte(CallStatus::Incoming, "annehmen")?;
        let (gegenueber, call_id, versuch) = (session.gegenueber, session.call_id, session.versuch);

        let media = match self.media.mikrofon_anfordern().await {
            Ok(media) => media,
            Err(e) => {
                self.hinweis(e.to_string());
                self.senden(ClientSignal::RejectCall {
                    to: gegenueber,
                    call_id,
                    grund: AblehnGrund::Abgelehnt,
                });
                self.metrik(ERGEBNIS_FEHLGESCHLAGEN);
                self.abbauen(AbschlussGrund::Medienfehler);
                return Err(e);
            }
        };
        self.media_uebernehmen(media.clone());

        let konfig = PeerKonfiguration {
            rolle: PeerRolle::Responder,
            stun_server: self.konfig.stun_server.clone(),
        };
        let sender = PeerEreignisSender::neu(versuch, self.peer_tx.clone());
        let mut peer = match self.peers.erstellen(konfig, media, sender).await {
            Ok(peer) => peer,
            Err(e) => {
                self.hinweis(e.to_string());
                self.senden(ClientSignal::RejectCall {
                    to: gegenueber,
                    call_id,
                    grund: AblehnGrund::Abgelehnt,
                });
                self.metrik(ERGEBNIS_FEHLGESCHLAGEN);
                self.abbauen(AbschlussGrund::Verbindungsfehler);
                return Err(e);
            }
        };

        let Some(anruf) = self.anruf.as_mut() else {
            peer.schliessen();
            return Err(CallError::KeinAktiverAnruf);
        };
        let ergebnis = match anruf.remote_offer.take() {
            Some(offer) => peer.remote_beschreibung_setzen(offer),
            None => Err(CallError::peer("kein Offer vorhanden")),
        };
        for kandidat in anruf.ausstehende_kandidaten.drain(..) {
            if let Err(e) = peer.ice_kandidat_hinzufuegen(kandidat) {
                tracing::debug!(call_id = %call_id, fehler = %e, "Gepufferter Kandidat verworfen");
            }
        }
        anruf.peer = Some(peer);

        if let Err(e) = ergebnis {
            self.hinweis(e.to_string());
            self.senden(ClientSignal::RejectCall {
                to: gegenueber,
                call_id,
                grund: AblehnGrund::Abgelehnt,
            });
            self.metrik(ERGEBNIS_FEHLGESCHLAGEN);
            self.abbauen(AbschlussGrund::Verbindungsfehler);
            return Err(e);
        }
        tracing::info!(call_id = %call_id, "Anruf angenommen");
        Ok(())
    }

    fn ablehnen(&mut self) -> CallResult<()> {
        match self.aktueller_status() {
            None => Err(CallError::KeinAktiverAnruf),
            Some(CallStatus::IncomingRequest) => self.berechtigung_beantworten(false),
            Some(CallStatus::Incoming) => {
                let (gegenueber, call_id) = self.gegenueber_und_call_id()?;
                self.senden(ClientSignal::RejectCall {
                    to: gegenueber,
                    call_id,
                    grund: AblehnGrund::Abgelehnt,
                });
                self.protokollieren(NachrichtenTyp::CallDeclined);
                self.metrik(ERGEBNIS_ABGELEHNT);
                self.abbauen(AbschlussGrund::Abgelehnt);
                Ok(())
            }
            Some(zustand) => Err(CallError::UngueltigerZustand {
                aktion: "ablehnen",
                zustand,
            }),
        }
    }

    fn auflegen(&mut self) -> CallResult<()> {
        match self.aktueller_status() {
            None => Err(CallError::KeinAktiverAnruf),
            Some(CallStatus::Connected) => {
                let (gegenueber, call_id) = self.gegenueber_und_call_id()?;
                self.senden(ClientSignal::EndCall {
                    to: gegenueber,
                    call_id,
                });
                self.gespraech_protokollieren();
                self.abbauen(AbschlussGrund::Aufgelegt);
                Ok(())
            }
            Some(CallStatus::Requesting | CallStatus::Outgoing) => {
                let (gegenueber, call_id) = self.gegenueber_und_call_id()?;
                self.senden(ClientSignal::EndCall {
                    to: gegenueber,
                    call_id,
                });
                self.abbauen(AbschlussGrund::Abgebrochen);
                Ok(())
            }
            Some(CallStatus::Incoming | CallStatus::IncomingRequest) => self.ablehnen(),
            Some(zustand) => Err(CallError::UngueltigerZustand {
                aktion: "auflegen",
                zustand,
            }),
        }
    }

    fn stumm_schalten(&mut self, stumm: bool) -> CallResult<()> {
        let anruf = self.anruf.as_mut().ok_or(CallError::KeinAktiverAnruf)?;
        anruf.session.stumm = stumm;
        if let Some(media) = &anruf.media {
            media.stumm_setzen(stumm);
        }
        tracing::debug!(call_id = %anruf.session.call_id, stumm, "Mikrofon stumm geschaltet");
        self.zustand_veroeffentlichen();
        Ok(())
    }

    fn minimieren(&mut self, minimiert: bool) -> CallResult<()> {
        let anruf = self.anruf.as_mut().ok_or(CallError::KeinAktiverAnruf)?;
        anruf.session.minimiert = minimiert;
        self.zustand_veroeffentlichen();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Relay-Events
    // -----------------------------------------------------------------------

    async fn signal_verarbeiten(&mut self, signal: RelaySignal) {
        tracing::trace!(event = signal.name(), "Relay-Event");
        match signal {
            RelaySignal::VoicePermissionRequested {
                from,
                match_id,
                call_id,
            } => self.berechtigung_angefragt(from, match_id, call_id),

            RelaySignal::VoicePermissionGranted { from, call_id, .. } => {
                if self.status_fuer(from, call_id) == Some(CallStatus::Requesting) {
                    tracing::info!(call_id = %call_id, "Berechtigung erteilt");
                    self.berechtigungen.gewaehren(from);
                    self.status_setzen(CallStatus::Outgoing);
                    // Fehler wurden bereits gemeldet und abgebaut
                    let _ = self.ausgehend_starten().await;
                }
            }

            RelaySignal::VoicePermissionDenied {
                from,
                call_id,
                grund,
                ..
            } => {
                if self.status_fuer(from, call_id) == Some(CallStatus::Requesting) {
                    self.berechtigungen.entziehen(&from);
                    self.metrik(ERGEBNIS_ABGELEHNT);
                    let grund = match grund {
                        AblehnGrund::Besetzt => {
                            self.hinweis("Gegenueber ist gerade in einem anderen Anruf");
                            AbschlussGrund::Besetzt
                        }
                        AblehnGrund::Abgelehnt => {
                            self.hinweis("Sprachanrufe wurden nicht erlaubt");
                            AbschlussGrund::BerechtigungVerweigert
                        }
                    };
                    self.abbauen(grund);
                }
            }

            RelaySignal::CallMade {
                from,
                match_id,
                call_id,
                offer,
            } => self.anruf_eingegangen(from, match_id, call_id, offer),

            RelaySignal::CallAnswered {
                from,
                call_id,
                answer,
            } => {
                if self.status_fuer(from, call_id) == Some(CallStatus::Outgoing) {
                    self.antwort_anwenden(from, call_id, answer);
                }
            }

            RelaySignal::IceCandidate {
                from,
                call_id,
                candidate,
            } => {
                if self.status_fuer(from, call_id).is_some() {
                    self.kandidat_anwenden(call_id, candidate);
                }
            }

            RelaySignal::CallRejected {
                from,
                call_id,
                grund,
            } => {
                if matches!(
                    self.status_fuer(from, call_id),
                    Some(CallStatus::Outgoing | CallStatus::Requesting)
                ) {
                    self.metrik(ERGEBNIS_ABGELEHNT);
                    let grund = match grund {
                        AblehnGrund::Besetzt => {
                            self.hinweis("Gegenueber ist gerade in einem anderen Anruf");
                            AbschlussGrund::Besetzt
                        }
                        AblehnGrund::Abgelehnt => AbschlussGrund::Abgelehnt,
                    };
                    self.abbauen(grund);
                }
            }

            RelaySignal::CallEnded { from, call_id } => {
                if self.status_fuer(from, call_id).is_some() {
                    tracing::info!(call_id = %call_id, "Gegenueber hat aufgelegt");
                    self.gespraech_protokollieren();
                    self.abbauen(AbschlussGrund::GegenueberAufgelegt);
                }
            }

            RelaySignal::ReceiveMessage { message, .. } => {
                self.persistenz.lokal.einfuegen(message.clone());
                self.ereignis(CallEreignis::NachrichtEmpfangen(message));
            }

            RelaySignal::UpdateMessage { message, .. } => {
                self.persistenz.lokal.aktualisieren(message.clone());
                self.ereignis(CallEreignis::NachrichtAktualisiert(message));
            }

            RelaySignal::ReceiveNotification { from, notification } => {
                self.ereignis(CallEreignis::Benachrichtigung {
                    von: from,
                    benachrichtigung: notification,
                });
            }

            RelaySignal::GetUsers { users } => {
                self.ereignis(CallEreignis::OnlineListe(users));
            }
        }
    }

    fn berechtigung_angefragt(&mut self, von: UserId, match_id: MatchId, call_id: CallId) {
        if let Some(anruf) = &self.anruf {
            if anruf.session.call_id == call_id {
                tracing::debug!(call_id = %call_id, "Doppelte Anfrage ignoriert");
                return;
            }
            tracing::info!(call_id = %call_id, von = %von, "Besetzt – Anfrage abgewiesen");
            self.senden(ClientSignal::VoicePermissionRejected {
                to: von,
                match_id,
                call_id,
                grund: AblehnGrund::Besetzt,
            });
            return;
        }

        let versuch = self.naechster_versuch();
        self.anruf = Some(AktiverAnruf::neu(CallSession::neu(
            call_id,
            versuch,
            von,
            match_id,
            CallRolle::Angerufener,
            CallStatus::Idle,
        )));
        self.status_setzen(CallStatus::IncomingRequest);
        self.ereignis(CallEreignis::BerechtigungAngefragt {
            von,
            match_id,
            call_id,
        });
    }

    fn anruf_eingegangen(
        &mut self,
        von: UserId,
        match_id: MatchId,
        call_id: CallId,
        offer: SitzungsBeschreibung,
    ) {
        if let Some(anruf) = &self.anruf {
            if anruf.session.call_id == call_id {
                tracing::debug!(call_id = %call_id, "Doppeltes Offer ignoriert");
                return;
            }
            tracing::info!(call_id = %call_id, von = %von, "Besetzt – Anruf abgewiesen");
            self.senden(ClientSignal::RejectCall {
                to: von,
                call_id,
                grund: AblehnGrund::Besetzt,
            });
            return;
        }
        if offer.typ != SdpTyp::Offer {
            tracing::warn!(call_id = %call_id, "call-made ohne Offer ignoriert");
            return;
        }

        let versuch = self.naechster_versuch();
        let mut anruf = AktiverAnruf::neu(CallSession::neu(
            call_id,
            versuch,
            von,
            match_id,
            CallRolle::Angerufener,
            CallStatus::Idle,
        ));
        anruf.remote_offer = Some(offer);
        self.anruf = Some(anruf);
        self.status_setzen(CallStatus::Incoming);
        self.ereignis(CallEreignis::EingehenderAnruf {
            von,
            match_id,
            call_id,
        });
    }

    fn antwort_anwenden(&mut self, von: UserId, call_id: CallId, answer: SitzungsBeschreibung) {
        let ergebnis = match self.anruf.as_mut().and_then(|a| a.peer.as_mut()) {
            Some(peer) => peer.remote_beschreibung_setzen(answer),
            None => Err(CallError::peer("keine Peer-Verbindung")),
        };
        match ergebnis {
            Ok(()) => {
                self.status_setzen(CallStatus::Connected);
                self.metrik(ERGEBNIS_VERBUNDEN);
            }
            Err(e) => {
                self.hinweis(e.to_string());
                self.senden(ClientSignal::EndCall { to: von, call_id });
                self.metrik(ERGEBNIS_FEHLGESCHLAGEN);
                self.abbauen(AbschlussGrund::Verbindungsfehler);
            }
        }
    }

    fn kandidat_anwenden(&mut self, call_id: CallId, kandidat: IceKandidat) {
        let Some(anruf) = self.anruf.as_mut() else {
            return;
        };
        match anruf.peer.as_mut() {
            Some(peer) => {
                if let Err(e) = peer.ice_kandidat_hinzufuegen(kandidat) {
                    tracing::debug!(call_id = %call_id, fehler = %e, "ICE-Kandidat verworfen");
                }
            }
            None => anruf.kandidat_puffern(kandidat),
        }
    }

    // -----------------------------------------------------------------------
    // Peer-Ereignisse, Frist, Relay-Status
    // -----------------------------------------------------------------------

    fn peer_ereignis(&mut self, versuch: u64, ereignis: PeerEreignis) {
        let Some(anruf) = self.anruf.as_ref() else {
            tracing::debug!(versuch, "Peer-Ereignis ohne aktiven Anruf ignoriert");
            return;
        };
        if anruf.session.versuch != versuch {
            tracing::debug!(
                versuch,
                aktuell = anruf.session.versuch,
                "Peer-Ereignis eines alten Versuchs ignoriert"
            );
            return;
        }
        let CallSession {
            call_id,
            gegenueber,
            match_id,
            rolle,
            status,
            ..
        } = anruf.session;

        match ereignis {
            PeerEreignis::LokaleBeschreibung(beschreibung) => match (rolle, beschreibung.typ) {
                (CallRolle::Anrufer, SdpTyp::Offer) => self.senden(ClientSignal::CallUser {
                    to: gegenueber,
                    match_id,
                    call_id,
                    offer: beschreibung,
                }),
                (CallRolle::Angerufener, SdpTyp::Answer) => {
                    self.senden(ClientSignal::AnswerCall {
                        to: gegenueber,
                        call_id,
                        answer: beschreibung,
                    })
                }
                (rolle, typ) => {
                    tracing::warn!(call_id = %call_id, ?rolle, ?typ, "Unerwartete lokale Beschreibung");
                }
            },
            PeerEreignis::IceKandidat(kandidat) => self.senden(ClientSignal::IceCandidate {
                to: gegenueber,
                call_id,
                candidate: kandidat,
            }),
            PeerEreignis::RemoteStream { stream_id } => {
                self.ereignis(CallEreignis::RemoteStream { call_id, stream_id });
            }
            PeerEreignis::Verbunden => {
                if status == CallStatus::Incoming {
                    self.status_setzen(CallStatus::Connected);
                    self.metrik(ERGEBNIS_VERBUNDEN);
                }
            }
            PeerEreignis::Geschlossen => {
                tracing::warn!(call_id = %call_id, zustand = %status, "Peer-Verbindung geschlossen");
                self.hinweis("Verbindung zum Gegenueber unterbrochen");
                self.senden(ClientSignal::EndCall {
                    to: gegenueber,
                    call_id,
                });
                if status == CallStatus::Connected {
                    self.gespraech_protokollieren();
                } else {
                    self.metrik(ERGEBNIS_FEHLGESCHLAGEN);
                }
                self.abbauen(AbschlussGrund::Verbindungsfehler);
            }
        }
    }

    fn frist_abgelaufen(&mut self) {
        let Some(anruf) = self.anruf.as_ref() else {
            return;
        };
        if !anruf.session.status.hat_frist() {
            return;
        }
        let (gegenueber, call_id) = (anruf.session.gegenueber, anruf.session.call_id);
        tracing::info!(call_id = %call_id, zustand = %anruf.session.status, "Keine Antwort – verpasster Anruf");

        self.senden(ClientSignal::EndCall {
            to: gegenueber,
            call_id,
        });
        self.protokollieren(NachrichtenTyp::MissedCall);
        self.metrik(ERGEBNIS_VERPASST);
        self.abbauen(AbschlussGrund::Verpasst);
    }

    fn relay_status(&mut self, status: RelayStatus) {
        let verbunden = status == RelayStatus::Verbunden;
        if verbunden == self.relay_verbunden {
            return;
        }
        self.relay_verbunden = verbunden;
        if verbunden {
            tracing::info!("Relay verbunden");
            return;
        }

        tracing::warn!(status = ?status, "Relay-Verbindung verloren");
        if self.anruf.is_some() {
            self.status_setzen(CallStatus::Failed);
            self.hinweis("Verbindung zum Server verloren – Anruf beendet");
            self.metrik(ERGEBNIS_FEHLGESCHLAGEN);
            self.abbauen(AbschlussGrund::RelayGetrennt);
        }
    }

    /// Raeumt einen laufenden Anruf beim Beenden der Sitzung auf
    fn sitzung_beenden(&mut self) {
        match self.aktueller_status() {
            None => {}
            Some(CallStatus::Connected) => {
                let _ = self.auflegen();
            }
            Some(_) => {
                if let Ok((gegenueber, call_id)) = self.gegenueber_und_call_id() {
                    self.senden(ClientSignal::EndCall {
                        to: gegenueber,
                        call_id,
                    });
                }
                self.abbauen(AbschlussGrund::Abgebrochen);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Auf- und Abbau
    // -----------------------------------------------------------------------

    /// Mikrofon und Peer fuer den Anrufer aufbauen (Zustand `outgoing`)
    async fn ausgehend_starten(&mut self) -> CallResult<()> {
        let Some(anruf) = self.anruf.as_ref() else {
            return Err(CallError::KeinAktiverAnruf);
        };
        let (gegenueber, call_id, versuch) = (
            anruf.session.gegenueber,
            anruf.session.call_id,
            anruf.session.versuch,
        );

        let media = match self.media.mikrofon_anfordern().await {
            Ok(media) => media,
            Err(e) => {
                self.hinweis(e.to_string());
                self.metrik(ERGEBNIS_FEHLGESCHLAGEN);
                self.abbauen(AbschlussGrund::Medienfehler);
                return Err(e);
            }
        };
        self.media_uebernehmen(media.clone());

        let konfig = PeerKonfiguration {
            rolle: PeerRolle::Initiator,
            stun_server: self.konfig.stun_server.clone(),
        };
        let sender = PeerEreignisSender::neu(versuch, self.peer_tx.clone());
        match self.peers.erstellen(konfig, media, sender).await {
            Ok(peer) => {
                if let Some(anruf) = self.anruf.as_mut() {
                    anruf.peer = Some(peer);
                }
                tracing::debug!(call_id = %call_id, gegenueber = %gegenueber, "Offer wird erzeugt");
                Ok(())
            }
            Err(e) => {
                self.hinweis(e.to_string());
                self.metrik(ERGEBNIS_FEHLGESCHLAGEN);
                self.abbauen(AbschlussGrund::Verbindungsfehler);
                Err(e)
            }
        }
    }

    fn media_uebernehmen(&mut self, media: MediaStream) {
        match self.anruf.as_mut() {
            Some(anruf) => {
                media.stumm_setzen(anruf.session.stumm);
                anruf.media = Some(media);
            }
            None => {
                media.stoppen();
            }
        }
    }

    /// Wechsel nach `idle`: Mikrofon stoppen, Peer schliessen, Frist loeschen
    ///
    /// Der Versuch wird dabei entnommen, ein zweiter Aufruf ist wirkungslos.
    fn abbauen(&mut self, grund: AbschlussGrund) {
        let Some(mut anruf) = self.anruf.take() else {
            return;
        };
        if let Some(media) = anruf.media.take() {
            media.stoppen();
        }
        if let Some(mut peer) = anruf.peer.take() {
            peer.schliessen();
        }
        let call_id = anruf.session.call_id;
        let von = anruf.session.status;
        tracing::info!(call_id = %call_id, zustand = %von, grund = ?grund, "Anruf beendet");

        self.zustand_veroeffentlichen();
        self.ereignis(CallEreignis::StatusGeaendert {
            call_id,
            von,
            nach: CallStatus::Idle,
        });
        self.ereignis(CallEreignis::Beendet { call_id, grund });
    }

    fn status_setzen(&mut self, neu: CallStatus) {
        let timeout = self.konfig.anruf_timeout;
        let Some(anruf) = self.anruf.as_mut() else {
            return;
        };
        let alt = anruf.session.status;
        if alt == neu {
            return;
        }
        anruf.session.status = neu;
        if neu == CallStatus::Connected {
            anruf.session.verbunden_seit = Some(Instant::now());
        }
        anruf.frist = neu.hat_frist().then(|| Instant::now() + timeout);

        let call_id = anruf.session.call_id;
        tracing::info!(call_id = %call_id, von = %alt, nach = %neu, "Statuswechsel");
        self.zustand_veroeffentlichen();
        self.ereignis(CallEreignis::StatusGeaendert {
            call_id,
            von: alt,
            nach: neu,
        });
    }

    // -----------------------------------------------------------------------
    // Hilfsfunktionen
    // -----------------------------------------------------------------------

    fn naechster_versuch(&mut self) -> u64 {
        self.letzter_versuch += 1;
        self.letzter_versuch
    }

    async fn berechtigung_pruefen(&mut self, gegenueber: UserId, match_id: MatchId) -> bool {
        if self.berechtigungen.ist_erlaubt(&gegenueber) {
            return true;
        }
        // Ein langsames Backend darf den Controller nicht blockieren;
        // im Zweifel wird angefragt
        let abfrage = self.persistenz.berechtigung_abfragen(match_id);
        match tokio::time::timeout(self.konfig.berechtigung_abfrage_timeout, abfrage).await {
            Ok(Ok(true)) => {
                self.berechtigungen.gewaehren(gegenueber);
                true
            }
            Ok(Ok(false)) => false,
            Ok(Err(e)) => {
                tracing::warn!(match_id = %match_id, fehler = %e, "Match-Berechtigung nicht lesbar");
                false
            }
            Err(_) => {
                tracing::warn!(
                    match_id = %match_id,
                    timeout_ms = self.konfig.berechtigung_abfrage_timeout.as_millis() as u64,
                    "Match-Berechtigung nicht rechtzeitig gelesen"
                );
                false
            }
        }
    }

    fn aktueller_status(&self) -> Option<CallStatus> {
        self.anruf.as_ref().map(|a| a.session.status)
    }

    fn gegenueber_und_call_id(&self) -> CallResult<(UserId, CallId)> {
        self.anruf
            .as_ref()
            .map(|a| (a.session.gegenueber, a.session.call_id))
            .ok_or(CallError::KeinAktiverAnruf)
    }

    /// Session des aktiven Versuchs, falls er im erwarteten Zustand ist
    fn erwarte(&self, status: CallStatus, aktion: &'static str) -> CallResult<CallSession> {
        let anruf = self.anruf.as_ref().ok_or(CallError::KeinAktiverAnruf)?;
        if anruf.session.status != status {
            return Err(CallError::UngueltigerZustand {
                aktion,
                zustand: anruf.session.status,
            });
        }
        Ok(anruf.session.clone())
    }

    /// Status des aktiven Versuchs, wenn das Signal zu ihm gehoert
    fn status_fuer(&self, von: UserId, call_id: CallId) -> Option<CallStatus> {
        match &self.anruf {
            Some(anruf) if anruf.session.call_id == call_id && anruf.session.gegenueber == von => {
                Some(anruf.session.status)
            }
            _ => {
                tracing::debug!(call_id = %call_id, von = %von, "Signal gehoert zu keinem aktiven Versuch");
                None
            }
        }
    }

    /// Anruf-Nachricht speichern und dem Gegenueber zustellen
    fn protokollieren(&mut self, typ: NachrichtenTyp) {
        let Some(anruf) = self.anruf.as_ref() else {
            return;
        };
        let nachricht = ChatNachricht::anruf(
            anruf.session.match_id,
            self.eigene_id,
            anruf.session.gegenueber,
            typ,
        );
        self.nachricht_verteilen(nachricht);
    }

    /// Gespraechsdauer eines verbundenen Anrufs als `call_log`
    ///
    /// Schreibt nur der Anrufer, egal welche Seite auflegt. So bleibt es
    /// auch bei gleichzeitigem Auflegen bei einem Eintrag.
    fn gespraech_protokollieren(&mut self) {
        let Some(anruf) = self.anruf.as_ref() else {
            return;
        };
        let session = &anruf.session;
        if session.status != CallStatus::Connected || session.rolle != CallRolle::Anrufer {
            return;
        }
        let nachricht = ChatNachricht::anruf_protokoll(
            session.match_id,
            self.eigene_id,
            session.gegenueber,
            session.dauer(),
        );
        self.nachricht_verteilen(nachricht);
    }

    fn nachricht_verteilen(&mut self, nachricht: ChatNachricht) {
        tracing::debug!(
            typ = ?nachricht.message_type,
            match_id = %nachricht.match_id,
            inhalt = %nachricht.content,
            "Anruf-Nachricht"
        );
        let empfaenger = nachricht.empfaenger_id;
        self.persistenz.nachricht_erstellen(nachricht.clone());
        self.senden(ClientSignal::SendMessage {
            to: empfaenger,
            message: nachricht,
        });
    }

    fn senden(&self, signal: ClientSignal) {
        if !self.kanal.senden(signal) {
            tracing::debug!("Signal nicht zugestellt (Relay getrennt)");
        }
    }

    fn zustand_veroeffentlichen(&self) {
        let zustand = match &self.anruf {
            Some(anruf) => CallZustand {
                status: anruf.session.status,
                session: Some(anruf.session.clone()),
            },
            None => CallZustand::default(),
        };
        self.zustand_tx.send_replace(zustand);
    }

    fn ereignis(&self, ereignis: CallEreignis) {
        // Ohne Abonnenten geht das Ereignis verloren
        let _ = self.ereignis_tx.send(ereignis);
    }

    fn hinweis(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::warn!(hinweis = %text, "Hinweis an die Oberflaeche");
        self.ereignis(CallEreignis::Hinweis { text });
    }

    fn metrik(&self, ergebnis: &str) {
        if let Some(metriken) = &self.metriken {
            metriken.zaehlen(ergebnis);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{LokalerCache, MatchEintrag, MatchSpeicher};
    use crate::simulation::{SimuliertePeerFabrik, SimuliertesMikrofon};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Relay-Ersatz: merkt sich gesendete Events, Events und Status werden
    /// vom Test eingespeist
    struct TestKanal {
        id: UserId,
        gesendet: Mutex<Vec<ClientSignal>>,
        relay_tx: broadcast::Sender<RelaySignal>,
        status_tx: watch::Sender<RelayStatus>,
    }

    impl SignalKanal for TestKanal {
        fn eigene_id(&self) -> UserId {
            self.id
        }

        fn senden(&self, signal: ClientSignal) -> bool {
            if *self.status_tx.borrow() != RelayStatus::Verbunden {
                return false;
            }
            self.gesendet.lock().push(signal);
            true
        }

        fn abonnieren(&self) -> broadcast::Receiver<RelaySignal> {
            self.relay_tx.subscribe()
        }

        fn status_abonnieren(&self) -> watch::Receiver<RelayStatus> {
            self.status_tx.subscribe()
        }
    }

    struct Umgebung {
        kanal: Arc<TestKanal>,
        mikrofon: Arc<SimuliertesMikrofon>,
        peers: Arc<SimuliertePeerFabrik>,
        backend: LokalerCache,
        lokal: LokalerCache,
        metriken: AnrufMetriken,
        handle: CallHandle,
        ereignisse: broadcast::Receiver<CallEreignis>,
        gegenueber: UserId,
        match_id: MatchId,
    }

    /// Backend das die Match-Abfrage nie beantwortet
    struct HaengendesBackend;

    #[async_trait]
    impl MatchSpeicher for HaengendesBackend {
        async fn match_abrufen(&self, _match_id: MatchId) -> CallResult<MatchEintrag> {
            std::future::pending().await
        }

        async fn berechtigung_setzen(&self, _match_id: MatchId, _erlaubt: bool) -> CallResult<()> {
            Ok(())
        }
    }

    impl Umgebung {
        fn starten() -> Self {
            Self::starten_mit(None)
        }

        fn starten_mit(matches: Option<Arc<dyn MatchSpeicher>>) -> Self {
            let (relay_tx, _) = broadcast::channel(64);
            let (status_tx, _) = watch::channel(RelayStatus::Verbunden);
            let kanal = Arc::new(TestKanal {
                id: UserId::new(),
                gesendet: Mutex::new(Vec::new()),
                relay_tx,
                status_tx,
            });
            let mikrofon = Arc::new(SimuliertesMikrofon::neu());
            let peers = Arc::new(SimuliertePeerFabrik::neu());
            let backend = LokalerCache::neu();
            let persistenz = match matches {
                Some(matches) => {
                    Persistenz::neu(LokalerCache::neu(), Arc::new(backend.clone()), matches)
                }
                None => Persistenz::im_speicher(backend.clone()),
            };
            let lokal = persistenz.lokal.clone();
            let metriken = AnrufMetriken::neu().unwrap();

            let handle = CallController::neu(
                kanal.clone(),
                mikrofon.clone(),
                peers.clone(),
                persistenz,
            )
            .mit_metriken(metriken.clone())
            .starten();
            let ereignisse = handle.ereignisse_abonnieren();

            Self {
                kanal,
                mikrofon,
                peers,
                backend,
                lokal,
                metriken,
                handle,
                ereignisse,
                gegenueber: UserId::new(),
                match_id: MatchId::new(),
            }
        }

        async fn berechtigung_im_backend(&self) {
            self.backend
                .berechtigung_setzen(self.match_id, true)
                .await
                .unwrap();
        }

        fn einspeisen(&self, signal: RelaySignal) {
            self.kanal.relay_tx.send(signal).unwrap();
        }

        fn gesendet(&self) -> Vec<ClientSignal> {
            self.kanal.gesendet.lock().clone()
        }

        fn gesendet_namen(&self) -> Vec<&'static str> {
            self.gesendet().iter().map(|s| s.name()).collect()
        }

        fn status(&self) -> CallStatus {
            self.handle.zustand().status
        }

        fn ereignisse_leeren(&mut self) -> Vec<CallEreignis> {
            std::iter::from_fn(|| self.ereignisse.try_recv().ok()).collect()
        }

        /// Verbundener ausgehender Anruf (Berechtigung liegt vor)
        async fn verbunden_als_anrufer(&self) -> CallId {
            self.berechtigung_im_backend().await;
            let call_id = self
                .handle
                .anrufen(self.gegenueber, self.match_id)
                .await
                .unwrap();
            abarbeiten().await;
            self.einspeisen(RelaySignal::CallAnswered {
                from: self.gegenueber,
                call_id,
                answer: SitzungsBeschreibung::answer("v=0"),
            });
            self.handle
                .status_abwarten(CallStatus::Connected, Duration::from_secs(1))
                .await
                .unwrap();
            call_id
        }
    }

    /// Laesst Controller und Hintergrund-Tasks laufen
    async fn abarbeiten() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ohne_berechtigung_wird_zuerst_angefragt() {
        let u = Umgebung::starten();
        let call_id = u.handle.anrufen(u.gegenueber, u.match_id).await.unwrap();
        abarbeiten().await;

        assert_eq!(u.status(), CallStatus::Requesting);
        let gesendet = u.gesendet();
        assert!(matches!(
            &gesendet[0],
            ClientSignal::RequestVoicePermission { to, call_id: c, .. }
                if *to == u.gegenueber && *c == call_id
        ));
        assert!(!u.gesendet_namen().contains(&"call-user"));
        assert_eq!(u.peers.erstellt(), 0);
        assert_eq!(u.mikrofon.ausgegeben().len(), 0);
        assert_eq!(
            u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::CallRequest),
            1
        );
        assert_eq!(u.metriken.anzahl(ERGEBNIS_GESTARTET), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn erteilte_berechtigung_fuehrt_zur_verbindung() {
        let mut u = Umgebung::starten();
        let call_id = u.handle.anrufen(u.gegenueber, u.match_id).await.unwrap();
        abarbeiten().await;

        u.einspeisen(RelaySignal::VoicePermissionGranted {
            from: u.gegenueber,
            match_id: u.match_id,
            call_id,
        });
        u.handle
            .status_abwarten(CallStatus::Outgoing, Duration::from_secs(1))
            .await
            .unwrap();
        abarbeiten().await;
        assert!(u.gesendet().iter().any(|s| matches!(
            s,
            ClientSignal::CallUser { call_id: c, offer, .. }
                if *c == call_id && offer.typ == SdpTyp::Offer
        )));
        assert!(u.gesendet_namen().contains(&"ice-candidate"));

        u.einspeisen(RelaySignal::CallAnswered {
            from: u.gegenueber,
            call_id,
            answer: SitzungsBeschreibung::answer("v=0"),
        });
        let zustand = u
            .handle
            .status_abwarten(CallStatus::Connected, Duration::from_secs(1))
            .await
            .unwrap();
        let session = zustand.session.unwrap();
        assert_eq!(session.call_id, call_id);
        assert_eq!(session.rolle, CallRolle::Anrufer);
        assert_eq!(u.metriken.anzahl(ERGEBNIS_VERBUNDEN), 1);

        abarbeiten().await;
        assert!(u
            .ereignisse_leeren()
            .iter()
            .any(|e| matches!(e, CallEreignis::RemoteStream { call_id: c, .. } if *c == call_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn keine_antwort_ergibt_genau_einen_verpassten_anruf() {
        let mut u = Umgebung::starten();
        u.berechtigung_im_backend().await;
        let call_id = u.handle.anrufen(u.gegenueber, u.match_id).await.unwrap();
        abarbeiten().await;
        assert_eq!(u.status(), CallStatus::Outgoing);
        assert_eq!(u.mikrofon.aktive_anzahl(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        abarbeiten().await;

        assert_eq!(u.status(), CallStatus::Idle);
        assert_eq!(u.mikrofon.aktive_anzahl(), 0);
        assert_eq!(u.peers.geschlossen(), 1);
        assert!(u.gesendet_namen().contains(&"end-call"));
        assert_eq!(
            u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::MissedCall),
            1
        );
        assert!(u.ereignisse_leeren().contains(&CallEreignis::Beendet {
            call_id,
            grund: AbschlussGrund::Verpasst
        }));

        // Verspaetete Antwort auf den abgelaufenen Versuch
        u.einspeisen(RelaySignal::CallAnswered {
            from: u.gegenueber,
            call_id,
            answer: SitzungsBeschreibung::answer("v=0"),
        });
        tokio::time::advance(Duration::from_secs(60)).await;
        abarbeiten().await;

        assert_eq!(u.status(), CallStatus::Idle);
        assert_eq!(u.metriken.anzahl(ERGEBNIS_VERBUNDEN), 0);
        assert_eq!(u.metriken.anzahl(ERGEBNIS_VERPASST), 1);
        assert_eq!(
            u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::MissedCall),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn frist_gilt_auch_fuer_die_anfrage() {
        let u = Umgebung::starten();
        u.handle.anrufen(u.gegenueber, u.match_id).await.unwrap();
        abarbeiten().await;

        tokio::time::advance(Duration::from_secs(29)).await;
        abarbeiten().await;
        assert_eq!(u.status(), CallStatus::Requesting);

        tokio::time::advance(Duration::from_secs(2)).await;
        abarbeiten().await;
        assert_eq!(u.status(), CallStatus::Idle);
        assert_eq!(
            u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::MissedCall),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auflegen_schreibt_gespraechsdauer() {
        let mut u = Umgebung::starten();
        let call_id = u.verbunden_als_anrufer().await;

        tokio::time::advance(Duration::from_secs(65)).await;
        u.handle.auflegen().await.unwrap();
        abarbeiten().await;

        assert_eq!(u.status(), CallStatus::Idle);
        let protokoll: Vec<_> = u
            .lokal
            .verlauf(&u.match_id)
            .into_iter()
            .filter(|n| n.message_type == NachrichtenTyp::CallLog)
            .collect();
        assert_eq!(protokoll.len(), 1);
        assert_eq!(protokoll[0].content, "01:05");

        let gesendet = u.gesendet();
        assert!(gesendet.iter().any(|s| matches!(
            s,
            ClientSignal::EndCall { call_id: c, .. } if *c == call_id
        )));
        assert!(gesendet.iter().any(|s| matches!(
            s,
            ClientSignal::SendMessage { message, .. } if message.content == "01:05"
        )));
        assert_eq!(u.mikrofon.aktive_anzahl(), 0);
        assert!(u.ereignisse_leeren().contains(&CallEreignis::Beendet {
            call_id,
            grund: AbschlussGrund::Aufgelegt
        }));

        // Zweites Auflegen hat keinen Anruf mehr
        assert!(matches!(
            u.handle.auflegen().await,
            Err(CallError::KeinAktiverAnruf)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn anfrage_ablehnen_entzieht_berechtigung() {
        let mut u = Umgebung::starten();
        let call_id = CallId::new();
        u.einspeisen(RelaySignal::VoicePermissionRequested {
            from: u.gegenueber,
            match_id: u.match_id,
            call_id,
        });
        u.handle
            .status_abwarten(CallStatus::IncomingRequest, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(u
            .ereignisse_leeren()
            .contains(&CallEreignis::BerechtigungAngefragt {
                von: u.gegenueber,
                match_id: u.match_id,
                call_id,
            }));

        // Annehmen ist waehrend einer Anfrage nicht moeglich
        assert!(matches!(
            u.handle.annehmen().await,
            Err(CallError::UngueltigerZustand { .. })
        ));

        u.handle.berechtigung_verweigern().await.unwrap();
        abarbeiten().await;

        assert_eq!(u.status(), CallStatus::Idle);
        assert!(u.gesendet().iter().any(|s| matches!(
            s,
            ClientSignal::VoicePermissionRejected { grund: AblehnGrund::Abgelehnt, call_id: c, .. }
                if *c == call_id
        )));
        assert_eq!(
            u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::CallDeclined),
            1
        );
        assert!(!u.backend.berechtigung(&u.match_id));
        assert_eq!(u.mikrofon.ausgegeben().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn anfrage_erlauben_setzt_berechtigung() {
        let u = Umgebung::starten();
        u.einspeisen(RelaySignal::VoicePermissionRequested {
            from: u.gegenueber,
            match_id: u.match_id,
            call_id: CallId::new(),
        });
        u.handle
            .status_abwarten(CallStatus::IncomingRequest, Duration::from_secs(1))
            .await
            .unwrap();

        u.handle.berechtigung_erteilen().await.unwrap();
        abarbeiten().await;

        assert_eq!(u.status(), CallStatus::Idle);
        assert!(u.gesendet_namen().contains(&"voice-permission-accepted"));
        assert!(u.backend.berechtigung(&u.match_id));
        assert_eq!(
            u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::CallAccepted),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn verweigerte_anfrage_beim_anrufer() {
        let mut u = Umgebung::starten();
        let call_id = u.handle.anrufen(u.gegenueber, u.match_id).await.unwrap();
        abarbeiten().await;

        u.einspeisen(RelaySignal::VoicePermissionDenied {
            from: u.gegenueber,
            match_id: u.match_id,
            call_id,
            grund: AblehnGrund::Abgelehnt,
        });
        u.handle
            .status_abwarten(CallStatus::Idle, Duration::from_secs(1))
            .await
            .unwrap();
        abarbeiten().await;

        assert!(!u.gesendet_namen().contains(&"call-user"));
        assert_eq!(u.peers.erstellt(), 0);
        let ereignisse = u.ereignisse_leeren();
        assert!(ereignisse
            .iter()
            .any(|e| matches!(e, CallEreignis::Hinweis { .. })));
        assert!(ereignisse.contains(&CallEreignis::Beendet {
            call_id,
            grund: AbschlussGrund::BerechtigungVerweigert
        }));
        assert_eq!(u.metriken.anzahl(ERGEBNIS_ABGELEHNT), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nur_ein_anruf_gleichzeitig() {
        let u = Umgebung::starten();
        let call_id = u.handle.anrufen(u.gegenueber, u.match_id).await.unwrap();
        assert!(matches!(
            u.handle.anrufen(UserId::new(), MatchId::new()).await,
            Err(CallError::BereitsAktiv)
        ));

        let dritter = UserId::new();
        let fremde_id = CallId::new();
        u.einspeisen(RelaySignal::VoicePermissionRequested {
            from: dritter,
            match_id: MatchId::new(),
            call_id: fremde_id,
        });
        u.einspeisen(RelaySignal::CallMade {
            from: dritter,
            match_id: MatchId::new(),
            call_id: CallId::new(),
            offer: SitzungsBeschreibung::offer("v=0"),
        });
        abarbeiten().await;

        let gesendet = u.gesendet();
        assert!(gesendet.iter().any(|s| matches!(
            s,
            ClientSignal::VoicePermissionRejected { to, grund: AblehnGrund::Besetzt, call_id: c, .. }
                if *to == dritter && *c == fremde_id
        )));
        assert!(gesendet.iter().any(|s| matches!(
            s,
            ClientSignal::RejectCall { to, grund: AblehnGrund::Besetzt, .. } if *to == dritter
        )));
        let zustand = u.handle.zustand();
        assert_eq!(zustand.status, CallStatus::Requesting);
        assert_eq!(zustand.session.unwrap().call_id, call_id);
    }

    #[tokio::test(start_paused = true)]
    async fn eigener_user_ist_kein_empfaenger() {
        let u = Umgebung::starten();
        let ergebnis = u.handle.anrufen(u.kanal.id, u.match_id).await;
        assert!(matches!(ergebnis, Err(CallError::UngueltigerEmpfaenger(_))));
        assert!(u.gesendet().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn eingehender_anruf_mit_gepufferten_kandidaten() {
        let mut u = Umgebung::starten();
        let call_id = CallId::new();
        u.einspeisen(RelaySignal::CallMade {
            from: u.gegenueber,
            match_id: u.match_id,
            call_id,
            offer: SitzungsBeschreibung::offer("v=0"),
        });
        u.einspeisen(RelaySignal::IceCandidate {
            from: u.gegenueber,
            call_id,
            candidate: IceKandidat {
                candidate: "candidate:1 1 udp 1 10.0.0.2 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        });
        u.handle
            .status_abwarten(CallStatus::Incoming, Duration::from_secs(1))
            .await
            .unwrap();
        abarbeiten().await;

        // Klingeln hat keine Frist beim Angerufenen
        tokio::time::advance(Duration::from_secs(45)).await;
        abarbeiten().await;
        assert_eq!(u.status(), CallStatus::Incoming);
        assert!(u.ereignisse_leeren().contains(&CallEreignis::EingehenderAnruf {
            von: u.gegenueber,
            match_id: u.match_id,
            call_id,
        }));

        u.handle.annehmen().await.unwrap();
        let zustand = u
            .handle
            .status_abwarten(CallStatus::Connected, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(zustand.session.unwrap().rolle, CallRolle::Angerufener);
        assert!(u.gesendet().iter().any(|s| matches!(
            s,
            ClientSignal::AnswerCall { call_id: c, answer, .. }
                if *c == call_id && answer.typ == SdpTyp::Answer
        )));
        assert_eq!(u.peers.erstellt(), 1);
        assert_eq!(u.mikrofon.aktive_anzahl(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eingehenden_anruf_ablehnen() {
        let u = Umgebung::starten();
        let call_id = CallId::new();
        u.einspeisen(RelaySignal::CallMade {
            from: u.gegenueber,
            match_id: u.match_id,
            call_id,
            offer: SitzungsBeschreibung::offer("v=0"),
        });
        u.handle
            .status_abwarten(CallStatus::Incoming, Duration::from_secs(1))
            .await
            .unwrap();

        u.handle.ablehnen().await.unwrap();
        abarbeiten().await;

        assert_eq!(u.status(), CallStatus::Idle);
        assert!(u.gesendet().iter().any(|s| matches!(
            s,
            ClientSignal::RejectCall { call_id: c, grund: AblehnGrund::Abgelehnt, .. } if *c == call_id
        )));
        assert_eq!(
            u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::CallDeclined),
            1
        );
        assert_eq!(u.peers.erstellt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mikrofon_verweigert() {
        let mut u = Umgebung::starten();
        u.mikrofon.verweigern_setzen(true);
        u.berechtigung_im_backend().await;

        let ergebnis = u.handle.anrufen(u.gegenueber, u.match_id).await;
        assert!(matches!(ergebnis, Err(CallError::Medien(_))));
        abarbeiten().await;

        assert_eq!(u.status(), CallStatus::Idle);
        assert_eq!(u.peers.erstellt(), 0);
        assert!(!u.gesendet_namen().contains(&"call-user"));
        let ereignisse = u.ereignisse_leeren();
        assert!(ereignisse
            .iter()
            .any(|e| matches!(e, CallEreignis::Hinweis { text } if text.contains("Mikrofon"))));
        assert!(ereignisse.iter().any(|e| matches!(
            e,
            CallEreignis::Beendet { grund: AbschlussGrund::Medienfehler, .. }
        )));

        // Danach ist ein neuer Versuch moeglich
        u.mikrofon.verweigern_setzen(false);
        u.handle.anrufen(u.gegenueber, u.match_id).await.unwrap();
        assert_eq!(u.status(), CallStatus::Outgoing);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_verlust_beendet_anruf() {
        let mut u = Umgebung::starten();
        let call_id = u.verbunden_als_anrufer().await;
        u.ereignisse_leeren();

        u.kanal.status_tx.send_replace(RelayStatus::Getrennt);
        u.handle
            .status_abwarten(CallStatus::Idle, Duration::from_secs(1))
            .await
            .unwrap();
        abarbeiten().await;

        let ereignisse = u.ereignisse_leeren();
        assert!(ereignisse.contains(&CallEreignis::StatusGeaendert {
            call_id,
            von: CallStatus::Connected,
            nach: CallStatus::Failed,
        }));
        assert!(ereignisse.contains(&CallEreignis::Beendet {
            call_id,
            grund: AbschlussGrund::RelayGetrennt
        }));
        assert_eq!(u.mikrofon.aktive_anzahl(), 0);
        assert_eq!(u.metriken.anzahl(ERGEBNIS_FEHLGESCHLAGEN), 1);

        assert!(matches!(
            u.handle.anrufen(u.gegenueber, u.match_id).await,
            Err(CallError::RelayGetrennt)
        ));

        u.kanal.status_tx.send_replace(RelayStatus::Verbunden);
        abarbeiten().await;
        u.handle.anrufen(u.gegenueber, u.match_id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gegenueber_legt_auf() {
        let mut u = Umgebung::starten();
        let call_id = u.verbunden_als_anrufer().await;

        // Fremde call_id wird ignoriert
        u.einspeisen(RelaySignal::CallEnded {
            from: u.gegenueber,
            call_id: CallId::new(),
        });
        abarbeiten().await;
        assert_eq!(u.status(), CallStatus::Connected);

        u.einspeisen(RelaySignal::CallEnded {
            from: u.gegenueber,
            call_id,
        });
        u.handle
            .status_abwarten(CallStatus::Idle, Duration::from_secs(1))
            .await
            .unwrap();
        abarbeiten().await;

        assert!(u.ereignisse_leeren().contains(&CallEreignis::Beendet {
            call_id,
            grund: AbschlussGrund::GegenueberAufgelegt
        }));
        // Der Anrufer protokolliert auch wenn das Gegenueber auflegt
        assert_eq!(u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::CallLog), 1);
        assert!(!u.gesendet_namen().contains(&"end-call"));
        assert_eq!(u.mikrofon.aktive_anzahl(), 0);
        assert_eq!(u.peers.geschlossen(), 1);
    }

    /// Verbundener eingehender Anruf
    async fn verbunden_als_angerufener(u: &Umgebung) -> CallId {
        let call_id = CallId::new();
        u.einspeisen(RelaySignal::CallMade {
            from: u.gegenueber,
            match_id: u.match_id,
            call_id,
            offer: SitzungsBeschreibung::offer("v=0"),
        });
        u.handle
            .status_abwarten(CallStatus::Incoming, Duration::from_secs(1))
            .await
            .unwrap();
        u.handle.annehmen().await.unwrap();
        u.handle
            .status_abwarten(CallStatus::Connected, Duration::from_secs(1))
            .await
            .unwrap();
        call_id
    }

    #[tokio::test(start_paused = true)]
    async fn angerufener_legt_auf_ohne_protokoll() {
        let u = Umgebung::starten();
        let call_id = verbunden_als_angerufener(&u).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        u.handle.auflegen().await.unwrap();
        abarbeiten().await;

        assert_eq!(u.status(), CallStatus::Idle);
        assert!(u.gesendet().iter().any(|s| matches!(
            s,
            ClientSignal::EndCall { call_id: c, .. } if *c == call_id
        )));
        assert_eq!(u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::CallLog), 0);
        assert!(!u.gesendet_namen().contains(&"send-message"));

        // Das end-call des Anrufers trifft auf einen abgebauten Versuch
        u.einspeisen(RelaySignal::CallEnded {
            from: u.gegenueber,
            call_id,
        });
        abarbeiten().await;
        assert_eq!(u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::CallLog), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn verbindungsabbruch_wird_protokolliert() {
        let mut u = Umgebung::starten();
        let call_id = u.verbunden_als_anrufer().await;
        u.ereignisse_leeren();

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(u.peers.verbindung_abbrechen());
        u.handle
            .status_abwarten(CallStatus::Idle, Duration::from_secs(1))
            .await
            .unwrap();
        abarbeiten().await;

        let protokoll: Vec<_> = u
            .lokal
            .verlauf(&u.match_id)
            .into_iter()
            .filter(|n| n.message_type == NachrichtenTyp::CallLog)
            .collect();
        assert_eq!(protokoll.len(), 1);
        assert_eq!(protokoll[0].content, "00:07");
        assert_eq!(u.mikrofon.aktive_anzahl(), 0);
        assert_eq!(u.metriken.anzahl(ERGEBNIS_FEHLGESCHLAGEN), 0);
        assert!(u
            .ereignisse_leeren()
            .iter()
            .any(|e| matches!(e, CallEreignis::Beendet { call_id: c, .. } if *c == call_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn verbindungsabbruch_beim_angerufenen_ohne_protokoll() {
        let u = Umgebung::starten();
        verbunden_als_angerufener(&u).await;

        assert!(u.peers.verbindung_abbrechen());
        u.handle
            .status_abwarten(CallStatus::Idle, Duration::from_secs(1))
            .await
            .unwrap();
        abarbeiten().await;
        assert_eq!(u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::CallLog), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn berechtigung_gilt_fuer_folgeanrufe() {
        let u = Umgebung::starten();
        let call_id = u.handle.anrufen(u.gegenueber, u.match_id).await.unwrap();
        abarbeiten().await;
        u.einspeisen(RelaySignal::VoicePermissionGranted {
            from: u.gegenueber,
            match_id: u.match_id,
            call_id,
        });
        u.handle
            .status_abwarten(CallStatus::Outgoing, Duration::from_secs(1))
            .await
            .unwrap();
        u.handle.auflegen().await.unwrap();
        abarbeiten().await;
        assert_eq!(u.status(), CallStatus::Idle);

        // Das Backend-Flag setzt nur die angefragte Seite
        assert!(!u.backend.berechtigung(&u.match_id));

        let zweiter = u.handle.anrufen(u.gegenueber, u.match_id).await.unwrap();
        assert_ne!(zweiter, call_id);
        assert_eq!(u.status(), CallStatus::Outgoing);
        abarbeiten().await;

        let anfragen = u
            .gesendet_namen()
            .into_iter()
            .filter(|n| *n == "request-voice-permission")
            .count();
        assert_eq!(anfragen, 1);
        assert!(u.gesendet().iter().any(|s| matches!(
            s,
            ClientSignal::CallUser { call_id: c, .. } if *c == zweiter
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn langsames_backend_fuehrt_zur_anfrage() {
        let u = Umgebung::starten_mit(Some(Arc::new(HaengendesBackend)));

        let anrufen = u.handle.anrufen(u.gegenueber, u.match_id);
        let call_id = tokio::time::timeout(Duration::from_secs(5), anrufen)
            .await
            .expect("Controller blockiert")
            .unwrap();
        abarbeiten().await;

        assert_eq!(u.status(), CallStatus::Requesting);
        assert!(u.gesendet().iter().any(|s| matches!(
            s,
            ClientSignal::RequestVoicePermission { call_id: c, .. } if *c == call_id
        )));

        // Controller bleibt bedienbar
        u.handle.auflegen().await.unwrap();
        abarbeiten().await;
        assert_eq!(u.status(), CallStatus::Idle);
    }

    #[test]
    fn kandidaten_puffer_ist_begrenzt() {
        let session = CallSession::neu(
            CallId::new(),
            1,
            UserId::new(),
            MatchId::new(),
            CallRolle::Anrufer,
            CallStatus::Outgoing,
        );
        let mut anruf = AktiverAnruf::neu(session);
        for nr in 0..70 {
            anruf.kandidat_puffern(IceKandidat {
                candidate: format!("candidate:{nr} 1 udp 1 10.0.0.2 50000 typ host"),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            });
        }
        assert_eq!(anruf.ausstehende_kandidaten.len(), MAX_AUSSTEHENDE_KANDIDATEN);
        assert!(anruf
            .ausstehende_kandidaten
            .front()
            .unwrap()
            .candidate
            .starts_with("candidate:6 "));
        assert!(anruf
            .ausstehende_kandidaten
            .back()
            .unwrap()
            .candidate
            .starts_with("candidate:69 "));
    }

    #[tokio::test(start_paused = true)]
    async fn stumm_und_minimiert() {
        let u = Umgebung::starten();
        assert!(matches!(
            u.handle.stumm_schalten(true).await,
            Err(CallError::KeinAktiverAnruf)
        ));
        u.verbunden_als_anrufer().await;

        u.handle.stumm_schalten(true).await.unwrap();
        u.handle.minimieren(true).await.unwrap();

        let session = u.handle.zustand().session.unwrap();
        assert!(session.stumm);
        assert!(session.minimiert);
        assert!(u.mikrofon.ausgegeben()[0].ist_stumm());

        u.handle.stumm_schalten(false).await.unwrap();
        assert!(!u.mikrofon.ausgegeben()[0].ist_stumm());
    }

    #[tokio::test(start_paused = true)]
    async fn beenden_legt_laufenden_anruf_auf() {
        let u = Umgebung::starten();
        let call_id = u.verbunden_als_anrufer().await;

        u.handle.beenden().await;
        abarbeiten().await;

        assert!(u.gesendet().iter().any(|s| matches!(
            s,
            ClientSignal::EndCall { call_id: c, .. } if *c == call_id
        )));
        assert_eq!(u.lokal.anzahl_typ(&u.match_id, NachrichtenTyp::CallLog), 1);
        assert_eq!(u.mikrofon.aktive_anzahl(), 0);
        assert!(matches!(
            u.handle.anrufen(u.gegenueber, u.match_id).await,
            Err(CallError::ControllerBeendet)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn nachrichten_landen_im_lokalen_cache() {
        let mut u = Umgebung::starten();
        let mut nachricht = ChatNachricht::neu(
            u.match_id,
            u.gegenueber,
            u.kanal.id,
            NachrichtenTyp::Text,
            "Hallo",
        );
        u.einspeisen(RelaySignal::ReceiveMessage {
            from: u.gegenueber,
            message: nachricht.clone(),
        });
        nachricht.content = "Hallo!".to_string();
        u.einspeisen(RelaySignal::UpdateMessage {
            from: u.gegenueber,
            message: nachricht.clone(),
        });
        u.einspeisen(RelaySignal::GetUsers {
            users: vec![u.gegenueber],
        });
        abarbeiten().await;

        assert_eq!(
            u.lokal.nachricht(&u.match_id, &nachricht.id).unwrap().content,
            "Hallo!"
        );
        let ereignisse = u.ereignisse_leeren();
        assert!(ereignisse.contains(&CallEreignis::NachrichtAktualisiert(nachricht)));
        assert!(ereignisse.contains(&CallEreignis::OnlineListe(vec![u.gegenueber])));
    }
}
