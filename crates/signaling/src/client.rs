//! Relay-Client – ueberwachte Verbindung zum Relay
//!
//! Ein `RelayClient` haelt eine TCP-Verbindung zum Relay, registriert die
//! eigene User-ID per `add-user` und stellt eingehende Events ueber einen
//! Broadcast-Kanal bereit. Bricht die Verbindung ab, wird mit
//! exponentiellem Backoff neu verbunden und erneut registriert. Der
//! aktuelle Verbindungsstatus ist ueber einen `watch`-Kanal beobachtbar.
//!
//! Ausgehende Events sind fire-and-forget. Solange keine Verbindung
//! besteht, werden sie mit einer Warnung verworfen.

use futures_util::{SinkExt, StreamExt};
use rendezvous_core::types::{CallId, MatchId, UserId};
use rendezvous_protocol::{
    wire::{FrameCodec, DEFAULT_MAX_FRAME_SIZE},
    AblehnGrund, Benachrichtigung, ChatNachricht, ClientSignal, IceKandidat, RelaySignal,
    SitzungsBeschreibung,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::Framed;

use crate::error::{SignalingError, SignalingResult};

/// Groesse des Broadcast-Kanals fuer eingehende Events
const EINGANG_KANAL_GROESSE: usize = 256;

// ---------------------------------------------------------------------------
// Konfiguration und Status
// ---------------------------------------------------------------------------

/// Konfiguration des Relay-Clients
#[derive(Debug, Clone)]
pub struct RelayClientKonfiguration {
    /// Adresse des Relays (host:port)
    pub adresse: String,
    /// Erste Wartezeit vor einem erneuten Verbindungsversuch
    pub backoff_start: Duration,
    /// Obergrenze fuer die Wartezeit
    pub backoff_max: Duration,
    pub max_frame_size: usize,
}

impl Default for RelayClientKonfiguration {
    fn default() -> Self {
        Self {
            adresse: "127.0.0.1:9000".to_string(),
            backoff_start: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Verbindungsstatus des Relay-Clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// Verbindungsaufbau laeuft
    Verbindet,
    /// Verbunden und registriert
    Verbunden,
    /// Verbindung verloren, naechster Versuch nach Backoff
    Getrennt,
    /// Client wurde beendet
    Beendet,
}

// ---------------------------------------------------------------------------
// RelayClient
// ---------------------------------------------------------------------------

/// Handle auf die ueberwachte Relay-Verbindung
///
/// Clone teilt die Verbindung. Wird der letzte Clone gedroppt, endet der
/// Hintergrund-Task.
#[derive(Clone)]
pub struct RelayClient {
    user_id: UserId,
    ausgang_tx: mpsc::UnboundedSender<ClientSignal>,
    eingang_tx: broadcast::Sender<RelaySignal>,
    status_rx: watch::Receiver<RelayStatus>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl RelayClient {
    /// Startet die ueberwachte Verbindung im Hintergrund
    ///
    /// Muss innerhalb einer tokio-Runtime aufgerufen werden.
    pub fn starten(user_id: UserId, konfig: RelayClientKonfiguration) -> Self {
        let (ausgang_tx, ausgang_rx) = mpsc::unbounded_channel();
        let (eingang_tx, _) = broadcast::channel(EINGANG_KANAL_GROESSE);
        let (status_tx, status_rx) = watch::channel(RelayStatus::Verbindet);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ueberwacher = Ueberwacher {
            user_id,
            konfig,
            ausgang_rx,
            eingang_tx: eingang_tx.clone(),
            status_tx,
            shutdown_rx,
        };
        tokio::spawn(ueberwacher.laufen());

        Self {
            user_id,
            ausgang_tx,
            eingang_tx,
            status_rx,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Eigene User-ID
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Sendet ein Event (fire-and-forget)
    ///
    /// Gibt `false` zurueck wenn das Event verworfen wurde.
    pub fn senden(&self, signal: ClientSignal) -> bool {
        if *self.status_rx.borrow() != RelayStatus::Verbunden {
            tracing::warn!(event = signal.name(), "Relay nicht verbunden – Event verworfen");
            return false;
        }
        if self.ausgang_tx.send(signal).is_err() {
            tracing::warn!("Relay-Client beendet – Event verworfen");
            return false;
        }
        true
    }

    /// Abonniert eingehende Events
    pub fn abonnieren(&self) -> broadcast::Receiver<RelaySignal> {
        self.eingang_tx.subscribe()
    }

    /// Aktueller Verbindungsstatus
    pub fn status(&self) -> RelayStatus {
        *self.status_rx.borrow()
    }

    /// Beobachtet den Verbindungsstatus
    pub fn status_abonnieren(&self) -> watch::Receiver<RelayStatus> {
        self.status_rx.clone()
    }

    /// Wartet bis die Verbindung steht und die Registrierung gesendet ist
    pub async fn warten_bis_verbunden(&self, timeout: Duration) -> SignalingResult<()> {
        let mut rx = self.status_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == RelayStatus::Verbunden))
            .await
            .map_err(|_| SignalingError::Timeout)?
            .map_err(|_| SignalingError::VerbindungGetrennt)?;
        Ok(())
    }

    /// Beendet die Verbindung
    pub fn beenden(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // -----------------------------------------------------------------------
    // Typisierte Events
    // -----------------------------------------------------------------------

    pub fn berechtigung_anfragen(&self, to: UserId, match_id: MatchId, call_id: CallId) -> bool {
        self.senden(ClientSignal::RequestVoicePermission {
            to,
            match_id,
            call_id,
        })
    }

    pub fn berechtigung_erteilen(&self, to: UserId, match_id: MatchId, call_id: CallId) -> bool {
        self.senden(ClientSignal::VoicePermissionAccepted {
            to,
            match_id,
            call_id,
        })
    }

    pub fn berechtigung_verweigern(
        &self,
        to: UserId,
        match_id: MatchId,
        call_id: CallId,
        grund: AblehnGrund,
    ) -> bool {
        self.senden(ClientSignal::VoicePermissionRejected {
            to,
            match_id,
            call_id,
            grund,
        })
    }

    pub fn anrufen(
        &self,
        to: UserId,
        match_id: MatchId,
        call_id: CallId,
        offer: SitzungsBeschreibung,
    ) -> bool {
        self.senden(ClientSignal::CallUser {
            to,
            match_id,
            call_id,
            offer,
        })
    }

    pub fn annehmen(&self, to: UserId, call_id: CallId, answer: SitzungsBeschreibung) -> bool {
        self.senden(ClientSignal::AnswerCall {
            to,
            call_id,
            answer,
        })
    }

    pub fn ice_senden(&self, to: UserId, call_id: CallId, candidate: IceKandidat) -> bool {
        self.senden(ClientSignal::IceCandidate {
            to,
            call_id,
            candidate,
        })
    }

    pub fn anruf_ablehnen(&self, to: UserId, call_id: CallId, grund: AblehnGrund) -> bool {
        self.senden(ClientSignal::RejectCall { to, call_id, grund })
    }

    pub fn anruf_beenden(&self, to: UserId, call_id: CallId) -> bool {
        self.senden(ClientSignal::EndCall { to, call_id })
    }

    pub fn nachricht_senden(&self, to: UserId, message: ChatNachricht) -> bool {
        self.senden(ClientSignal::SendMessage { to, message })
    }

    pub fn nachricht_aktualisieren(&self, to: UserId, message: ChatNachricht) -> bool {
        self.senden(ClientSignal::UpdateMessage { to, message })
    }

    pub fn benachrichtigung_senden(&self, to: UserId, notification: Benachrichtigung) -> bool {
        self.senden(ClientSignal::SendNotification { to, notification })
    }
}

// ---------------------------------------------------------------------------
// Hintergrund-Task
// ---------------------------------------------------------------------------

/// Warum eine Sitzung endete
enum SitzungsEnde {
    Getrennt(String),
    Beendet,
}

struct Ueberwacher {
    user_id: UserId,
    konfig: RelayClientKonfiguration,
    ausgang_rx: mpsc::UnboundedReceiver<ClientSignal>,
    eingang_tx: broadcast::Sender<RelaySignal>,
    status_tx: watch::Sender<RelayStatus>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Ueberwacher {
    async fn laufen(mut self) {
        let mut backoff = self.konfig.backoff_start;

        loop {
            self.status_tx.send_replace(RelayStatus::Verbindet);

            let verbindung = tokio::select! {
                v = TcpStream::connect(self.konfig.adresse.as_str()) => v,
                _ = self.shutdown_rx.changed() => break,
            };

            match verbindung {
                Ok(stream) => {
                    backoff = self.konfig.backoff_start;
                    match self.sitzung(stream).await {
                        SitzungsEnde::Beendet => break,
                        SitzungsEnde::Getrennt(grund) => {
                            tracing::warn!(
                                user_id = %self.user_id,
                                grund = %grund,
                                "Relay-Verbindung verloren"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        adresse = %self.konfig.adresse,
                        fehler = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Relay nicht erreichbar"
                    );
                }
            }

            self.status_tx.send_replace(RelayStatus::Getrennt);

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown_rx.changed() => break,
            }
            backoff = (backoff * 2).min(self.konfig.backoff_max);
        }

        self.status_tx.send_replace(RelayStatus::Beendet);
        tracing::debug!(user_id = %self.user_id, "Relay-Client beendet");
    }

    async fn sitzung(&mut self, stream: TcpStream) -> SitzungsEnde {
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(
            stream,
            FrameCodec::<RelaySignal>::with_max_size(self.konfig.max_frame_size),
        );

        if let Err(e) = framed
            .send(ClientSignal::AddUser {
                user_id: self.user_id,
            })
            .await
        {
            return SitzungsEnde::Getrennt(e.to_string());
        }

        // Events aus der vorherigen Sitzung sind veraltet
        let mut veraltet = 0usize;
        while self.ausgang_rx.try_recv().is_ok() {
            veraltet += 1;
        }
        if veraltet > 0 {
            tracing::debug!(anzahl = veraltet, "Veraltete Events verworfen");
        }

        self.status_tx.send_replace(RelayStatus::Verbunden);
        tracing::info!(user_id = %self.user_id, adresse = %self.konfig.adresse, "Beim Relay registriert");

        loop {
            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(Ok(signal)) => {
                            tracing::trace!(event = signal.name(), "Event vom Relay");
                            // Ohne Abonnenten geht das Event verloren
                            let _ = self.eingang_tx.send(signal);
                        }
                        Some(Err(e)) => return SitzungsEnde::Getrennt(e.to_string()),
                        None => return SitzungsEnde::Getrennt("vom Relay geschlossen".to_string()),
                    }
                }

                ausgehend = self.ausgang_rx.recv() => {
                    match ausgehend {
                        Some(signal) => {
                            if let Err(e) = framed.send(signal).await {
                                return SitzungsEnde::Getrennt(e.to_string());
                            }
                        }
                        None => return SitzungsEnde::Beendet,
                    }
                }

                _ = self.shutdown_rx.changed() => return SitzungsEnde::Beendet,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
