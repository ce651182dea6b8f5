//! Client-Connection – Verwaltet eine einzelne Relay-Verbindung
//!
//! Jede TCP-Verbindung bekommt eine `ClientConnection` in einem eigenen
//! tokio-Task.
//!
//! ## Ablauf
//! ```text
//! Verbunden --add-user--> Registriert --EOF/Fehler/Shutdown--> Getrennt
//!     |
//!     +-- anderes Event oder Timeout --> Getrennt
//! ```
//!
//! Nach der Registrierung werden eingehende Events ueber den
//! `SignalRouter` zugestellt und die eigene Send-Queue auf den Socket
//! geschrieben. Wird dieselbe User-ID von einer neueren Verbindung
//! registriert, schliesst sich die Send-Queue und diese Verbindung endet.

use futures_util::{SinkExt, StreamExt};
use rendezvous_core::types::UserId;
use rendezvous_protocol::{wire::FrameCodec, ClientSignal, RelaySignal};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::codec::Framed;

use crate::error::{SignalingError, SignalingResult};
use crate::presence::ClientPresence;
use crate::router::SignalRouter;
use crate::server_state::RelayState;

type RelayFramed<S> = Framed<S, FrameCodec<ClientSignal>>;

/// Verarbeitet eine einzelne Relay-Verbindung
pub struct ClientConnection {
    state: Arc<RelayState>,
    peer_addr: Option<SocketAddr>,
}

impl ClientConnection {
    /// Erstellt eine neue ClientConnection
    pub fn neu(state: Arc<RelayState>, peer_addr: Option<SocketAddr>) -> Self {
        Self { state, peer_addr }
    }

    /// Startet die Verbindungs-Verarbeitungsschleife
    ///
    /// Laeuft bis die Verbindung getrennt wird oder ein Shutdown-Signal
    /// eingeht. Generisch ueber den Stream, damit auch In-Memory-Streams
    /// verarbeitet werden koennen.
    pub async fn verarbeiten<S>(self, stream: S, mut shutdown_rx: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer = self.peer_anzeige();
        tracing::debug!(peer = %peer, "Neue Verbindung");

        let mut framed = Framed::new(
            stream,
            FrameCodec::<ClientSignal>::with_max_size(self.state.config.max_frame_size),
        );

        let user_id = match self.registrierung_abwarten(&mut framed).await {
            Ok(uid) => uid,
            Err(e) => {
                tracing::warn!(peer = %peer, fehler = %e, "Registrierung fehlgeschlagen");
                return;
            }
        };

        let (generation, mut sende_rx) = self.state.broadcaster.client_registrieren(user_id);
        self.state
            .presence
            .client_online(ClientPresence::neu(user_id, self.peer_addr));
        self.state.metriken.registrations_total.inc();
        self.state
            .metriken
            .connected_clients
            .set(self.state.presence.online_anzahl() as f64);

        let router = SignalRouter::neu(Arc::clone(&self.state));
        router.online_liste_verteilen();

        tracing::info!(peer = %peer, user_id = %user_id, "User registriert");

        loop {
            tokio::select! {
                // Eingehendes Event vom Client
                frame = framed.next() => {
                    match frame {
                        Some(Ok(signal)) => {
                            tracing::trace!(user_id = %user_id, event = signal.name(), "Event empfangen");
                            router.weiterleiten(user_id, signal);
                        }
                        Some(Err(e)) => {
                            self.state.metriken.frame_errors_total.inc();
                            tracing::warn!(user_id = %user_id, fehler = %e, "Frame-Lesefehler");
                            break;
                        }
                        None => {
                            tracing::info!(user_id = %user_id, "Verbindung vom Client getrennt");
                            break;
                        }
                    }
                }

                // Ausgehendes Event aus dem Broadcaster
                ausgehend = sende_rx.recv() => {
                    match ausgehend {
                        Some(signal) => {
                            if let Err(e) = framed.send(signal).await {
                                tracing::warn!(user_id = %user_id, fehler = %e, "Senden fehlgeschlagen");
                                break;
                            }
                        }
                        None => {
                            tracing::info!(user_id = %user_id, "Durch neuere Registrierung ersetzt");
                            break;
                        }
                    }
                }

                // Shutdown-Signal
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!(user_id = %user_id, "Shutdown-Signal – Verbindung wird getrennt");
                        break;
                    }
                }
            }
        }

        // Cleanup nur wenn die Registrierung noch dieser Verbindung gehoert
        if self.state.broadcaster.client_entfernen(&user_id, generation) {
            self.state.presence.client_offline(&user_id);
            self.state
                .metriken
                .connected_clients
                .set(self.state.presence.online_anzahl() as f64);
            router.online_liste_verteilen();
        }

        tracing::debug!(peer = %peer, user_id = %user_id, "Verbindungs-Task beendet");
    }

    /// Wartet auf den ersten Frame, der ein `add-user` sein muss
    async fn registrierung_abwarten<S>(&self, framed: &mut RelayFramed<S>) -> SignalingResult<UserId>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = self.state.config.registrierungs_timeout;
        let erster = tokio::time::timeout(timeout, framed.next())
            .await
            .map_err(|_| SignalingError::Timeout)?;

        match erster {
            Some(Ok(ClientSignal::AddUser { user_id })) => Ok(user_id),
            Some(Ok(anderes)) => Err(SignalingError::protokoll(format!(
                "erstes Event muss add-user sein, war {}",
                anderes.name()
            ))),
            Some(Err(e)) => {
                self.state.metriken.frame_errors_total.inc();
                Err(SignalingError::Io(e))
            }
            None => Err(SignalingError::VerbindungGetrennt),
        }
    }

    fn peer_anzeige(&self) -> String {
        self.peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "lokal".to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
