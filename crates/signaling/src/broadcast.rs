//! Event-Broadcaster – Send-Queues aller registrierten User
//!
//! Der EventBroadcaster bildet User-IDs auf die Send-Queue der Verbindung
//! ab, ueber die sich der User per `add-user` registriert hat. Eine erneute
//! Registrierung derselben User-ID ersetzt die alte Verbindung; jede
//! Registrierung bekommt eine Generation, damit das Aufraeumen einer alten
//! Verbindung die neue nicht entfernt.

use dashmap::DashMap;
use rendezvous_core::types::UserId;
use rendezvous_protocol::RelaySignal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Groesse der Send-Queue pro Client
const SEND_QUEUE_GROESSE: usize = 64;

// ---------------------------------------------------------------------------
// Zustellung
// ---------------------------------------------------------------------------

/// Ergebnis eines Zustellversuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zustellung {
    /// In die Send-Queue des Empfaengers eingereiht
    Zugestellt,
    /// Empfaenger ist nicht registriert
    Offline,
    /// Send-Queue des Empfaengers ist voll
    QueueVoll,
    /// Verbindung des Empfaengers wird gerade geschlossen
    Geschlossen,
}

impl Zustellung {
    /// Label fuer Metriken
    pub fn grund(&self) -> &'static str {
        match self {
            Self::Zugestellt => "zugestellt",
            Self::Offline => "offline",
            Self::QueueVoll => "queue_voll",
            Self::Geschlossen => "geschlossen",
        }
    }
}

// ---------------------------------------------------------------------------
// ClientSender
// ---------------------------------------------------------------------------

/// Handle auf die Send-Queue einer registrierten Verbindung
#[derive(Clone, Debug)]
pub struct ClientSender {
    pub user_id: UserId,
    pub generation: u64,
    pub tx: mpsc::Sender<RelaySignal>,
}

impl ClientSender {
    /// Sendet ein Signal nicht-blockierend an den Client
    pub fn senden(&self, signal: RelaySignal) -> Zustellung {
        match self.tx.try_send(signal) {
            Ok(()) => Zustellung::Zugestellt,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(user_id = %self.user_id, "Send-Queue voll – Signal verworfen");
                Zustellung::QueueVoll
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(user_id = %self.user_id, "Send-Queue geschlossen (Client getrennt)");
                Zustellung::Geschlossen
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EventBroadcaster
// ---------------------------------------------------------------------------

/// Zentrale Zuordnung UserId -> Send-Queue
///
/// Thread-safe via Arc + DashMap. Clone teilt den inneren Zustand.
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<EventBroadcasterInner>,
}

struct EventBroadcasterInner {
    clients: DashMap<UserId, ClientSender>,
    naechste_generation: AtomicU64,
}

impl EventBroadcaster {
    /// Erstellt einen neuen EventBroadcaster
    pub fn neu() -> Self {
        Self {
            inner: Arc::new(EventBroadcasterInner {
                clients: DashMap::new(),
                naechste_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Registriert eine Verbindung fuer `user_id`
    ///
    /// Gibt die Generation der Registrierung und die Empfangs-Queue zurueck.
    /// Eine vorherige Registrierung derselben User-ID wird ersetzt; deren
    /// Queue schliesst sich sobald der alte Sender gedroppt ist.
    pub fn client_registrieren(&self, user_id: UserId) -> (u64, mpsc::Receiver<RelaySignal>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_GROESSE);
        let generation = self.inner.naechste_generation.fetch_add(1, Ordering::Relaxed);
        let sender = ClientSender {
            user_id,
            generation,
            tx,
        };
        if let Some(alt) = self.inner.clients.insert(user_id, sender) {
            tracing::info!(
                user_id = %user_id,
                alte_generation = alt.generation,
                "Bestehende Registrierung ersetzt"
            );
        }
        tracing::debug!(user_id = %user_id, generation, "Client im Broadcaster registriert");
        (generation, rx)
    }

    /// Entfernt die Registrierung, sofern sie noch zur Generation gehoert
    ///
    /// Gibt `true` zurueck wenn tatsaechlich entfernt wurde.
    pub fn client_entfernen(&self, user_id: &UserId, generation: u64) -> bool {
        let entfernt = self
            .inner
            .clients
            .remove_if(user_id, |_, sender| sender.generation == generation)
            .is_some();
        if entfernt {
            tracing::debug!(user_id = %user_id, generation, "Client aus Broadcaster entfernt");
        }
        entfernt
    }

    /// Sendet ein Signal an einen einzelnen User
    pub fn an_user_senden(&self, user_id: &UserId, signal: RelaySignal) -> Zustellung {
        match self.inner.clients.get(user_id) {
            Some(sender) => sender.senden(signal),
            None => {
                tracing::debug!(user_id = %user_id, "Senden an nicht registrierten User");
                Zustellung::Offline
            }
        }
    }

    /// Sendet ein Signal an alle registrierten User
    ///
    /// Gibt die Anzahl der erfolgreichen Zustellungen zurueck.
    pub fn an_alle_senden(&self, signal: RelaySignal) -> usize {
        let mut gesendet = 0;
        self.inner.clients.iter().for_each(|entry| {
            if entry.value().senden(signal.clone()) == Zustellung::Zugestellt {
                gesendet += 1;
            }
        });
        gesendet
    }

    /// Prueft ob ein User registriert ist
    pub fn ist_registriert(&self, user_id: &UserId) -> bool {
        self.inner.clients.contains_key(user_id)
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signal() -> RelaySignal {
        RelaySignal::GetUsers { users: vec![] }
    }

    #[tokio::test]
    async fn registrieren_und_senden() {
        let broadcaster = EventBroadcaster::neu();
        let uid = UserId::new();

        let (_, mut rx) = broadcaster.client_registrieren(uid);
        assert!(broadcaster.ist_registriert(&uid));

        assert_eq!(
            broadcaster.an_user_senden(&uid, test_signal()),
            Zustellung::Zugestellt
        );
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn senden_an_unbekannten_user_ist_offline() {
        let broadcaster = EventBroadcaster::neu();
        assert_eq!(
            broadcaster.an_user_senden(&UserId::new(), test_signal()),
            Zustellung::Offline
        );
    }

    #[tokio::test]
    async fn neue_registrierung_ersetzt_alte() {
        let broadcaster = EventBroadcaster::neu();
        let uid = UserId::new();

        let (alt_gen, mut alt_rx) = broadcaster.client_registrieren(uid);
        let (neu_gen, mut neu_rx) = broadcaster.client_registrieren(uid);
        assert_ne!(alt_gen, neu_gen);

        // Alte Queue ist geschlossen, neue empfaengt
        assert!(alt_rx.recv().await.is_none());
        broadcaster.an_user_senden(&uid, test_signal());
        assert!(neu_rx.try_recv().is_ok());

        // Aufraeumen der alten Verbindung darf die neue nicht entfernen
        assert!(!broadcaster.client_entfernen(&uid, alt_gen));
        assert!(broadcaster.ist_registriert(&uid));
        assert!(broadcaster.client_entfernen(&uid, neu_gen));
        assert!(!broadcaster.ist_registriert(&uid));
    }

    #[tokio::test]
    async fn volle_queue_verwirft() {
        let broadcaster = EventBroadcaster::neu();
        let uid = UserId::new();
        let (_, _rx) = broadcaster.client_registrieren(uid);

        for _ in 0..SEND_QUEUE_GROESSE {
            assert_eq!(
                broadcaster.an_user_senden(&uid, test_signal()),
                Zustellung::Zugestellt
            );
        }
        assert_eq!(
            broadcaster.an_user_senden(&uid, test_signal()),
            Zustellung::QueueVoll
        );
    }

    #[tokio::test]
    async fn an_alle_senden() {
        let broadcaster = EventBroadcaster::neu();
        let mut receivers: Vec<_> = (0..4)
            .map(|_| broadcaster.client_registrieren(UserId::new()).1)
            .collect();

        assert_eq!(broadcaster.an_alle_senden(test_signal()), 4);
        for rx in &mut receivers {
            assert!(rx.try_recv().is_ok());
        }
    }
}
