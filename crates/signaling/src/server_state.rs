//! Gemeinsamer Relay-Zustand
//!
//! Haelt Konfiguration, Broadcaster, Presence und Metriken als
//! Arc-geteilten Zustand fuer alle Verbindungs-Tasks.

use rendezvous_observability::RendezvousMetrics;
use rendezvous_protocol::wire::DEFAULT_MAX_FRAME_SIZE;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broadcast::EventBroadcaster;
use crate::presence::PresenceManager;

/// Konfiguration fuer den Relay
#[derive(Debug, Clone)]
pub struct RelayKonfiguration {
    /// Maximale Anzahl gleichzeitiger Verbindungen
    pub max_clients: u32,
    /// Zeit bis zum ersten `add-user` Frame
    pub registrierungs_timeout: Duration,
    /// Maximale Frame-Groesse in Bytes
    pub max_frame_size: usize,
}

impl Default for RelayKonfiguration {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            registrierungs_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Gemeinsamer Relay-Zustand (thread-safe, Arc-geteilt)
pub struct RelayState {
    pub config: Arc<RelayKonfiguration>,
    /// UserId -> Send-Queue
    pub broadcaster: EventBroadcaster,
    /// Wer ist online
    pub presence: PresenceManager,
    pub metriken: RendezvousMetrics,
    /// Startzeitpunkt des Relays (fuer Uptime-Berechnung)
    pub start_time: Instant,
}

impl RelayState {
    /// Erstellt einen neuen RelayState
    pub fn neu(config: RelayKonfiguration, metriken: RendezvousMetrics) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            broadcaster: EventBroadcaster::neu(),
            presence: PresenceManager::neu(),
            metriken,
            start_time: Instant::now(),
        })
    }

    /// Gibt die Uptime in Sekunden zurueck
    pub fn uptime_sek(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
