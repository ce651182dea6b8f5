//! Presence-Manager – Wer ist gerade beim Relay registriert
//!
//! Haelt den ephemeren Online-Zustand aller registrierten User. Die
//! Online-Liste ist die Grundlage des `get-users` Broadcasts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rendezvous_core::types::UserId;
use std::net::SocketAddr;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// ClientPresence
// ---------------------------------------------------------------------------

/// Presence-Info eines registrierten Users
#[derive(Debug, Clone)]
pub struct ClientPresence {
    pub user_id: UserId,
    pub peer_addr: Option<SocketAddr>,
    pub registriert_seit: DateTime<Utc>,
}

impl ClientPresence {
    pub fn neu(user_id: UserId, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            user_id,
            peer_addr,
            registriert_seit: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// PresenceManager
// ---------------------------------------------------------------------------

/// Verwaltet den Online-Status aller registrierten User
///
/// Thread-safe via Arc + DashMap. Clone des Managers teilt den inneren Zustand.
#[derive(Clone)]
pub struct PresenceManager {
    inner: Arc<PresenceManagerInner>,
}

struct PresenceManagerInner {
    clients: DashMap<UserId, ClientPresence>,
}

impl PresenceManager {
    /// Erstellt einen neuen PresenceManager
    pub fn neu() -> Self {
        Self {
            inner: Arc::new(PresenceManagerInner {
                clients: DashMap::new(),
            }),
        }
    }

    /// Markiert einen User als online
    ///
    /// Eine bestehende Presence derselben User-ID wird ueberschrieben.
    pub fn client_online(&self, presence: ClientPresence) {
        let user_id = presence.user_id;
        let peer_addr = presence.peer_addr;
        let war_online = self.inner.clients.insert(user_id, presence).is_some();

        tracing::info!(user_id = %user_id, peer = ?peer_addr, erneut = war_online, "User online");
    }

    /// Markiert einen User als offline
    pub fn client_offline(&self, user_id: &UserId) {
        if let Some((_, presence)) = self.inner.clients.remove(user_id) {
            let dauer = Utc::now() - presence.registriert_seit;
            tracing::info!(
                user_id = %user_id,
                online_sek = dauer.num_seconds(),
                "User offline"
            );
        }
    }

    pub fn ist_online(&self, user_id: &UserId) -> bool {
        self.inner.clients.contains_key(user_id)
    }

    /// Anzahl der registrierten User
    pub fn online_anzahl(&self) -> usize {
        self.inner.clients.len()
    }

    /// Alle registrierten User-IDs, sortiert fuer stabile Ausgabe
    pub fn online_user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.inner.clients.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
