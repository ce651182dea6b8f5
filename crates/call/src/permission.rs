//! Client-seitiger Cache erteilter Anruf-Berechtigungen
//!
//! Eine Berechtigung gilt pro Gegenueber. Sie entsteht wenn der
//! Angerufene zustimmt und wird vor jedem Anrufversuch geprueft.
//! Standardmaessig laeuft sie nie ab; optional mit TTL.

use rendezvous_core::types::UserId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Berechtigungs-Cache
///
/// Gehoert exklusiv dem Anruf-Controller, daher ohne Locks.
#[derive(Debug, Default)]
pub struct BerechtigungsCache {
    erteilt: HashMap<UserId, Instant>,
    ttl: Option<Duration>,
}

impl BerechtigungsCache {
    pub fn neu(ttl: Option<Duration>) -> Self {
        Self {
            erteilt: HashMap::new(),
            ttl,
        }
    }

    /// Merkt eine erteilte Berechtigung (setzt die TTL zurueck)
    pub fn gewaehren(&mut self, gegenueber: UserId) {
        self.erteilt.insert(gegenueber, Instant::now());
        tracing::debug!(gegenueber = %gegenueber, "Berechtigung gespeichert");
    }

    /// Entfernt eine Berechtigung; `true` wenn eine vorhanden war
    pub fn entziehen(&mut self, gegenueber: &UserId) -> bool {
        let entfernt = self.erteilt.remove(gegenueber).is_some();
        if entfernt {
            tracing::debug!(gegenueber = %gegenueber, "Berechtigung entfernt");
        }
        entfernt
    }

    /// Prueft ob eine gueltige Berechtigung vorliegt
    ///
    /// Abgelaufene Eintraege werden dabei entfernt.
    pub fn ist_erlaubt(&mut self, gegenueber: &UserId) -> bool {
        let Some(seit) = self.erteilt.get(gegenueber).copied() else {
            return false;
        };
        match self.ttl {
            Some(ttl) if seit.elapsed() >= ttl => {
                self.erteilt.remove(gegenueber);
                tracing::debug!(gegenueber = %gegenueber, "Berechtigung abgelaufen");
                false
            }
            _ => true,
        }
    }

    pub fn anzahl(&self) -> usize {
        self.erteilt.len()
    }
}
