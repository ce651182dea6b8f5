//! Anrufzustand
//!
//! ```text
//! idle --anrufen, keine Berechtigung--> requesting --erteilt--> outgoing
//! idle --anrufen, Berechtigung da-----> outgoing --call-answered--> connected
//! idle --voice-permission-requested--> incoming_request --entschieden--> idle
//! idle --call-made--> incoming --annehmen, Peer verbunden--> connected
//! requesting | outgoing --Frist abgelaufen--> idle (missed_call)
//! connected --auflegen (lokal oder Gegenueber)--> idle (call_log)
//! ```
//!
//! `failed` wird nur kurz gemeldet wenn die Relay-Verbindung waehrend
//! eines Anrufs abbricht; danach folgt sofort `idle`.

use chrono::{DateTime, Utc};
use rendezvous_core::types::{CallId, MatchId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Zustand des Anruf-Controllers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    Idle,
    /// Berechtigung beim Gegenueber angefragt
    Requesting,
    /// Gegenueber fragt nach Berechtigung, Entscheidung steht aus
    IncomingRequest,
    /// Offer gesendet, es klingelt beim Gegenueber
    Outgoing,
    /// Offer empfangen, es klingelt lokal
    Incoming,
    Connected,
    /// Relay-Verbindung waehrend des Anrufs verloren
    Failed,
}

impl CallStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Requesting => "requesting",
            Self::IncomingRequest => "incoming_request",
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }

    /// Laeuft die Frist fuer einen unbeantworteten Anruf?
    pub fn hat_frist(&self) -> bool {
        matches!(self, Self::Requesting | Self::Outgoing)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rolle im aktuellen Anrufversuch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRolle {
    Anrufer,
    Angerufener,
}

/// Ephemere Sitzung eines einzelnen Anrufversuchs
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    /// Kennung auf dem Draht, vom Anrufer erzeugt
    pub call_id: CallId,
    /// Lokale, streng steigende Versuchsnummer
    pub versuch: u64,
    pub gegenueber: UserId,
    pub match_id: MatchId,
    pub rolle: CallRolle,
    pub status: CallStatus,
    pub gestartet_am: DateTime<Utc>,
    /// Zeitpunkt des Wechsels nach `connected`
    pub verbunden_seit: Option<Instant>,
    pub stumm: bool,
    pub minimiert: bool,
}

impl CallSession {
    pub fn neu(
        call_id: CallId,
        versuch: u64,
        gegenueber: UserId,
        match_id: MatchId,
        rolle: CallRolle,
        status: CallStatus,
    ) -> Self {
        Self {
            call_id,
            versuch,
            gegenueber,
            match_id,
            rolle,
            status,
            gestartet_am: Utc::now(),
            verbunden_seit: None,
            stumm: false,
            minimiert: false,
        }
    }

    /// Bisherige Gespraechsdauer (0 solange nicht verbunden)
    pub fn dauer(&self) -> Duration {
        self.verbunden_seit
            .map(|seit| seit.elapsed())
            .unwrap_or_default()
    }
}

/// Beobachtbarer Zustand fuer die Oberflaeche
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallZustand {
    pub status: CallStatus,
    pub session: Option<CallSession>,
}

impl CallZustand {
    pub fn ist_idle(&self) -> bool {
        self.status == CallStatus::Idle
    }
}
