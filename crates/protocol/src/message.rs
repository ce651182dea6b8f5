//! Chat-Nachrichten und Benachrichtigungen
//!
//! Anruf-Ergebnisse werden als eigene Nachrichtentypen in die
//! Match-History geschrieben. Das Modell ist identisch fuer lokale
//! Zwischenspeicherung, REST-Persistenz und das Relay (`send-message`).

use chrono::{DateTime, Utc};
use rendezvous_core::types::{MatchId, MessageId, UserId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Nachrichtentyp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NachrichtenTyp {
    Text,
    CallRequest,
    CallAccepted,
    CallDeclined,
    MissedCall,
    CallLog,
}

impl NachrichtenTyp {
    /// Gibt true zurueck fuer alle Anruf-Ergebnis-Varianten
    pub fn ist_anruf(&self) -> bool {
        !matches!(self, Self::Text)
    }

    /// Standardtext fuer Anruf-Nachrichten ohne eigenen Inhalt
    pub fn standard_text(&self) -> &'static str {
        match self {
            Self::Text => "",
            Self::CallRequest => "Anfrage fuer Sprachanruf",
            Self::CallAccepted => "Sprachanrufe erlaubt",
            Self::CallDeclined => "Sprachanruf abgelehnt",
            Self::MissedCall => "Verpasster Anruf",
            Self::CallLog => "Sprachanruf",
        }
    }
}

/// Eine Nachricht in der History eines Matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatNachricht {
    pub id: MessageId,
    pub match_id: MatchId,
    pub sender_id: UserId,
    pub empfaenger_id: UserId,
    pub content: String,
    pub message_type: NachrichtenTyp,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

impl ChatNachricht {
    /// Erstellt eine neue Nachricht mit frischer ID und aktuellem Zeitstempel
    pub fn neu(
        match_id: MatchId,
        sender_id: UserId,
        empfaenger_id: UserId,
        message_type: NachrichtenTyp,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            match_id,
            sender_id,
            empfaenger_id,
            content: content.into(),
            message_type,
            created_at: Utc::now(),
            edited_at: None,
        }
    }

    /// Erstellt eine Anruf-Nachricht mit dem Standardtext des Typs
    pub fn anruf(
        match_id: MatchId,
        sender_id: UserId,
        empfaenger_id: UserId,
        message_type: NachrichtenTyp,
    ) -> Self {
        Self::neu(
            match_id,
            sender_id,
            empfaenger_id,
            message_type,
            message_type.standard_text(),
        )
    }

    /// Erstellt den Gespraechsprotokoll-Eintrag (`call_log`) mit `MM:SS`-Dauer
    pub fn anruf_protokoll(
        match_id: MatchId,
        sender_id: UserId,
        empfaenger_id: UserId,
        dauer: Duration,
    ) -> Self {
        Self::neu(
            match_id,
            sender_id,
            empfaenger_id,
            NachrichtenTyp::CallLog,
            dauer_formatieren(dauer),
        )
    }
}

/// Formatiert eine Gespraechsdauer als `MM:SS` (volle Sekunden, abgerundet)
///
/// Minuten werden nicht auf Stunden umgebrochen: 3725 s ergibt `62:05`.
pub fn dauer_formatieren(dauer: Duration) -> String {
    let sekunden = dauer.as_secs();
    format!("{:02}:{:02}", sekunden / 60, sekunden % 60)
}

/// App-Benachrichtigung (`send-notification` / `receive-notification`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Benachrichtigung {
    /// Art der Benachrichtigung (z.B. "like", "match", "voice_call")
    pub art: String,
    /// Anzeigetext
    pub text: String,
    /// Bezug auf ein Match (optional)
    pub match_id: Option<MatchId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dauer_formatierung() {
        assert_eq!(dauer_formatieren(Duration::from_secs(0)), "00:00");
        assert_eq!(dauer_formatieren(Duration::from_secs(65)), "01:05");
        assert_eq!(dauer_formatieren(Duration::from_millis(59_999)), "00:59");
        assert_eq!(dauer_formatieren(Duration::from_secs(3725)), "62:05");
    }

    #[test]
    fn anruf_protokoll_enthaelt_dauer() {
        let n = ChatNachricht::anruf_protokoll(
            MatchId::new(),
            UserId::new(),
            UserId::new(),
            Duration::from_secs(65),
        );
        assert_eq!(n.message_type, NachrichtenTyp::CallLog);
        assert_eq!(n.content, "01:05");
    }

    #[test]
    fn nachrichtentyp_wire_namen() {
        let json = serde_json::to_string(&NachrichtenTyp::MissedCall).unwrap();
        assert_eq!(json, "\"missed_call\"");
        let typ: NachrichtenTyp = serde_json::from_str("\"call_request\"").unwrap();
        assert_eq!(typ, NachrichtenTyp::CallRequest);
        assert!(typ.ist_anruf());
        assert!(!NachrichtenTyp::Text.ist_anruf());
    }
}
