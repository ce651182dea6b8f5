//! Ereignisse des Anruf-Controllers fuer die Oberflaeche

use rendezvous_core::types::{CallId, MatchId, UserId};
use rendezvous_protocol::{Benachrichtigung, ChatNachricht};

use crate::state::CallStatus;

/// Warum ein Anrufversuch endete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbschlussGrund {
    /// Lokal aufgelegt
    Aufgelegt,
    /// Gegenueber hat aufgelegt oder abgebrochen
    GegenueberAufgelegt,
    /// Lokal oder vom Gegenueber abgelehnt
    Abgelehnt,
    /// Gegenueber fuehrt bereits einen Anruf
    Besetzt,
    /// Keine Antwort innerhalb der Frist
    Verpasst,
    /// Anfrage des Gegenuebers wurde erlaubt
    BerechtigungErteilt,
    /// Eigene Anfrage wurde abgelehnt
    BerechtigungVerweigert,
    /// Lokal abgebrochen bevor jemand annahm
    Abgebrochen,
    Medienfehler,
    Verbindungsfehler,
    RelayGetrennt,
}

/// Ereignisse fuer die Oberflaeche
#[derive(Debug, Clone, PartialEq)]
pub enum CallEreignis {
    StatusGeaendert {
        call_id: CallId,
        von: CallStatus,
        nach: CallStatus,
    },
    /// Gegenueber bittet um Erlaubnis fuer Sprachanrufe
    BerechtigungAngefragt {
        von: UserId,
        match_id: MatchId,
        call_id: CallId,
    },
    /// Es klingelt
    EingehenderAnruf {
        von: UserId,
        match_id: MatchId,
        call_id: CallId,
    },
    /// Audio des Gegenuebers kann an eine Ausgabe gehaengt werden
    RemoteStream { call_id: CallId, stream_id: String },
    Beendet {
        call_id: CallId,
        grund: AbschlussGrund,
    },
    /// Kurzer Hinweistext (Toast)
    Hinweis { text: String },
    NachrichtEmpfangen(ChatNachricht),
    NachrichtAktualisiert(ChatNachricht),
    Benachrichtigung {
        von: UserId,
        benachrichtigung: Benachrichtigung,
    },
    OnlineListe(Vec<UserId>),
}
