//! Fehlertypen fuer den Anruf-Controller

use thiserror::Error;

use crate::state::CallStatus;

/// Anruf-Fehlertypen
#[derive(Debug, Error)]
pub enum CallError {
    /// Es laeuft bereits ein Anruf (hoechstens einer pro Client)
    #[error("Es ist bereits ein Anruf aktiv")]
    BereitsAktiv,

    #[error("Kein aktiver Anruf")]
    KeinAktiverAnruf,

    /// Aktion passt nicht zum aktuellen Zustand
    #[error("'{aktion}' ist im Zustand {zustand} nicht moeglich")]
    UngueltigerZustand {
        aktion: &'static str,
        zustand: CallStatus,
    },

    #[error("Ungueltiger Empfaenger: {0}")]
    UngueltigerEmpfaenger(String),

    /// Mikrofon nicht verfuegbar oder Zugriff verweigert
    #[error("Mikrofon nicht verfuegbar: {0}")]
    Medien(String),

    /// Fehler der Peer-Verbindung
    #[error("Peer-Verbindung fehlgeschlagen: {0}")]
    Peer(String),

    /// Relay ist nicht verbunden
    #[error("Relay nicht verbunden")]
    RelayGetrennt,

    /// Fehler beim Lesen oder Schreiben von Nachrichten/Matches
    #[error("Speicher-Fehler: {0}")]
    Speicher(String),

    #[error("HTTP-Fehler: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Zeitlimit ueberschritten")]
    Zeitlimit,

    /// Der Controller-Task laeuft nicht mehr
    #[error("Anruf-Controller beendet")]
    ControllerBeendet,
}

impl CallError {
    /// Erstellt einen Medienfehler
    pub fn medien(msg: impl Into<String>) -> Self {
        Self::Medien(msg.into())
    }

    /// Erstellt einen Peer-Fehler
    pub fn peer(msg: impl Into<String>) -> Self {
        Self::Peer(msg.into())
    }

    /// Erstellt einen Speicher-Fehler
    pub fn speicher(msg: impl Into<String>) -> Self {
        Self::Speicher(msg.into())
    }
}

pub type CallResult<T> = Result<T, CallError>;
