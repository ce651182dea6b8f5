//! Gemeinsame Identifikationstypen fuer Rendezvous
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! Benutzer-, Match-, Nachrichten- und Anruf-IDs zur Compilezeit
//! auszuschliessen.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $praefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Erstellt eine neue zufaellige ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Gibt die innere UUID zurueck
            pub fn inner(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($praefix, ":{}"), self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Eindeutige Benutzer-ID (Adresse im Relay)
    UserId,
    "user"
);

uuid_id!(
    /// ID eines Matches (zwei Benutzer, gemeinsame Nachrichten-History)
    MatchId,
    "match"
);

uuid_id!(
    /// ID einer Chat-Nachricht
    MessageId,
    "message"
);

uuid_id!(
    /// Kennung eines einzelnen Anrufversuchs
    ///
    /// Wird vom Anrufer erzeugt und in jedem Call-Signal mitgeschickt,
    /// damit verspaetete Signale eines alten Versuchs verworfen werden.
    CallId,
    "call"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_eindeutig() {
        let a = UserId::new();
        let b = UserId::new();
        assert_ne!(a, b, "Zwei neue UserIds muessen verschieden sein");
    }

    #[test]
    fn call_id_display() {
        let id = CallId(Uuid::nil());
        assert!(id.to_string().starts_with("call:"));
    }

    #[test]
    fn ids_serialisieren_als_nackte_uuid() {
        let mid = MatchId::new();
        let json = serde_json::to_string(&mid).unwrap();
        assert_eq!(json, format!("\"{}\"", mid.inner()));
        let zurueck: MatchId = serde_json::from_str(&json).unwrap();
        assert_eq!(mid, zurueck);
    }
}
