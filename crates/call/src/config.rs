//! Konfiguration des Anruf-Controllers

use std::time::Duration;

/// Oeffentlicher STUN-Server (kein TURN)
pub const STANDARD_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Wartezeit bis ein unbeantworteter Anruf als verpasst gilt
pub const STANDARD_ANRUF_TIMEOUT: Duration = Duration::from_secs(30);

/// Laengste Wartezeit auf das Berechtigungs-Flag des Backends
pub const STANDARD_BERECHTIGUNG_ABFRAGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Konfiguration des Anruf-Controllers
#[derive(Debug, Clone)]
pub struct CallKonfiguration {
    /// Frist fuer Berechtigungsanfrage und Klingeln
    pub anruf_timeout: Duration,
    /// ICE-Server fuer die Peer-Verbindung
    pub stun_server: String,
    /// Gueltigkeit einer erteilten Berechtigung; `None` = unbegrenzt
    pub berechtigung_ttl: Option<Duration>,
    /// Danach wird ohne Backend-Antwort angefragt
    pub berechtigung_abfrage_timeout: Duration,
}

impl Default for CallKonfiguration {
    fn default() -> Self {
        Self {
            anruf_timeout: STANDARD_ANRUF_TIMEOUT,
            stun_server: STANDARD_STUN_SERVER.to_string(),
            berechtigung_ttl: None,
            berechtigung_abfrage_timeout: STANDARD_BERECHTIGUNG_ABFRAGE_TIMEOUT,
        }
    }
}
