//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Relay ohne Konfigurationsdatei
//! lauffaehig ist.

use rendezvous_observability::logging::{log_format_gueltig, log_level_gueltig};
use rendezvous_signaling::RelayKonfiguration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Relay-Einstellungen
    pub relay: RelayEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
    /// Observability-Einstellungen (Metriken, Health)
    pub observability: ObservabilityEinstellungen,
}

/// Relay-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayEinstellungen {
    /// Bind-Adresse fuer den TCP-Listener
    pub bind_adresse: String,
    pub port: u16,
    /// Maximale Anzahl gleichzeitig registrierter Clients
    pub max_clients: u32,
    /// Sekunden bis zum ersten `add-user` einer neuen Verbindung
    pub registrierungs_timeout_sek: u64,
    /// Maximale Frame-Groesse in Bytes
    pub max_frame_size: usize,
}

impl Default for RelayEinstellungen {
    fn default() -> Self {
        let relay = RelayKonfiguration::default();
        Self {
            bind_adresse: "0.0.0.0".into(),
            port: 9000,
            max_clients: relay.max_clients,
            registrierungs_timeout_sek: relay.registrierungs_timeout.as_secs(),
            max_frame_size: relay.max_frame_size,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Observability-Einstellungen (Metriken + Health-Check)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityEinstellungen {
    /// Aktiviert den Observability-Server
    pub aktiviert: bool,
    /// Port fuer Metriken und Health (Standard: 9300)
    pub port: u16,
}

impl Default for ObservabilityEinstellungen {
    fn default() -> Self {
        Self {
            aktiviert: true,
            port: 9300,
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        let config = match std::fs::read_to_string(pfad) {
            Ok(inhalt) => toml::from_str::<Self>(&inhalt)
                .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
                ))
            }
        };
        config.validieren()?;
        Ok(config)
    }

    /// Prueft Werte die serde allein nicht abfangen kann
    pub fn validieren(&self) -> anyhow::Result<()> {
        if self.relay.max_clients == 0 {
            anyhow::bail!("relay.max_clients muss groesser als 0 sein");
        }
        if self.relay.registrierungs_timeout_sek == 0 {
            anyhow::bail!("relay.registrierungs_timeout_sek muss groesser als 0 sein");
        }
        if !log_level_gueltig(&self.logging.level) {
            anyhow::bail!("Unbekannter Log-Level '{}'", self.logging.level);
        }
        if !log_format_gueltig(&self.logging.format) {
            anyhow::bail!("Unbekanntes Log-Format '{}'", self.logging.format);
        }
        Ok(())
    }

    /// Konfiguration fuer den Relay-Zustand
    pub fn relay_konfiguration(&self) -> RelayKonfiguration {
        RelayKonfiguration {
            max_clients: self.relay.max_clients,
            registrierungs_timeout: Duration::from_secs(self.relay.registrierungs_timeout_sek),
            max_frame_size: self.relay.max_frame_size,
        }
    }

    /// Gibt die vollstaendige Bind-Adresse fuer den Relay zurueck
    pub fn relay_bind_adresse(&self) -> String {
        format!("{}:{}", self.relay.bind_adresse, self.relay.port)
    }

    /// Gibt die Bind-Adresse fuer den Observability-Server zurueck
    pub fn observability_bind_adresse(&self) -> String {
        format!("{}:{}", self.relay.bind_adresse, self.observability.port)
    }
}
