//! rendezvous-server – Bibliotheks-Root
//!
//! Deklariert die Server-Module und stellt den oeffentlichen Einstiegspunkt
//! fuer Integrationstests bereit.

pub mod config;

use anyhow::{Context, Result};
use config::ServerConfig;
use rendezvous_observability::{observability_server_starten, HealthState, RendezvousMetrics};
use rendezvous_signaling::{RelayServer, RelayState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Haelt den Server-Zustand vor dem Binden zusammen
pub struct Server {
    pub config: ServerConfig,
}

/// Server mit gebundenem Relay-Listener
pub struct GebundenerServer {
    config: ServerConfig,
    relay: RelayServer,
    state: Arc<RelayState>,
    health: HealthState,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bindet den Relay-Listener
    pub async fn binden(self) -> Result<GebundenerServer> {
        let metriken = RendezvousMetrics::neu().context("Metriken konnten nicht registriert werden")?;
        let state = RelayState::neu(self.config.relay_konfiguration(), metriken);
        let adresse = self.config.relay_bind_adresse();
        let relay = RelayServer::binden(Arc::clone(&state), adresse.as_str())
            .await
            .with_context(|| format!("Relay-Listener auf {adresse} nicht bindbar"))?;

        Ok(GebundenerServer {
            config: self.config,
            relay,
            state,
            health: HealthState::neu(),
        })
    }

    /// Startet alle Subsysteme und laeuft bis Ctrl-C
    pub async fn starten(self) -> Result<()> {
        let server = self.binden().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(fehler = %e, "Ctrl-C Handler fehlgeschlagen");
            }
            tracing::info!("Shutdown-Signal empfangen, Server wird beendet");
            let _ = shutdown_tx.send(true);
        });
        server.laufen(shutdown_rx).await
    }
}

impl GebundenerServer {
    /// Tatsaechlich gebundene Relay-Adresse
    pub fn relay_adresse(&self) -> Result<SocketAddr> {
        Ok(self.relay.lokale_adresse()?)
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Laeuft bis `shutdown_rx` ein `true`-Signal empfaengt
    ///
    /// Reihenfolge:
    /// 1. Observability-Server starten (falls aktiviert)
    /// 2. Relay-Listener annehmen lassen
    pub async fn laufen(self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let relay_adresse = self.relay_adresse()?;
        tracing::info!(
            relay = %relay_adresse,
            max_clients = self.config.relay.max_clients,
            observability = self.config.observability.aktiviert,
            "Server startet"
        );

        if self.config.observability.aktiviert {
            let adresse: SocketAddr = self
                .config
                .observability_bind_adresse()
                .parse()
                .context("Ungueltige Observability-Adresse")?;
            let metriken = self.state.metriken.clone();
            let health = self.health.clone();
            tokio::spawn(async move {
                if let Err(e) = observability_server_starten(adresse, metriken, health).await {
                    tracing::error!(fehler = %e, "Observability-Server beendet");
                }
            });
        }

        self.health.relay_status_setzen(true);
        let ergebnis = self.relay.starten(shutdown_rx).await;
        self.health.relay_status_setzen(false);

        tracing::info!(
            uptime_sek = self.state.uptime_sek(),
            "Relay beendet"
        );
        Ok(ergebnis?)
    }
}
