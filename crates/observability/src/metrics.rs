//! Prometheus-kompatible Metriken fuer den Relay
//!
//! Registrierte Metriken:
//! - `rendezvous_connected_clients` – Gauge: aktuell registrierte User
//! - `rendezvous_registrations_total` – Counter: `add-user` Registrierungen
//! - `rendezvous_signals_routed_total` – Counter (event): zugestellte Signale
//! - `rendezvous_signals_dropped_total` – Counter (grund): verworfene Signale
//! - `rendezvous_frame_errors_total` – Counter: ungueltige Frames
//!
//! Client-seitig (`AnrufMetriken`):
//! - `rendezvous_calls_total` – Counter (ergebnis): gestartet, verbunden,
//!   verpasst, abgelehnt, fehlgeschlagen

use anyhow::Result;
use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Alle Relay-Metriken
///
/// Clone teilt Registry und Zaehler.
#[derive(Clone)]
pub struct RendezvousMetrics {
    pub registry: Arc<Registry>,

    pub connected_clients: Gauge,
    pub registrations_total: IntCounter,
    pub signals_routed_total: IntCounterVec,
    pub signals_dropped_total: IntCounterVec,
    pub frame_errors_total: IntCounter,
}

impl RendezvousMetrics {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        let connected_clients = Gauge::with_opts(Opts::new(
            "rendezvous_connected_clients",
            "Anzahl aktuell registrierter User",
        ))?;
        registry.register(Box::new(connected_clients.clone()))?;

        let registrations_total = IntCounter::with_opts(Opts::new(
            "rendezvous_registrations_total",
            "Gesamtanzahl add-user Registrierungen",
        ))?;
        registry.register(Box::new(registrations_total.clone()))?;

        let signals_routed_total = IntCounterVec::new(
            Opts::new(
                "rendezvous_signals_routed_total",
                "Zugestellte Signale nach Eventname",
            ),
            &["event"],
        )?;
        registry.register(Box::new(signals_routed_total.clone()))?;

        let signals_dropped_total = IntCounterVec::new(
            Opts::new(
                "rendezvous_signals_dropped_total",
                "Verworfene Signale nach Grund",
            ),
            &["grund"],
        )?;
        registry.register(Box::new(signals_dropped_total.clone()))?;

        let frame_errors_total = IntCounter::with_opts(Opts::new(
            "rendezvous_frame_errors_total",
            "Ungueltige oder zu grosse Frames",
        ))?;
        registry.register(Box::new(frame_errors_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            connected_clients,
            registrations_total,
            signals_routed_total,
            signals_dropped_total,
            frame_errors_total,
        })
    }

    /// Zaehlt ein zugestelltes Signal
    pub fn signal_zugestellt(&self, event: &str) {
        self.signals_routed_total.with_label_values(&[event]).inc();
    }

    /// Zaehlt ein verworfenes Signal
    pub fn signal_verworfen(&self, grund: &str) {
        self.signals_dropped_total.with_label_values(&[grund]).inc();
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Metriken des Anruf-Controllers
#[derive(Clone)]
pub struct AnrufMetriken {
    pub registry: Arc<Registry>,
    pub calls_total: IntCounterVec,
}

impl AnrufMetriken {
    /// Registriert die Anruf-Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        Self::in_registry(Arc::new(Registry::new()))
    }

    /// Registriert die Anruf-Metriken in einer bestehenden Registry
    pub fn in_registry(registry: Arc<Registry>) -> Result<Self> {
        let calls_total = IntCounterVec::new(
            Opts::new("rendezvous_calls_total", "Anrufversuche nach Ergebnis"),
            &["ergebnis"],
        )?;
        registry.register(Box::new(calls_total.clone()))?;
        Ok(Self {
            registry,
            calls_total,
        })
    }

    pub fn zaehlen(&self, ergebnis: &str) {
        self.calls_total.with_label_values(&[ergebnis]).inc();
    }

    pub fn anzahl(&self, ergebnis: &str) -> u64 {
        self.calls_total.with_label_values(&[ergebnis]).get()
    }
}

/// Axum-Router fuer den `/metrics`-Endpunkt
pub fn metrics_router(metriken: RendezvousMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metriken)
}

async fn metrics_handler(
    axum::extract::State(metriken): axum::extract::State<RendezvousMetrics>,
) -> impl IntoResponse {
    match metriken.exportieren() {
        Ok(text) => (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Metriken-Export fehlgeschlagen: {err}");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_connected_clients_setzen() {
        let metriken = RendezvousMetrics::neu().unwrap();
        metriken.connected_clients.set(3.0);
        assert_eq!(metriken.connected_clients.get(), 3.0);
    }

    #[test]
    fn signale_nach_label_zaehlen() {
        let metriken = RendezvousMetrics::neu().unwrap();
        metriken.signal_zugestellt("call-user");
        metriken.signal_zugestellt("call-user");
        metriken.signal_verworfen("offline");
        assert_eq!(
            metriken
                .signals_routed_total
                .with_label_values(&["call-user"])
                .get(),
            2
        );
        assert_eq!(
            metriken
                .signals_dropped_total
                .with_label_values(&["offline"])
                .get(),
            1
        );
    }

    #[test]
    fn anruf_metriken_in_gemeinsamer_registry() {
        let relay = RendezvousMetrics::neu().unwrap();
        let anrufe = AnrufMetriken::in_registry(Arc::clone(&relay.registry)).unwrap();
        anrufe.zaehlen("verpasst");
        assert_eq!(anrufe.anzahl("verpasst"), 1);
        assert!(relay
            .exportieren()
            .unwrap()
            .contains("rendezvous_calls_total{ergebnis=\"verpasst\"} 1"));
    }

    #[test]
    fn metriken_export_prometheus_format() {
        let metriken = RendezvousMetrics::neu().unwrap();
        metriken.registrations_total.inc();
        metriken.signal_zugestellt("ice-candidate");

        let output = metriken.exportieren().unwrap();
        assert!(output.contains("rendezvous_registrations_total 1"));
        assert!(output.contains("rendezvous_signals_routed_total{event=\"ice-candidate\"} 1"));
        assert!(output.contains("# TYPE"));
    }
}
