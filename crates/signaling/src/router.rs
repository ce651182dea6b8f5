//! Signal-Router – Zustellung von Client-Events an ihre Empfaenger
//!
//! Der Router kennt keinen Anrufzustand. Er uebersetzt jedes Event in das
//! Gegenstueck fuer den Empfaenger, stempelt den registrierten Absender
//! ein und reiht es in dessen Send-Queue. Ist der Empfaenger nicht
//! registriert, wird das Event kommentarlos verworfen.

use rendezvous_core::types::UserId;
use rendezvous_protocol::{ClientSignal, RelaySignal};
use std::sync::Arc;

use crate::broadcast::Zustellung;
use crate::server_state::RelayState;

/// Leitet Events zwischen registrierten Usern weiter
#[derive(Clone)]
pub struct SignalRouter {
    state: Arc<RelayState>,
}

impl SignalRouter {
    pub fn neu(state: Arc<RelayState>) -> Self {
        Self { state }
    }

    /// Stellt ein Event des Absenders zu
    ///
    /// Gibt das Ergebnis der Zustellung zurueck; `add-user` nach der
    /// Registrierung gilt als Protokollfehler und wird verworfen.
    pub fn weiterleiten(&self, absender: UserId, signal: ClientSignal) -> Zustellung {
        let event = signal.name();
        let Some((ziel, relay_signal)) = signal.zustellen(absender) else {
            tracing::warn!(user_id = %absender, event, "Unerwartetes Event nach Registrierung");
            self.state.metriken.signal_verworfen("protokoll");
            return Zustellung::Offline;
        };

        let ergebnis = self.state.broadcaster.an_user_senden(&ziel, relay_signal);
        match ergebnis {
            Zustellung::Zugestellt => {
                tracing::debug!(von = %absender, an = %ziel, event, "Signal zugestellt");
                self.state.metriken.signal_zugestellt(event);
            }
            andere => {
                tracing::debug!(
                    von = %absender,
                    an = %ziel,
                    event,
                    grund = andere.grund(),
                    "Signal verworfen"
                );
                self.state.metriken.signal_verworfen(andere.grund());
            }
        }
        ergebnis
    }

    /// Sendet die aktuelle Online-Liste an alle registrierten User
    pub fn online_liste_verteilen(&self) -> usize {
        let users = self.state.presence.online_user_ids();
        let anzahl = users.len();
        let empfaenger = self
            .state
            .broadcaster
            .an_alle_senden(RelaySignal::GetUsers { users });
        tracing::trace!(online = anzahl, empfaenger, "get-users verteilt");
        empfaenger
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::ClientPresence;
    use crate::server_state::RelayKonfiguration;
    use rendezvous_core::types::{CallId, MatchId};
    use rendezvous_observability::RendezvousMetrics;

    fn test_state() -> Arc<RelayState> {
        RelayState::neu(
            RelayKonfiguration::default(),
            RendezvousMetrics::neu().unwrap(),
        )
    }

    #[tokio::test]
    async fn absender_wird_vom_relay_gesetzt() {
        let state = test_state();
        let router = SignalRouter::neu(Arc::clone(&state));
        let alice = UserId::new();
        let bob = UserId::new();
        let (_, mut bob_rx) = state.broadcaster.client_registrieren(bob);

        let call_id = CallId::new();
        let match_id = MatchId::new();
        let ergebnis = router.weiterleiten(
            alice,
            ClientSignal::RequestVoicePermission {
                to: bob,
                match_id,
                call_id,
            },
        );
        assert_eq!(ergebnis, Zustellung::Zugestellt);

        assert_eq!(
            bob_rx.try_recv().unwrap(),
            RelaySignal::VoicePermissionRequested {
                from: alice,
                match_id,
                call_id,
            }
        );
        assert_eq!(
            state
                .metriken
                .signals_routed_total
                .with_label_values(&["request-voice-permission"])
                .get(),
            1
        );
    }

    #[test]
    fn unbekannter_empfaenger_wird_verworfen() {
        let state = test_state();
        let router = SignalRouter::neu(Arc::clone(&state));

        let ergebnis = router.weiterleiten(
            UserId::new(),
            ClientSignal::EndCall {
                to: UserId::new(),
                call_id: CallId::new(),
            },
        );
        assert_eq!(ergebnis, Zustellung::Offline);
        assert_eq!(
            state
                .metriken
                .signals_dropped_total
                .with_label_values(&["offline"])
                .get(),
            1
        );
    }

    #[test]
    fn add_user_nach_registrierung_wird_verworfen() {
        let state = test_state();
        let router = SignalRouter::neu(state);
        let uid = UserId::new();
        assert_eq!(
            router.weiterleiten(uid, ClientSignal::AddUser { user_id: uid }),
            Zustellung::Offline
        );
    }

    #[tokio::test]
    async fn online_liste_an_alle() {
        let state = test_state();
        let router = SignalRouter::neu(Arc::clone(&state));
        let a = UserId::new();
        let b = UserId::new();
        let (_, mut a_rx) = state.broadcaster.client_registrieren(a);
        let (_, mut b_rx) = state.broadcaster.client_registrieren(b);
        state.presence.client_online(ClientPresence::neu(a, None));
        state.presence.client_online(ClientPresence::neu(b, None));

        assert_eq!(router.online_liste_verteilen(), 2);

        let mut erwartet = vec![a, b];
        erwartet.sort();
        for rx in [&mut a_rx, &mut b_rx] {
            assert_eq!(
                rx.try_recv().unwrap(),
                RelaySignal::GetUsers {
                    users: erwartet.clone()
                }
            );
        }
    }
}
