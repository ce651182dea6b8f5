//! Signal-Vokabular zwischen Client und Relay
//!
//! ## Design
//! - Fire-and-forget: kein Request/Response, keine Bestaetigungen
//! - JSON-Objekte mit `event`-Feld als Tag (kebab-case Eventnamen)
//! - `ClientSignal` fliesst Client -> Relay und traegt den Empfaenger (`to`),
//!   `RelaySignal` fliesst Relay -> Client und traegt den Absender (`from`)
//! - Alle Anruf-Signale tragen die `call_id` des Anrufversuchs

use rendezvous_core::types::{CallId, MatchId, UserId};
use serde::{Deserialize, Serialize};

use crate::message::{Benachrichtigung, ChatNachricht};

// ---------------------------------------------------------------------------
// WebRTC-Payloads
// ---------------------------------------------------------------------------

/// Art einer Session-Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpTyp {
    Offer,
    Answer,
}

/// SDP-Beschreibung (Offer oder Answer), unveraendert weitergereicht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitzungsBeschreibung {
    #[serde(rename = "type")]
    pub typ: SdpTyp,
    pub sdp: String,
}

impl SitzungsBeschreibung {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            typ: SdpTyp::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            typ: SdpTyp::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE-Kandidat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceKandidat {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Grund fuer eine Ablehnung
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AblehnGrund {
    /// Vom Benutzer abgelehnt
    #[default]
    Abgelehnt,
    /// Gegenueber fuehrt bereits einen Anruf
    Besetzt,
}

// ---------------------------------------------------------------------------
// Client -> Relay
// ---------------------------------------------------------------------------

/// Ausgehende Events eines Clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientSignal {
    /// Registriert die eigene User-ID am Relay
    AddUser { user_id: UserId },

    // Berechtigungs-Handshake
    RequestVoicePermission {
        to: UserId,
        match_id: MatchId,
        call_id: CallId,
    },
    VoicePermissionAccepted {
        to: UserId,
        match_id: MatchId,
        call_id: CallId,
    },
    VoicePermissionRejected {
        to: UserId,
        match_id: MatchId,
        call_id: CallId,
        #[serde(default)]
        grund: AblehnGrund,
    },

    // Anruf
    CallUser {
        to: UserId,
        match_id: MatchId,
        call_id: CallId,
        offer: SitzungsBeschreibung,
    },
    AnswerCall {
        to: UserId,
        call_id: CallId,
        answer: SitzungsBeschreibung,
    },
    IceCandidate {
        to: UserId,
        call_id: CallId,
        candidate: IceKandidat,
    },
    RejectCall {
        to: UserId,
        call_id: CallId,
        #[serde(default)]
        grund: AblehnGrund,
    },
    EndCall { to: UserId, call_id: CallId },

    // Nachrichten
    SendMessage { to: UserId, message: ChatNachricht },
    UpdateMessage { to: UserId, message: ChatNachricht },
    SendNotification {
        to: UserId,
        notification: Benachrichtigung,
    },
}

impl ClientSignal {
    /// Eventname auf dem Draht (fuer Logging)
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddUser { .. } => "add-user",
            Self::RequestVoicePermission { .. } => "request-voice-permission",
            Self::VoicePermissionAccepted { .. } => "voice-permission-accepted",
            Self::VoicePermissionRejected { .. } => "voice-permission-rejected",
            Self::CallUser { .. } => "call-user",
            Self::AnswerCall { .. } => "answer-call",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::RejectCall { .. } => "reject-call",
            Self::EndCall { .. } => "end-call",
            Self::SendMessage { .. } => "send-message",
            Self::UpdateMessage { .. } => "update-message",
            Self::SendNotification { .. } => "send-notification",
        }
    }

    /// Empfaenger des Events (None fuer `add-user`)
    pub fn empfaenger(&self) -> Option<UserId> {
        match self {
            Self::AddUser { .. } => None,
            Self::RequestVoicePermission { to, .. }
            | Self::VoicePermissionAccepted { to, .. }
            | Self::VoicePermissionRejected { to, .. }
            | Self::CallUser { to, .. }
            | Self::AnswerCall { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::RejectCall { to, .. }
            | Self::EndCall { to, .. }
            | Self::SendMessage { to, .. }
            | Self::UpdateMessage { to, .. }
            | Self::SendNotification { to, .. } => Some(*to),
        }
    }

    /// Uebersetzt das ausgehende Event in das Event das der Empfaenger sieht
    ///
    /// `from` ist die beim Relay registrierte ID des Absenders, nicht ein
    /// vom Client behaupteter Wert. Gibt `None` fuer `add-user` zurueck.
    pub fn zustellen(self, from: UserId) -> Option<(UserId, RelaySignal)> {
        let ziel = self.empfaenger()?;
        let signal = match self {
            Self::AddUser { .. } => return None,
            Self::RequestVoicePermission {
                match_id, call_id, ..
            } => RelaySignal::VoicePermissionRequested {
                from,
                match_id,
                call_id,
            },
            Self::VoicePermissionAccepted {
                match_id, call_id, ..
            } => RelaySignal::VoicePermissionGranted {
                from,
                match_id,
                call_id,
            },
            Self::VoicePermissionRejected {
                match_id,
                call_id,
                grund,
                ..
            } => RelaySignal::VoicePermissionDenied {
                from,
                match_id,
                call_id,
                grund,
            },
            Self::CallUser {
                match_id,
                call_id,
                offer,
                ..
            } => RelaySignal::CallMade {
                from,
                match_id,
                call_id,
                offer,
            },
            Self::AnswerCall {
                call_id, answer, ..
            } => RelaySignal::CallAnswered {
                from,
                call_id,
                answer,
            },
            Self::IceCandidate {
                call_id, candidate, ..
            } => RelaySignal::IceCandidate {
                from,
                call_id,
                candidate,
            },
            Self::RejectCall { call_id, grund, .. } => RelaySignal::CallRejected {
                from,
                call_id,
                grund,
            },
            Self::EndCall { call_id, .. } => RelaySignal::CallEnded { from, call_id },
            Self::SendMessage { message, .. } => RelaySignal::ReceiveMessage { from, message },
            Self::UpdateMessage { message, .. } => RelaySignal::UpdateMessage { from, message },
            Self::SendNotification { notification, .. } => {
                RelaySignal::ReceiveNotification { from, notification }
            }
        };
        Some((ziel, signal))
    }
}

// ---------------------------------------------------------------------------
// Relay -> Client
// ---------------------------------------------------------------------------

/// Eingehende Events eines Clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelaySignal {
    VoicePermissionRequested {
        from: UserId,
        match_id: MatchId,
        call_id: CallId,
    },
    VoicePermissionGranted {
        from: UserId,
        match_id: MatchId,
        call_id: CallId,
    },
    VoicePermissionDenied {
        from: UserId,
        match_id: MatchId,
        call_id: CallId,
        #[serde(default)]
        grund: AblehnGrund,
    },
    CallMade {
        from: UserId,
        match_id: MatchId,
        call_id: CallId,
        offer: SitzungsBeschreibung,
    },
    CallAnswered {
        from: UserId,
        call_id: CallId,
        answer: SitzungsBeschreibung,
    },
    IceCandidate {
        from: UserId,
        call_id: CallId,
        candidate: IceKandidat,
    },
    CallRejected {
        from: UserId,
        call_id: CallId,
        #[serde(default)]
        grund: AblehnGrund,
    },
    CallEnded { from: UserId, call_id: CallId },
    ReceiveNotification {
        from: UserId,
        notification: Benachrichtigung,
    },
    ReceiveMessage { from: UserId, message: ChatNachricht },
    UpdateMessage { from: UserId, message: ChatNachricht },
    /// Liste aller aktuell registrierten User
    GetUsers { users: Vec<UserId> },
}

impl RelaySignal {
    /// Eventname auf dem Draht (fuer Logging)
    pub fn name(&self) -> &'static str {
        match self {
            Self::VoicePermissionRequested { .. } => "voice-permission-requested",
            Self::VoicePermissionGranted { .. } => "voice-permission-granted",
            Self::VoicePermissionDenied { .. } => "voice-permission-denied",
            Self::CallMade { .. } => "call-made",
            Self::CallAnswered { .. } => "call-answered",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallRejected { .. } => "call-rejected",
            Self::CallEnded { .. } => "call-ended",
            Self::ReceiveNotification { .. } => "receive-notification",
            Self::ReceiveMessage { .. } => "receive-message",
            Self::UpdateMessage { .. } => "update-message",
            Self::GetUsers { .. } => "get-users",
        }
    }

    /// Anruf-Kennung fuer alle Signale die zu einem Anrufversuch gehoeren
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::VoicePermissionRequested { call_id, .. }
            | Self::VoicePermissionGranted { call_id, .. }
            | Self::VoicePermissionDenied { call_id, .. }
            | Self::CallMade { call_id, .. }
            | Self::CallAnswered { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::CallRejected { call_id, .. }
            | Self::CallEnded { call_id, .. } => Some(*call_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_namen_auf_dem_draht() {
        let signal = ClientSignal::RequestVoicePermission {
            to: UserId::new(),
            match_id: MatchId::new(),
            call_id: CallId::new(),
        };
        let json: serde_json::Value = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["event"], "request-voice-permission");
        assert_eq!(json["event"], signal.name());

        let relay = RelaySignal::GetUsers { users: vec![] };
        let json = serde_json::to_value(&relay).unwrap();
        assert_eq!(json["event"], "get-users");
    }

    #[test]
    fn call_user_wird_call_made_mit_absender() {
        let absender = UserId::new();
        let ziel = UserId::new();
        let match_id = MatchId::new();
        let call_id = CallId::new();

        let (empfaenger, signal) = ClientSignal::CallUser {
            to: ziel,
            match_id,
            call_id,
            offer: SitzungsBeschreibung::offer("v=0"),
        }
        .zustellen(absender)
        .expect("call-user muss zustellbar sein");

        assert_eq!(empfaenger, ziel);
        match signal {
            RelaySignal::CallMade {
                from,
                match_id: m,
                call_id: c,
                offer,
            } => {
                assert_eq!(from, absender);
                assert_eq!(m, match_id);
                assert_eq!(c, call_id);
                assert_eq!(offer.typ, SdpTyp::Offer);
            }
            anderes => panic!("Erwartet call-made, erhalten {}", anderes.name()),
        }
    }

    #[test]
    fn add_user_wird_nicht_zugestellt() {
        let signal = ClientSignal::AddUser {
            user_id: UserId::new(),
        };
        assert!(signal.empfaenger().is_none());
        assert!(signal.zustellen(UserId::new()).is_none());
    }

    #[test]
    fn ablehngrund_fehlt_ergibt_standard() {
        let json = format!(
            r#"{{"event":"reject-call","to":"{}","call_id":"{}"}}"#,
            UserId::new().inner(),
            CallId::new().inner()
        );
        let signal: ClientSignal = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            signal,
            ClientSignal::RejectCall {
                grund: AblehnGrund::Abgelehnt,
                ..
            }
        ));
    }

    #[test]
    fn ice_kandidat_gleicher_eventname_in_beide_richtungen() {
        let kandidat = IceKandidat {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let (_, relay) = ClientSignal::IceCandidate {
            to: UserId::new(),
            call_id: CallId::new(),
            candidate: kandidat.clone(),
        }
        .zustellen(UserId::new())
        .unwrap();
        assert_eq!(relay.name(), "ice-candidate");
        assert!(relay.call_id().is_some());
    }
}
