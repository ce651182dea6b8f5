//! Nachrichten- und Match-Persistenz
//!
//! Jede persistierte Anruf-Transition laeuft in drei Schritten:
//! 1. optimistisch in den lokalen Cache (`LokalerCache`)
//! 2. fire-and-forget an das Backend (`NachrichtenSpeicher`, eigener Task)
//! 3. per `send-message` an das Gegenueber (macht der Controller)
//!
//! `RestSpeicher` spricht das Backend ueber JSON an:
//! - `POST /messages`, `PUT /messages/{id}`
//! - `GET /matches/{id}`, `PUT /matches/{id}` (Feld `voice_call_allowed`)

use async_trait::async_trait;
use parking_lot::RwLock;
use rendezvous_core::types::{MatchId, MessageId};
use rendezvous_protocol::{ChatNachricht, NachrichtenTyp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CallError, CallResult};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Schreibt Chat-Nachrichten
#[async_trait]
pub trait NachrichtenSpeicher: Send + Sync {
    async fn nachricht_erstellen(&self, nachricht: &ChatNachricht) -> CallResult<ChatNachricht>;
    async fn nachricht_aktualisieren(&self, nachricht: &ChatNachricht)
        -> CallResult<ChatNachricht>;
}

/// Liest und setzt das Berechtigungs-Flag eines Matches
#[async_trait]
pub trait MatchSpeicher: Send + Sync {
    async fn match_abrufen(&self, match_id: MatchId) -> CallResult<MatchEintrag>;
    async fn berechtigung_setzen(&self, match_id: MatchId, erlaubt: bool) -> CallResult<()>;
}

/// Ausschnitt eines Matches, soweit fuer Anrufe relevant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEintrag {
    pub id: MatchId,
    #[serde(default)]
    pub voice_call_allowed: bool,
}

// ---------------------------------------------------------------------------
// LokalerCache
// ---------------------------------------------------------------------------

/// In-Memory Nachrichtenliste pro Match
///
/// Dient als optimistischer lokaler Speicher. Implementiert auch die
/// Speicher-Traits und kann so ein Backend ersetzen. Clone teilt den
/// Inhalt.
#[derive(Debug, Clone, Default)]
pub struct LokalerCache {
    inner: Arc<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    nachrichten: RwLock<HashMap<MatchId, Vec<ChatNachricht>>>,
    matches: RwLock<HashMap<MatchId, bool>>,
}

impl LokalerCache {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Haengt eine Nachricht an; eine bekannte ID wird ersetzt
    pub fn einfuegen(&self, nachricht: ChatNachricht) {
        let mut alle = self.inner.nachrichten.write();
        let liste = alle.entry(nachricht.match_id).or_default();
        match liste.iter_mut().find(|n| n.id == nachricht.id) {
            Some(vorhanden) => *vorhanden = nachricht,
            None => liste.push(nachricht),
        }
    }

    /// Ersetzt eine vorhandene Nachricht; `false` wenn unbekannt
    pub fn aktualisieren(&self, nachricht: ChatNachricht) -> bool {
        let mut alle = self.inner.nachrichten.write();
        let Some(liste) = alle.get_mut(&nachricht.match_id) else {
            return false;
        };
        match liste.iter_mut().find(|n| n.id == nachricht.id) {
            Some(vorhanden) => {
                *vorhanden = nachricht;
                true
            }
            None => false,
        }
    }

    /// History eines Matches in Einfuegereihenfolge
    pub fn verlauf(&self, match_id: &MatchId) -> Vec<ChatNachricht> {
        self.inner
            .nachrichten
            .read()
            .get(match_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn nachricht(&self, match_id: &MatchId, id: &MessageId) -> Option<ChatNachricht> {
        self.inner
            .nachrichten
            .read()
            .get(match_id)
            .and_then(|liste| liste.iter().find(|n| n.id == *id).cloned())
    }

    /// Anzahl der Nachrichten eines Typs in einem Match
    pub fn anzahl_typ(&self, match_id: &MatchId, typ: NachrichtenTyp) -> usize {
        self.inner
            .nachrichten
            .read()
            .get(match_id)
            .map(|liste| liste.iter().filter(|n| n.message_type == typ).count())
            .unwrap_or(0)
    }

    pub fn berechtigung(&self, match_id: &MatchId) -> bool {
        self.inner
            .matches
            .read()
            .get(match_id)
            .copied()
            .unwrap_or(false)
    }
}

#[async_trait]
impl NachrichtenSpeicher for LokalerCache {
    async fn nachricht_erstellen(&self, nachricht: &ChatNachricht) -> CallResult<ChatNachricht> {
        self.einfuegen(nachricht.clone());
        Ok(nachricht.clone())
    }

    async fn nachricht_aktualisieren(
        &self,
        nachricht: &ChatNachricht,
    ) -> CallResult<ChatNachricht> {
        if self.aktualisieren(nachricht.clone()) {
            Ok(nachricht.clone())
        } else {
            Err(CallError::speicher(format!(
                "Nachricht {} nicht gefunden",
                nachricht.id
            )))
        }
    }
}

#[async_trait]
impl MatchSpeicher for LokalerCache {
    async fn match_abrufen(&self, match_id: MatchId) -> CallResult<MatchEintrag> {
        Ok(MatchEintrag {
            id: match_id,
            voice_call_allowed: self.berechtigung(&match_id),
        })
    }

    async fn berechtigung_setzen(&self, match_id: MatchId, erlaubt: bool) -> CallResult<()> {
        self.inner.matches.write().insert(match_id, erlaubt);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RestSpeicher
// ---------------------------------------------------------------------------

/// Standard-Timeout fuer Backend-Aufrufe
const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-Client gegen das Backend
#[derive(Debug, Clone)]
pub struct RestSpeicher {
    client: reqwest::Client,
    basis_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct MatchUpdate {
    voice_call_allowed: bool,
}

impl RestSpeicher {
    /// Erstellt einen Client fuer `basis_url` (ohne abschliessenden Slash)
    pub fn neu(basis_url: impl Into<String>) -> CallResult<Self> {
        let client = reqwest::Client::builder().timeout(REST_TIMEOUT).build()?;
        Ok(Self {
            client,
            basis_url: basis_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Setzt ein Bearer-Token fuer alle Anfragen
    pub fn mit_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, pfad: &str) -> String {
        format!("{}{}", self.basis_url, pfad)
    }

    fn anfrage(&self, methode: reqwest::Method, pfad: &str) -> reqwest::RequestBuilder {
        let anfrage = self.client.request(methode, self.url(pfad));
        match &self.token {
            Some(token) => anfrage.bearer_auth(token),
            None => anfrage,
        }
    }
}

#[async_trait]
impl NachrichtenSpeicher for RestSpeicher {
    async fn nachricht_erstellen(&self, nachricht: &ChatNachricht) -> CallResult<ChatNachricht> {
        let antwort = self
            .anfrage(reqwest::Method::POST, "/messages")
            .json(nachricht)
            .send()
            .await?
            .error_for_status()?;
        Ok(antwort.json().await?)
    }

    async fn nachricht_aktualisieren(
        &self,
        nachricht: &ChatNachricht,
    ) -> CallResult<ChatNachricht> {
        let pfad = format!("/messages/{}", nachricht.id.inner());
        let antwort = self
            .anfrage(reqwest::Method::PUT, &pfad)
            .json(nachricht)
            .send()
            .await?
            .error_for_status()?;
        Ok(antwort.json().await?)
    }
}

#[async_trait]
impl MatchSpeicher for RestSpeicher {
    async fn match_abrufen(&self, match_id: MatchId) -> CallResult<MatchEintrag> {
        let pfad = format!("/matches/{}", match_id.inner());
        let antwort = self
            .anfrage(reqwest::Method::GET, &pfad)
            .send()
            .await?
            .error_for_status()?;
        Ok(antwort.json().await?)
    }

    async fn berechtigung_setzen(&self, match_id: MatchId, erlaubt: bool) -> CallResult<()> {
        let pfad = format!("/matches/{}", match_id.inner());
        self.anfrage(reqwest::Method::PUT, &pfad)
            .json(&MatchUpdate {
                voice_call_allowed: erlaubt,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persistenz
// ---------------------------------------------------------------------------

/// Buendelt lokalen Cache und Backend fuer den Controller
#[derive(Clone)]
pub struct Persistenz {
    pub lokal: LokalerCache,
    pub nachrichten: Arc<dyn NachrichtenSpeicher>,
    pub matches: Arc<dyn MatchSpeicher>,
}

impl Persistenz {
    pub fn neu(
        lokal: LokalerCache,
        nachrichten: Arc<dyn NachrichtenSpeicher>,
        matches: Arc<dyn MatchSpeicher>,
    ) -> Self {
        Self {
            lokal,
            nachrichten,
            matches,
        }
    }

    /// Lokaler Cache mit einem In-Memory-Backend
    pub fn im_speicher(backend: LokalerCache) -> Self {
        let backend = Arc::new(backend);
        Self::neu(LokalerCache::neu(), backend.clone(), backend)
    }

    /// Optimistisch lokal speichern und im Hintergrund an das Backend senden
    pub fn nachricht_erstellen(&self, nachricht: ChatNachricht) {
        self.lokal.einfuegen(nachricht.clone());
        let speicher = Arc::clone(&self.nachrichten);
        tokio::spawn(async move {
            if let Err(e) = speicher.nachricht_erstellen(&nachricht).await {
                tracing::warn!(
                    nachricht_id = %nachricht.id,
                    typ = ?nachricht.message_type,
                    fehler = %e,
                    "Nachricht konnte nicht gespeichert werden"
                );
            }
        });
    }

    /// Setzt das Match-Flag im Hintergrund
    pub fn berechtigung_setzen(&self, match_id: MatchId, erlaubt: bool) {
        let speicher = Arc::clone(&self.matches);
        tokio::spawn(async move {
            if let Err(e) = speicher.berechtigung_setzen(match_id, erlaubt).await {
                tracing::warn!(
                    match_id = %match_id,
                    erlaubt,
                    fehler = %e,
                    "Match-Berechtigung konnte nicht gesetzt werden"
                );
            }
        });
    }

    /// Fragt das Match-Flag beim Backend ab
    pub async fn berechtigung_abfragen(&self, match_id: MatchId) -> CallResult<bool> {
        Ok(self.matches.match_abrufen(match_id).await?.voice_call_allowed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
