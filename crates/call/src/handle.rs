//! Handle auf einen laufenden Anruf-Controller
//!
//! Alle Aktionen werden als Befehl an den Controller-Task geschickt und
//! dort nacheinander ausgefuehrt. Der Zustand ist ueber einen
//! `watch`-Kanal lesbar, Ereignisse ueber einen Broadcast-Kanal.

use rendezvous_core::types::{CallId, MatchId, UserId};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::{CallError, CallResult};
use crate::ereignis::CallEreignis;
use crate::state::{CallStatus, CallZustand};

type Antwort<T> = oneshot::Sender<CallResult<T>>;

/// Befehle an den Controller-Task
pub(crate) enum CallBefehl {
    Anrufen {
        gegenueber: UserId,
        match_id: MatchId,
        antwort: Antwort<CallId>,
    },
    BerechtigungBeantworten {
        erlauben: bool,
        antwort: Antwort<()>,
    },
    Annehmen {
        antwort: Antwort<()>,
    },
    Ablehnen {
        antwort: Antwort<()>,
    },
    Auflegen {
        antwort: Antwort<()>,
    },
    StummSchalten {
        stumm: bool,
        antwort: Antwort<()>,
    },
    Minimieren {
        minimiert: bool,
        antwort: Antwort<()>,
    },
    Beenden {
        fertig: oneshot::Sender<()>,
    },
}

/// Handle auf den Anruf-Controller einer Sitzung
///
/// Clone teilt den Controller.
#[derive(Clone)]
pub struct CallHandle {
    pub(crate) befehl_tx: mpsc::Sender<CallBefehl>,
    pub(crate) zustand_rx: watch::Receiver<CallZustand>,
    pub(crate) ereignis_tx: broadcast::Sender<CallEreignis>,
}

impl CallHandle {
    async fn anfrage<T>(
        &self,
        befehl: impl FnOnce(Antwort<T>) -> CallBefehl,
    ) -> CallResult<T> {
        let (tx, rx) = oneshot::channel();
        self.befehl_tx
            .send(befehl(tx))
            .await
            .map_err(|_| CallError::ControllerBeendet)?;
        rx.await.map_err(|_| CallError::ControllerBeendet)?
    }

    /// Startet einen Anruf
    ///
    /// Ohne Berechtigung wird zuerst beim Gegenueber angefragt.
    pub async fn anrufen(&self, gegenueber: UserId, match_id: MatchId) -> CallResult<CallId> {
        self.anfrage(|antwort| CallBefehl::Anrufen {
            gegenueber,
            match_id,
            antwort,
        })
        .await
    }

    /// Erlaubt die Anfrage des Gegenuebers
    pub async fn berechtigung_erteilen(&self) -> CallResult<()> {
        self.anfrage(|antwort| CallBefehl::BerechtigungBeantworten {
            erlauben: true,
            antwort,
        })
        .await
    }

    /// Lehnt die Anfrage des Gegenuebers ab
    pub async fn berechtigung_verweigern(&self) -> CallResult<()> {
        self.anfrage(|antwort| CallBefehl::BerechtigungBeantworten {
            erlauben: false,
            antwort,
        })
        .await
    }

    /// Nimmt einen klingelnden Anruf an
    pub async fn annehmen(&self) -> CallResult<()> {
        self.anfrage(|antwort| CallBefehl::Annehmen { antwort }).await
    }

    /// Lehnt einen klingelnden Anruf oder eine Anfrage ab
    pub async fn ablehnen(&self) -> CallResult<()> {
        self.anfrage(|antwort| CallBefehl::Ablehnen { antwort }).await
    }

    /// Legt auf (oder bricht einen noch nicht angenommenen Anruf ab)
    pub async fn auflegen(&self) -> CallResult<()> {
        self.anfrage(|antwort| CallBefehl::Auflegen { antwort }).await
    }

    pub async fn stumm_schalten(&self, stumm: bool) -> CallResult<()> {
        self.anfrage(|antwort| CallBefehl::StummSchalten { stumm, antwort })
            .await
    }

    pub async fn minimieren(&self, minimiert: bool) -> CallResult<()> {
        self.anfrage(|antwort| CallBefehl::Minimieren { minimiert, antwort })
            .await
    }

    /// Aktueller Zustand
    pub fn zustand(&self) -> CallZustand {
        self.zustand_rx.borrow().clone()
    }

    pub fn zustand_abonnieren(&self) -> watch::Receiver<CallZustand> {
        self.zustand_rx.clone()
    }

    pub fn ereignisse_abonnieren(&self) -> broadcast::Receiver<CallEreignis> {
        self.ereignis_tx.subscribe()
    }

    /// Wartet bis der Controller den gewuenschten Status meldet
    pub async fn status_abwarten(
        &self,
        status: CallStatus,
        frist: Duration,
    ) -> CallResult<CallZustand> {
        let mut rx = self.zustand_rx.clone();
        let zustand = tokio::time::timeout(frist, rx.wait_for(|z| z.status == status))
            .await
            .map_err(|_| CallError::Zeitlimit)?
            .map_err(|_| CallError::ControllerBeendet)?;
        Ok(zustand.clone())
    }

    /// Beendet den Controller (Abmeldung)
    ///
    /// Ein laufender Anruf wird dabei sauber beendet.
    pub async fn beenden(&self) {
        let (fertig, rx) = oneshot::channel();
        if self
            .befehl_tx
            .send(CallBefehl::Beenden { fertig })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}
