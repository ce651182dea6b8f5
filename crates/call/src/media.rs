//! Mikrofon-Zugriff
//!
//! Die eigentliche Geraeteanbindung liegt hinter `MediaQuelle`. Ein
//! `MediaStream` ist ein geteiltes Handle auf die Audio-Spur eines
//! Anrufversuchs; `stoppen()` ist idempotent und gibt das Geraet frei.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::CallResult;

/// Abtastrate der Aufnahme (Opus-Standard)
pub const ABTASTRATE: u32 = 48_000;
/// Samples pro Frame: 20 ms Mono bei 48 kHz
pub const FRAME_SAMPLES: usize = 960;
/// Dauer eines Frames
pub const FRAME_DAUER: Duration = Duration::from_millis(20);

/// Ein PCM-Frame (Mono, f32 normalisiert auf -1.0..1.0)
pub type AudioFrame = Arc<[f32]>;

type Freigabe = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// MediaStream
// ---------------------------------------------------------------------------

/// Handle auf einen Mikrofon-Stream
///
/// Clone teilt den Stream.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: String,
    aktiv: AtomicBool,
    stumm: AtomicBool,
    audio: Mutex<Option<broadcast::Sender<AudioFrame>>>,
    freigabe: Mutex<Option<Freigabe>>,
}

impl MediaStream {
    /// Stream ohne Audio-Daten und ohne Geraet
    pub fn neu(id: impl Into<String>) -> Self {
        Self::erstellen(id.into(), None, None)
    }

    /// Stream eines Geraets
    ///
    /// `freigabe` laeuft genau einmal beim ersten `stoppen()`.
    pub fn mit_audio(
        id: impl Into<String>,
        audio: broadcast::Sender<AudioFrame>,
        freigabe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self::erstellen(id.into(), Some(audio), Some(Box::new(freigabe)))
    }

    fn erstellen(
        id: String,
        audio: Option<broadcast::Sender<AudioFrame>>,
        freigabe: Option<Freigabe>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id,
                aktiv: AtomicBool::new(true),
                stumm: AtomicBool::new(false),
                audio: Mutex::new(audio),
                freigabe: Mutex::new(freigabe),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Gibt true zurueck solange die Audio-Spur laeuft
    pub fn ist_aktiv(&self) -> bool {
        self.inner.aktiv.load(Ordering::Acquire)
    }

    /// Abonniert die PCM-Frames des Mikrofons
    ///
    /// `None` fuer Streams ohne Geraet oder nach `stoppen()`. Der
    /// Empfaenger meldet `Closed` sobald das Geraet freigegeben ist.
    pub fn audio_abonnieren(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        self.inner.audio.lock().as_ref().map(|tx| tx.subscribe())
    }

    /// Stoppt alle Spuren und gibt das Geraet frei
    ///
    /// Gibt `true` nur beim ersten Aufruf zurueck.
    pub fn stoppen(&self) -> bool {
        let gestoppt = self.inner.aktiv.swap(false, Ordering::AcqRel);
        if gestoppt {
            self.inner.audio.lock().take();
            let freigabe = self.inner.freigabe.lock().take();
            if let Some(freigabe) = freigabe {
                freigabe();
            }
            tracing::debug!(stream = %self.inner.id, "Mikrofon freigegeben");
        }
        gestoppt
    }

    /// Schaltet die Spur stumm (enabled = false) ohne sie zu stoppen
    pub fn stumm_setzen(&self, stumm: bool) {
        self.inner.stumm.store(stumm, Ordering::Release);
    }

    pub fn ist_stumm(&self) -> bool {
        self.inner.stumm.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("aktiv", &self.ist_aktiv())
            .field("stumm", &self.ist_stumm())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MediaQuelle
// ---------------------------------------------------------------------------

/// Liefert Mikrofon-Streams
#[async_trait]
pub trait MediaQuelle: Send + Sync {
    /// Fordert das Mikrofon an (einziger awaitete Schritt eines Anrufversuchs)
    async fn mikrofon_anfordern(&self) -> CallResult<MediaStream>;
}
