//! Mikrofon-Capture via cpal
//!
//! Der cpal-Stream ist nicht `Send` und lebt deshalb in einem eigenen
//! Thread. Der Callback sammelt die Samples zu 20-ms-Frames und verteilt
//! sie per Broadcast. `MediaStream::stoppen` weckt den Thread, der den
//! Stream droppt und damit das Geraet freigibt.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, oneshot};

use crate::error::{CallError, CallResult};
use crate::media::{AudioFrame, MediaQuelle, MediaStream, ABTASTRATE, FRAME_SAMPLES};

/// Puffer in Frames (1 Sekunde)
const AUDIO_KANAL_GROESSE: usize = 50;

/// Konfiguration fuer den Mikrofon-Zugriff
#[derive(Debug, Clone)]
pub struct MikrofonKonfiguration {
    /// Geraetename; `None` = Standard-Eingabegeraet
    pub geraet: Option<String>,
    /// Abtastrate in Hz
    pub abtastrate: u32,
}

impl Default for MikrofonKonfiguration {
    fn default() -> Self {
        Self {
            geraet: None,
            abtastrate: ABTASTRATE,
        }
    }
}

/// Mikrofon des Systems
#[derive(Debug, Default)]
pub struct CpalMikrofon {
    konfig: MikrofonKonfiguration,
    zaehler: AtomicU64,
}

impl CpalMikrofon {
    pub fn neu(konfig: MikrofonKonfiguration) -> Self {
        Self {
            konfig,
            zaehler: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl MediaQuelle for CpalMikrofon {
    async fn mikrofon_anfordern(&self) -> CallResult<MediaStream> {
        let nr = self.zaehler.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("mikrofon-{nr}");

        let (audio_tx, _) = broadcast::channel(AUDIO_KANAL_GROESSE);
        let (bereit_tx, bereit_rx) = oneshot::channel::<CallResult<()>>();
        let (stopp_tx, stopp_rx) = oneshot::channel::<()>();

        let konfig = self.konfig.clone();
        let callback_tx = audio_tx.clone();
        let thread_id = id.clone();
        std::thread::Builder::new()
            .name(format!("rv-{id}"))
            .spawn(move || {
                let stream = match aufnahme_oeffnen(&konfig, callback_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = bereit_tx.send(Err(e));
                        return;
                    }
                };
                let _ = bereit_tx.send(Ok(()));
                // Blockiert bis stoppen() oder bis der MediaStream verworfen wird
                let _ = stopp_rx.blocking_recv();
                drop(stream);
                tracing::debug!(stream = %thread_id, "Capture-Stream geschlossen");
            })
            .map_err(|e| CallError::medien(format!("Capture-Thread: {e}")))?;

        bereit_rx
            .await
            .map_err(|_| CallError::medien("Capture-Thread unerwartet beendet"))??;

        Ok(MediaStream::mit_audio(id, audio_tx, move || {
            let _ = stopp_tx.send(());
        }))
    }
}

fn geraet_waehlen(konfig: &MikrofonKonfiguration) -> CallResult<Device> {
    let host = cpal::default_host();
    match &konfig.geraet {
        Some(name) => host
            .input_devices()
            .map_err(|e| CallError::medien(e.to_string()))?
            .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            .ok_or_else(|| CallError::medien(format!("Mikrofon '{name}' nicht gefunden"))),
        None => host
            .default_input_device()
            .ok_or_else(|| CallError::medien("Kein Mikrofon gefunden")),
    }
}

/// Oeffnet und startet den Capture-Stream (laeuft im Capture-Thread)
fn aufnahme_oeffnen(
    konfig: &MikrofonKonfiguration,
    audio_tx: broadcast::Sender<AudioFrame>,
) -> CallResult<Stream> {
    let geraet = geraet_waehlen(konfig)?;

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(konfig.abtastrate),
        buffer_size: cpal::BufferSize::Default,
    };

    let sample_format = geraet
        .supported_input_configs()
        .map_err(|e| CallError::medien(e.to_string()))?
        .find(|c| {
            c.min_sample_rate().0 <= konfig.abtastrate && c.max_sample_rate().0 >= konfig.abtastrate
        })
        .map(|c| c.sample_format())
        .unwrap_or(SampleFormat::F32);

    let mut sammler = FrameSammler::neu(audio_tx);
    let fehler = |e: cpal::StreamError| tracing::error!(fehler = %e, "Capture-Fehler");

    let stream = match sample_format {
        SampleFormat::F32 => geraet.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| sammler.schieben(data.iter().copied()),
            fehler,
            None,
        ),
        SampleFormat::I16 => geraet.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                sammler.schieben(data.iter().map(|&s| s as f32 / i16::MAX as f32))
            },
            fehler,
            None,
        ),
        SampleFormat::U8 => geraet.build_input_stream(
            &stream_config,
            move |data: &[u8], _: &cpal::InputCallbackInfo| {
                sammler.schieben(data.iter().map(|&s| (s as f32 - 128.0) / 128.0))
            },
            fehler,
            None,
        ),
        anderes => {
            return Err(CallError::medien(format!(
                "Nicht unterstuetztes Sample-Format: {anderes:?}"
            )))
        }
    }
    .map_err(|e| CallError::medien(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CallError::medien(e.to_string()))?;

    tracing::debug!(
        geraet = %geraet.name().unwrap_or_default(),
        abtastrate = konfig.abtastrate,
        "Capture-Stream geoeffnet"
    );
    Ok(stream)
}

/// Sammelt Samples aus dem cpal-Callback zu festen Frames
struct FrameSammler {
    puffer: Vec<f32>,
    tx: broadcast::Sender<AudioFrame>,
}

impl FrameSammler {
    fn neu(tx: broadcast::Sender<AudioFrame>) -> Self {
        Self {
            puffer: Vec::with_capacity(FRAME_SAMPLES),
            tx,
        }
    }

    fn schieben(&mut self, samples: impl Iterator<Item = f32>) {
        for sample in samples {
            self.puffer.push(sample);
            if self.puffer.len() == FRAME_SAMPLES {
                let frame: AudioFrame = self.puffer.drain(..).collect();
                // Ohne Empfaenger (noch keine Peer-Verbindung) verworfen
                let _ = self.tx.send(frame);
            }
        }
    }
}
