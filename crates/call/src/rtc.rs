//! WebRTC-Engine via webrtc-rs
//!
//! Eine `RTCPeerConnection` pro Anrufversuch, konfiguriert mit genau einem
//! STUN-Server. Das Mikrofon wird mit Opus kodiert und ueber eine lokale
//! Spur gesendet; die Opus-Pakete des Gegenuebers werden per Broadcast
//! an die Wiedergabe weitergereicht.
//!
//! Die Verhandlung laeuft in einem eigenen Task, der die Befehle des
//! Controllers der Reihe nach abarbeitet. Lokale ICE-Kandidaten werden
//! erst nach der lokalen Beschreibung gemeldet.

use async_trait::async_trait;
use audiopus::coder::Encoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use parking_lot::Mutex;
use rendezvous_protocol::signal::SdpTyp;
use rendezvous_protocol::{IceKandidat, SitzungsBeschreibung};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{CallError, CallResult};
use crate::media::{MediaStream, ABTASTRATE, FRAME_DAUER, FRAME_SAMPLES};
use crate::peer::{
    remote_beschreibung_pruefen, PeerEreignis, PeerEreignisSender, PeerFabrik, PeerKonfiguration,
    PeerRolle, PeerVerbindung,
};

/// Sprach-Bitrate fuer Opus
const OPUS_BITRATE: i32 = 32_000;
/// Maximale Groesse eines Opus-Pakets
const MAX_PAKET_BYTES: usize = 4000;
/// Puffer fuer empfangene Pakete
const REMOTE_KANAL_GROESSE: usize = 100;

/// Opus-Paket des Gegenuebers
#[derive(Debug, Clone)]
pub struct RemotePaket {
    pub stream_id: String,
    pub opus: Bytes,
}

fn peer_fehler(e: webrtc::Error) -> CallError {
    CallError::peer(e.to_string())
}

// ---------------------------------------------------------------------------
// Fabrik
// ---------------------------------------------------------------------------

/// Erzeugt echte WebRTC-Verbindungen
#[derive(Debug)]
pub struct WebRtcPeerFabrik {
    remote_tx: broadcast::Sender<RemotePaket>,
}

impl Default for WebRtcPeerFabrik {
    fn default() -> Self {
        Self::neu()
    }
}

impl WebRtcPeerFabrik {
    pub fn neu() -> Self {
        let (remote_tx, _) = broadcast::channel(REMOTE_KANAL_GROESSE);
        Self { remote_tx }
    }

    /// Abonniert die Opus-Pakete aller Verbindungen dieser Fabrik
    pub fn remote_audio_abonnieren(&self) -> broadcast::Receiver<RemotePaket> {
        self.remote_tx.subscribe()
    }

    async fn verbindung_oeffnen(stun_server: &str) -> CallResult<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(peer_fehler)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(peer_fehler)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![stun_server.to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        api.new_peer_connection(config).await.map_err(peer_fehler)
    }
}

#[async_trait]
impl PeerFabrik for WebRtcPeerFabrik {
    async fn erstellen(
        &self,
        konfig: PeerKonfiguration,
        stream: MediaStream,
        ereignisse: PeerEreignisSender,
    ) -> CallResult<Box<dyn PeerVerbindung>> {
        let pc = Arc::new(Self::verbindung_oeffnen(&konfig.stun_server).await?);
        let tor = Arc::new(KandidatenTor::neu(ereignisse.clone()));

        let tor_ice = Arc::clone(&tor);
        pc.on_ice_candidate(Box::new(move |kandidat: Option<RTCIceCandidate>| {
            if let Some(kandidat) = kandidat {
                match kandidat.to_json() {
                    Ok(init) => tor_ice.kandidat(IceKandidat {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(e) => tracing::warn!(fehler = %e, "ICE-Kandidat nicht serialisierbar"),
                }
            }
            Box::pin(async {})
        }));

        let status_tx = ereignisse.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::debug!(versuch = status_tx.versuch(), status = %s, "Peer-Status");
            match s {
                RTCPeerConnectionState::Connected => {
                    status_tx.senden(PeerEreignis::Verbunden);
                }
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    status_tx.senden(PeerEreignis::Geschlossen);
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        let track_tx = ereignisse.clone();
        let remote_tx = self.remote_tx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let stream_id = track.stream_id();
            track_tx.senden(PeerEreignis::RemoteStream {
                stream_id: stream_id.clone(),
            });
            let remote_tx = remote_tx.clone();
            Box::pin(async move {
                while let Ok((paket, _)) = track.read_rtp().await {
                    if paket.payload.is_empty() {
                        continue;
                    }
                    // Ohne Wiedergabe verworfen
                    let _ = remote_tx.send(RemotePaket {
                        stream_id: stream_id.clone(),
                        opus: paket.payload,
                    });
                }
                tracing::debug!(stream = %stream_id, "Remote-Spur beendet");
            })
        }));

        let spur = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: ABTASTRATE,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            stream.id().to_owned(),
        ));
        pc.add_track(Arc::clone(&spur) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(peer_fehler)?;
        tokio::spawn(audio_senden(spur, stream));

        let (befehl_tx, befehl_rx) = mpsc::unbounded_channel();
        tokio::spawn(befehle_ausfuehren(
            pc,
            konfig.rolle,
            befehl_rx,
            ereignisse.clone(),
            tor,
        ));

        tracing::debug!(
            versuch = ereignisse.versuch(),
            rolle = ?konfig.rolle,
            stun = %konfig.stun_server,
            "Peer-Verbindung erstellt"
        );

        Ok(Box::new(WebRtcPeer {
            befehl_tx: Some(befehl_tx),
            rolle: konfig.rolle,
            remote_gesetzt: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Verbindung
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum PeerBefehl {
    RemoteBeschreibung(SitzungsBeschreibung),
    Kandidat(IceKandidat),
}

/// Handle des Controllers auf eine WebRTC-Verbindung
///
/// Die Aufrufe sind synchron und werden an den Verhandlungs-Task
/// weitergereicht. Nach `schliessen` schliesst der Task die Verbindung.
#[derive(Debug)]
struct WebRtcPeer {
    befehl_tx: Option<mpsc::UnboundedSender<PeerBefehl>>,
    rolle: PeerRolle,
    remote_gesetzt: bool,
}

impl WebRtcPeer {
    fn befehl(&self, befehl: PeerBefehl) -> CallResult<()> {
        let tx = self
            .befehl_tx
            .as_ref()
            .ok_or_else(|| CallError::peer("Verbindung ist geschlossen"))?;
        tx.send(befehl)
            .map_err(|_| CallError::peer("Verhandlung abgebrochen"))
    }
}

impl PeerVerbindung for WebRtcPeer {
    fn remote_beschreibung_setzen(&mut self, beschreibung: SitzungsBeschreibung) -> CallResult<()> {
        remote_beschreibung_pruefen(self.rolle, beschreibung.typ, self.remote_gesetzt)?;
        self.befehl(PeerBefehl::RemoteBeschreibung(beschreibung))?;
        self.remote_gesetzt = true;
        Ok(())
    }

    fn ice_kandidat_hinzufuegen(&mut self, kandidat: IceKandidat) -> CallResult<()> {
        self.befehl(PeerBefehl::Kandidat(kandidat))
    }

    fn schliessen(&mut self) {
        self.befehl_tx.take();
    }
}

/// Verhandlungs-Task: laeuft bis der Controller die Verbindung schliesst
async fn befehle_ausfuehren(
    pc: Arc<RTCPeerConnection>,
    rolle: PeerRolle,
    mut befehle: mpsc::UnboundedReceiver<PeerBefehl>,
    ereignisse: PeerEreignisSender,
    tor: Arc<KandidatenTor>,
) {
    if let Err(e) = verhandeln(&pc, rolle, &mut befehle, &tor).await {
        tracing::warn!(versuch = ereignisse.versuch(), fehler = %e, "Verhandlung fehlgeschlagen");
        ereignisse.senden(PeerEreignis::Geschlossen);
    }
    if let Err(e) = pc.close().await {
        tracing::debug!(fehler = %e, "Schliessen der Peer-Verbindung");
    }
}

async fn verhandeln(
    pc: &RTCPeerConnection,
    rolle: PeerRolle,
    befehle: &mut mpsc::UnboundedReceiver<PeerBefehl>,
    tor: &KandidatenTor,
) -> CallResult<()> {
    if rolle == PeerRolle::Initiator {
        let offer = pc.create_offer(None).await.map_err(peer_fehler)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(peer_fehler)?;
        tor.oeffnen(SitzungsBeschreibung::offer(offer.sdp));
    }

    while let Some(befehl) = befehle.recv().await {
        match befehl {
            PeerBefehl::RemoteBeschreibung(beschreibung) => {
                let remote = match beschreibung.typ {
                    SdpTyp::Offer => RTCSessionDescription::offer(beschreibung.sdp),
                    SdpTyp::Answer => RTCSessionDescription::answer(beschreibung.sdp),
                }
                .map_err(peer_fehler)?;
                pc.set_remote_description(remote)
                    .await
                    .map_err(peer_fehler)?;

                if rolle == PeerRolle::Responder {
                    let answer = pc.create_answer(None).await.map_err(peer_fehler)?;
                    pc.set_local_description(answer.clone())
                        .await
                        .map_err(peer_fehler)?;
                    tor.oeffnen(SitzungsBeschreibung::answer(answer.sdp));
                }
            }
            PeerBefehl::Kandidat(kandidat) => {
                pc.add_ice_candidate(RTCIceCandidateInit {
                    candidate: kandidat.candidate,
                    sdp_mid: kandidat.sdp_mid,
                    sdp_mline_index: kandidat.sdp_mline_index,
                    username_fragment: None,
                })
                .await
                .map_err(peer_fehler)?;
            }
        }
    }
    Ok(())
}

/// Kodiert das Mikrofon mit Opus und schreibt es auf die lokale Spur
///
/// Endet sobald das Mikrofon freigegeben wird. Stummgeschaltet wird
/// Stille gesendet.
async fn audio_senden(spur: Arc<TrackLocalStaticSample>, stream: MediaStream) {
    let Some(mut audio) = stream.audio_abonnieren() else {
        tracing::debug!(stream = %stream.id(), "Stream ohne Audio, Spur bleibt leer");
        return;
    };

    let mut encoder = match Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip) {
        Ok(encoder) => encoder,
        Err(e) => {
            tracing::error!(fehler = %e, "Opus-Encoder nicht verfuegbar");
            return;
        }
    };
    if let Err(e) = encoder.set_bitrate(Bitrate::BitsPerSecond(OPUS_BITRATE)) {
        tracing::warn!(fehler = %e, "Opus-Bitrate nicht gesetzt");
    }

    let stille = vec![0.0f32; FRAME_SAMPLES];
    let mut paket = vec![0u8; MAX_PAKET_BYTES];
    loop {
        let frame = match audio.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(verloren = n, "Audio-Frames uebersprungen");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let pcm: &[f32] = if stream.ist_stumm() { &stille } else { &frame };
        let laenge = match encoder.encode_float(pcm, &mut paket) {
            Ok(laenge) => laenge,
            Err(e) => {
                tracing::warn!(fehler = %e, "Opus-Kodierung fehlgeschlagen");
                continue;
            }
        };
        let sample = Sample {
            data: Bytes::copy_from_slice(&paket[..laenge]),
            duration: FRAME_DAUER,
            ..Default::default()
        };
        if let Err(e) = spur.write_sample(&sample).await {
            tracing::debug!(fehler = %e, "Audio-Sample verworfen");
        }
    }
    tracing::debug!(stream = %stream.id(), "Audio-Spur beendet");
}

// ---------------------------------------------------------------------------
// Kandidaten-Reihenfolge
// ---------------------------------------------------------------------------

/// Haelt lokale ICE-Kandidaten zurueck bis die lokale Beschreibung
/// gemeldet ist
#[derive(Debug)]
struct KandidatenTor {
    ereignisse: PeerEreignisSender,
    zustand: Mutex<TorZustand>,
}

#[derive(Debug, Default)]
struct TorZustand {
    offen: bool,
    wartend: Vec<IceKandidat>,
}

impl KandidatenTor {
    fn neu(ereignisse: PeerEreignisSender) -> Self {
        Self {
            ereignisse,
            zustand: Mutex::new(TorZustand::default()),
        }
    }

    fn kandidat(&self, kandidat: IceKandidat) {
        let mut zustand = self.zustand.lock();
        if zustand.offen {
            self.ereignisse.senden(PeerEreignis::IceKandidat(kandidat));
        } else {
            zustand.wartend.push(kandidat);
        }
    }

    /// Meldet die lokale Beschreibung und danach alle wartenden Kandidaten
    fn oeffnen(&self, beschreibung: SitzungsBeschreibung) {
        let mut zustand = self.zustand.lock();
        self.ereignisse
            .senden(PeerEreignis::LokaleBeschreibung(beschreibung));
        for kandidat in zustand.wartend.drain(..) {
            self.ereignisse.senden(PeerEreignis::IceKandidat(kandidat));
        }
        zustand.offen = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn kandidat(nr: u32) -> IceKandidat {
        IceKandidat {
            candidate: format!("candidate:{nr} 1 udp 2122260223 10.0.0.2 5000{nr} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn konfig(rolle: PeerRolle) -> PeerKonfiguration {
        PeerKonfiguration {
            rolle,
            stun_server: crate::config::STANDARD_STUN_SERVER.to_string(),
        }
    }

    async fn naechste_beschreibung(
        rx: &mut mpsc::UnboundedReceiver<(u64, PeerEreignis)>,
    ) -> SitzungsBeschreibung {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some((_, PeerEreignis::LokaleBeschreibung(b))) => return b,
                    Some(_) => continue,
                    None => panic!("Ereigniskanal geschlossen"),
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn kandidaten_folgen_der_beschreibung() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tor = KandidatenTor::neu(PeerEreignisSender::neu(1, tx));

        tor.kandidat(kandidat(1));
        tor.kandidat(kandidat(2));
        assert!(rx.try_recv().is_err());

        tor.oeffnen(SitzungsBeschreibung::offer("v=0"));
        tor.kandidat(kandidat(3));

        assert!(matches!(
            rx.recv().await,
            Some((1, PeerEreignis::LokaleBeschreibung(_)))
        ));
        for nr in 1..=3 {
            assert_eq!(
                rx.recv().await,
                Some((1, PeerEreignis::IceKandidat(kandidat(nr))))
            );
        }
    }

    #[tokio::test]
    async fn initiator_und_responder_verhandeln_opus() {
        let fabrik = WebRtcPeerFabrik::neu();

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let mut anrufer = fabrik
            .erstellen(
                konfig(PeerRolle::Initiator),
                MediaStream::neu("a"),
                PeerEreignisSender::neu(1, a_tx),
            )
            .await
            .unwrap();
        let offer = naechste_beschreibung(&mut a_rx).await;
        assert_eq!(offer.typ, SdpTyp::Offer);
        assert!(offer.sdp.to_lowercase().contains("opus"));

        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let mut angerufener = fabrik
            .erstellen(
                konfig(PeerRolle::Responder),
                MediaStream::neu("b"),
                PeerEreignisSender::neu(2, b_tx),
            )
            .await
            .unwrap();
        angerufener.remote_beschreibung_setzen(offer).unwrap();
        let answer = naechste_beschreibung(&mut b_rx).await;
        assert_eq!(answer.typ, SdpTyp::Answer);
        assert!(answer.sdp.to_lowercase().contains("opus"));

        anrufer.remote_beschreibung_setzen(answer).unwrap();
        anrufer.schliessen();
        angerufener.schliessen();
    }

    #[tokio::test]
    async fn falsche_beschreibung_wird_abgewiesen() {
        let fabrik = WebRtcPeerFabrik::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut peer = fabrik
            .erstellen(
                konfig(PeerRolle::Responder),
                MediaStream::neu("c"),
                PeerEreignisSender::neu(3, tx),
            )
            .await
            .unwrap();

        let err = peer
            .remote_beschreibung_setzen(SitzungsBeschreibung::answer("v=0"))
            .unwrap_err();
        assert!(matches!(err, CallError::Peer(_)));

        peer.schliessen();
        peer.schliessen();
        assert!(peer.ice_kandidat_hinzufuegen(kandidat(1)).is_err());
    }
}
