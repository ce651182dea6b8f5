//! Wire-Format fuer die Relay-Verbindung
//!
//! Frame-basiertes Protokoll: Length(u32 big-endian) + JSON-Payload.
//!
//! ## Frame-Format
//!
//! ```text
//! +--------+--------+--------+--------+----...----+
//! | Laenge (u32 BE) | 4 Bytes        | Payload    |
//! +--------+--------+--------+--------+----...----+
//! ```
//!
//! Der Codec ist generisch ueber die eingehende Richtung: der Relay
//! dekodiert `ClientSignal` und kodiert `RelaySignal`, der Client umgekehrt.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Standard-maximale Frame-Groesse (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Groesse des Laengen-Felds in Bytes
pub const LENGTH_FIELD_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// tokio-util Codec fuer die Relay-Verbindung
///
/// `D` ist der Typ der eingehenden Frames. Kodiert wird jeder `Serialize`-Typ.
///
/// ```rust,no_run
/// use tokio_util::codec::Framed;
/// use rendezvous_protocol::{wire::FrameCodec, RelaySignal};
///
/// // let stream = TcpStream::connect(...).await?;
/// // let framed = Framed::new(stream, FrameCodec::<RelaySignal>::new());
/// ```
#[derive(Debug)]
pub struct FrameCodec<D> {
    /// Maximale erlaubte Frame-Groesse in Bytes
    max_frame_size: usize,
    _eingang: PhantomData<fn() -> D>,
}

impl<D> FrameCodec<D> {
    /// Erstellt einen neuen `FrameCodec` mit Standard-Limits
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Erstellt einen `FrameCodec` mit benutzerdefinierter maximaler Frame-Groesse
    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            _eingang: PhantomData,
        }
    }

    /// Gibt die konfigurierte maximale Frame-Groesse zurueck
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl<D> Clone for FrameCodec<D> {
    fn clone(&self) -> Self {
        Self::with_max_size(self.max_frame_size)
    }
}

impl<D> Default for FrameCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

fn zu_gross(laenge: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Frame zu gross: {} Bytes (Maximum: {} Bytes)", laenge, max),
    )
}

fn kodieren<E: Serialize>(item: &E, max: usize) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec(item).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON-Serialisierung fehlgeschlagen: {}", e),
        )
    })?;
    if json.len() > max {
        return Err(zu_gross(json.len(), max));
    }
    Ok(json)
}

fn dekodieren<D: DeserializeOwned>(payload: &[u8]) -> io::Result<D> {
    serde_json::from_slice(payload).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON-Deserialisierung fehlgeschlagen: {}", e),
        )
    })
}

// ---------------------------------------------------------------------------
// Decoder / Encoder
// ---------------------------------------------------------------------------

impl<D: DeserializeOwned> Decoder for FrameCodec<D> {
    type Item = D;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Warte auf mindestens 4 Bytes fuer das Laengen-Feld
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(zu_gross(length, self.max_frame_size));
        }

        let total_size = LENGTH_FIELD_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let payload = src.split_to(length);
        dekodieren(&payload).map(Some)
    }
}

impl<D, E: Serialize> Encoder<E> for FrameCodec<D> {
    type Error = io::Error;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = kodieren(&item, self.max_frame_size)?;
        dst.reserve(LENGTH_FIELD_SIZE + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
