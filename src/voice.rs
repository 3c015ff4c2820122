//! Interfaz hacia el transporte de voz (colaborador externo).
//!
//! El núcleo produce frames PCM de tamaño fijo; el socket de voz de Discord
//! vive fuera de este crate y consume los frames a su propio ritmo. La
//! contrapresión se modela con un canal acotado.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::PlayerError;

/// Frecuencia de muestreo que espera Discord
pub const SAMPLE_RATE_HZ: u32 = 48_000;
/// Canales (estéreo)
pub const CHANNELS: usize = 2;
/// Duración de cada frame
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Muestras por canal en un frame de 20ms a 48kHz
pub const SAMPLES_PER_FRAME: usize = 960;
/// Bytes por frame: 960 muestras * 2 canales * 2 bytes (s16le)
pub const FRAME_BYTES: usize = SAMPLES_PER_FRAME * CHANNELS * 2;

/// Un frame PCM s16le estéreo de 20ms listo para el codificador opus
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pcm: Bytes,
    /// Posición del frame dentro del track
    pub timestamp: Duration,
}

/// Transporte de voz: consume frames y reporta contrapresión implícita
/// (el `send_frame` espera hasta que haya capacidad).
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn send_frame(&self, frame: AudioFrame) -> Result<(), PlayerError>;
}

/// Implementación sobre un canal acotado de `flume`. El lado receptor es el
/// codificador/socket de voz del host; si lo suelta, la reproducción termina.
pub struct ChannelTransport {
    tx: flume::Sender<AudioFrame>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, flume::Receiver<AudioFrame>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl VoiceTransport for ChannelTransport {
    async fn send_frame(&self, frame: AudioFrame) -> Result<(), PlayerError> {
        self.tx
            .send_async(frame)
            .await
            .map_err(|_| PlayerError::VoiceTransportClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_size_matches_discord_expectations() {
        assert_eq!(FRAME_BYTES, 3840);
        assert_eq!(FRAME_DURATION.as_millis(), 20);
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new(4);
        drop(rx);

        let frame = AudioFrame {
            pcm: Bytes::from(vec![0u8; FRAME_BYTES]),
            timestamp: Duration::ZERO,
        };
        let err = transport.send_frame(frame).await.unwrap_err();
        assert!(matches!(err, PlayerError::VoiceTransportClosed));
    }
}
