use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PlayerError;
use crate::sources::segments::{normalize, SkipRange};
use crate::sources::ResolvedStream;
use crate::voice::{AudioFrame, VoiceTransport, FRAME_BYTES, FRAME_DURATION};

/// Control de ganancia compartido entre el player y el pipeline. El volumen
/// se ajusta en vivo sin reiniciar el stream: cada frame lee el valor
/// vigente.
#[derive(Debug)]
pub struct VolumeControl {
    base_percent: AtomicU32,
    duck_target_percent: AtomicU32,
    ducked: AtomicBool,
}

impl VolumeControl {
    pub fn new(base_percent: u8) -> Self {
        Self {
            base_percent: AtomicU32::new(base_percent as u32),
            duck_target_percent: AtomicU32::new(100),
            ducked: AtomicBool::new(false),
        }
    }

    pub fn set_percent(&self, percent: u8) {
        self.base_percent.store(percent as u32, Ordering::Relaxed);
    }

    pub fn percent(&self) -> u8 {
        self.base_percent.load(Ordering::Relaxed) as u8
    }

    /// Atenúa al objetivo de duck; solo baja, nunca sube el volumen actual
    pub fn duck(&self, target_percent: u8) {
        self.duck_target_percent
            .store(target_percent as u32, Ordering::Relaxed);
        self.ducked.store(true, Ordering::Relaxed);
    }

    pub fn clear_duck(&self) {
        self.ducked.store(false, Ordering::Relaxed);
    }

    pub fn is_ducked(&self) -> bool {
        self.ducked.load(Ordering::Relaxed)
    }

    /// Multiplicador lineal vigente para el frame actual
    pub fn gain(&self) -> f32 {
        let base = self.base_percent.load(Ordering::Relaxed);
        let effective = if self.ducked.load(Ordering::Relaxed) {
            base.min(self.duck_target_percent.load(Ordering::Relaxed))
        } else {
            base
        };
        effective as f32 / 100.0
    }
}

/// Stream decodificado listo para trocear en frames
pub struct DecodeStream {
    pub reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    /// Proceso subyacente, si el decodificador es un subproceso
    pub child: Option<tokio::process::Child>,
}

/// Frontera hacia el proceso/librería de decodificación externa. El pipeline
/// solo exige PCM s16le estéreo a 48kHz por el reader.
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn open(
        &self,
        stream: &ResolvedStream,
        start_offset: Duration,
    ) -> Result<DecodeStream, PlayerError>;
}

/// Decodificador basado en ffmpeg: recibe el archivo cacheado o la URL en
/// vivo y emite PCM crudo por stdout.
pub struct FfmpegDecoder {
    binary: String,
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
        }
    }

    /// Verifica que ffmpeg exista; se invoca al arrancar
    pub async fn verify_dependencies(&self) -> Result<(), PlayerError> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("-version")
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                info!("✅ ffmpeg disponible");
                Ok(())
            }
            _ => Err(PlayerError::provider("ffmpeg", "binario no disponible")),
        }
    }

    fn build_args(input: &str, is_network: bool, start_offset: Duration) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

        if is_network {
            // el transporte reintenta lecturas de red por debajo; el corte
            // definitivo lo decide el pipeline con sus propios reintentos
            args.extend([
                "-reconnect".into(),
                "1".into(),
                "-reconnect_streamed".into(),
                "1".into(),
                "-reconnect_delay_max".into(),
                "5".into(),
            ]);
        }

        if !start_offset.is_zero() {
            args.extend(["-ss".into(), format!("{:.3}", start_offset.as_secs_f64())]);
        }

        args.extend([
            "-i".into(),
            input.to_string(),
            "-vn".into(),
            "-f".into(),
            "s16le".into(),
            "-ar".into(),
            "48000".into(),
            "-ac".into(),
            "2".into(),
            "pipe:1".into(),
        ]);
        args
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Decoder for FfmpegDecoder {
    async fn open(
        &self,
        stream: &ResolvedStream,
        start_offset: Duration,
    ) -> Result<DecodeStream, PlayerError> {
        let input = stream.input_location();
        let is_network = stream.local_path.is_none();
        let args = Self::build_args(&input, is_network, start_offset);

        debug!("🎬 ffmpeg {}", args.join(" "));
        let mut child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            PlayerError::StreamInterrupted {
                attempts: 0,
                reason: "ffmpeg sin stdout".to_string(),
            }
        })?;

        Ok(DecodeStream {
            reader: Box::new(stdout),
            child: Some(child),
        })
    }
}

/// Parámetros de una reproducción concreta
pub struct PipelineSettings {
    pub start_offset: Duration,
    pub skip_ranges: Vec<SkipRange>,
    pub max_reconnects: u32,
    /// Posición vigente en milisegundos, publicada frame a frame
    pub position_out: Arc<AtomicU64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            start_offset: Duration::ZERO,
            skip_ranges: Vec::new(),
            max_reconnects: 3,
            position_out: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Resultado de una reproducción: terminó sola o fue cancelada
#[derive(Debug, Clone, Copy)]
pub struct PlaybackOutcome {
    pub position: Duration,
    pub finished: bool,
}

/// Convierte un stream resuelto en la secuencia continua de frames PCM que
/// consume el transporte de voz, aplicando ganancia, offset de arranque y
/// rangos de salto.
pub struct AudioPipeline {
    decoder: Arc<dyn Decoder>,
    transport: Arc<dyn VoiceTransport>,
    volume: Arc<VolumeControl>,
}

impl AudioPipeline {
    pub fn new(
        decoder: Arc<dyn Decoder>,
        transport: Arc<dyn VoiceTransport>,
        volume: Arc<VolumeControl>,
    ) -> Self {
        Self {
            decoder,
            transport,
            volume,
        }
    }

    pub async fn run(
        &self,
        stream: &ResolvedStream,
        settings: PipelineSettings,
        mut pause_rx: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Result<PlaybackOutcome, PlayerError> {
        let skip_ranges = normalize(settings.skip_ranges);
        let mut position = settings.start_offset;
        let mut attempts: u32 = 0;

        'reconnect: loop {
            let mut decode = self.decoder.open(stream, position).await?;
            let mut buf = vec![0u8; FRAME_BYTES];

            loop {
                // compuerta de pausa: posición intacta, proceso vivo
                while *pause_rx.borrow() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            Self::shutdown_child(&mut decode.child).await;
                            return Ok(PlaybackOutcome { position, finished: false });
                        }
                        changed = pause_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }

                let n = tokio::select! {
                    _ = cancel.cancelled() => {
                        Self::shutdown_child(&mut decode.child).await;
                        return Ok(PlaybackOutcome { position, finished: false });
                    }
                    read = read_full(&mut decode.reader, &mut buf) => read?,
                };

                if n > 0 {
                    if n < FRAME_BYTES {
                        buf[n..].fill(0);
                    }
                    let timestamp = position;
                    position += FRAME_DURATION;
                    settings
                        .position_out
                        .store(position.as_millis() as u64, Ordering::Relaxed);

                    // descartar frames dentro de un rango de salto; la
                    // posición sigue avanzando
                    if !skip_ranges.iter().any(|r| r.contains(timestamp)) {
                        apply_gain(&mut buf, self.volume.gain());
                        let frame = AudioFrame {
                            pcm: Bytes::copy_from_slice(&buf),
                            timestamp,
                        };
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                Self::shutdown_child(&mut decode.child).await;
                                return Ok(PlaybackOutcome { position, finished: false });
                            }
                            sent = self.transport.send_frame(frame) => sent?,
                        }
                    }
                }

                if n == FRAME_BYTES {
                    continue;
                }

                // stream agotado: ¿fin limpio o corte?
                let status = match decode.child.as_mut() {
                    Some(child) => {
                        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                            Ok(Ok(status)) => Some(status),
                            _ => None,
                        }
                    }
                    None => return Ok(PlaybackOutcome { position, finished: true }),
                };

                if status.map(|s| s.success()).unwrap_or(false) {
                    debug!("🏁 Decodificación completada en {:?}", position);
                    return Ok(PlaybackOutcome { position, finished: true });
                }

                let reason = format!("decodificador terminó mal en {:?} ({:?})", position, status);
                if stream.local_path.is_none() && attempts < settings.max_reconnects {
                    attempts += 1;
                    warn!(
                        "🔄 Corte de stream, reintento {}/{}: {}",
                        attempts, settings.max_reconnects, reason
                    );
                    continue 'reconnect;
                }
                return Err(PlayerError::StreamInterrupted { attempts, reason });
            }
        }
    }

    /// Mata el subproceso y espera su salida un tiempo acotado
    async fn shutdown_child(child: &mut Option<tokio::process::Child>) {
        if let Some(child) = child.as_mut() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }
    }
}

/// Lee hasta llenar `buf`; devuelve los bytes leídos (menos que el buffer
/// solo en fin de stream).
async fn read_full<R: tokio::io::AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize, PlayerError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Ganancia lineal sobre muestras s16le intercaladas, con saturación
fn apply_gain(pcm: &mut [u8], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in pcm.chunks_exact_mut(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]);
        let scaled = (value as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        sample.copy_from_slice(&scaled.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::ChannelTransport;
    use pretty_assertions::assert_eq;

    fn resolved_local(duration: Option<Duration>) -> ResolvedStream {
        ResolvedStream {
            source_track_id: "vid".to_string(),
            stream_url: "https://cdn.example/a".to_string(),
            local_path: Some("/tmp/cacheado.webm".into()),
            format_id: "251".to_string(),
            container: "webm".to_string(),
            audio_codec: Some("opus".to_string()),
            sample_rate_hz: Some(48_000),
            bitrate_bps: Some(128_000),
            is_live: false,
            duration,
            provider: "test",
            title: "t".to_string(),
            author: None,
        }
    }

    /// Decodificador en memoria: N frames de valor constante, sin proceso
    struct StaticDecoder {
        frames: usize,
        sample: i16,
    }

    #[async_trait]
    impl Decoder for StaticDecoder {
        async fn open(
            &self,
            _stream: &ResolvedStream,
            _start_offset: Duration,
        ) -> Result<DecodeStream, PlayerError> {
            let mut pcm = Vec::with_capacity(self.frames * FRAME_BYTES);
            for _ in 0..(self.frames * FRAME_BYTES / 2) {
                pcm.extend_from_slice(&self.sample.to_le_bytes());
            }
            Ok(DecodeStream {
                reader: Box::new(std::io::Cursor::new(pcm)),
                child: None,
            })
        }
    }

    fn pipeline(
        decoder: StaticDecoder,
        volume: u8,
    ) -> (AudioPipeline, flume::Receiver<AudioFrame>, Arc<VolumeControl>) {
        let (transport, rx) = ChannelTransport::new(1024);
        let volume = Arc::new(VolumeControl::new(volume));
        let pipeline = AudioPipeline::new(
            Arc::new(decoder),
            Arc::new(transport),
            volume.clone(),
        );
        (pipeline, rx, volume)
    }

    fn unpaused() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[test]
    fn ffmpeg_args_for_cached_file() {
        let args = FfmpegDecoder::build_args("/cache/abc", false, Duration::ZERO);
        assert!(!args.contains(&"-reconnect".to_string()));
        assert!(!args.contains(&"-ss".to_string()));
        assert!(args.windows(2).any(|w| w == ["-i", "/cache/abc"]));
        assert!(args.windows(2).any(|w| w == ["-ar", "48000"]));
    }

    #[test]
    fn ffmpeg_args_for_network_stream_with_offset() {
        let args =
            FfmpegDecoder::build_args("https://cdn/x", true, Duration::from_secs(30));
        assert!(args.windows(2).any(|w| w == ["-reconnect", "1"]));
        assert!(args.windows(2).any(|w| w == ["-ss", "30.000"]));
        // -ss antes de -i: seek rápido por demuxer
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
    }

    #[test]
    fn gain_scales_and_saturates() {
        let mut half = 10_000i16.to_le_bytes().to_vec();
        apply_gain(&mut half, 0.5);
        assert_eq!(i16::from_le_bytes([half[0], half[1]]), 5_000);

        let mut max = 30_000i16.to_le_bytes().to_vec();
        apply_gain(&mut max, 2.0);
        assert_eq!(i16::from_le_bytes([max[0], max[1]]), i16::MAX);

        let mut unchanged = 1234i16.to_le_bytes().to_vec();
        apply_gain(&mut unchanged, 1.0);
        assert_eq!(i16::from_le_bytes([unchanged[0], unchanged[1]]), 1234);
    }

    #[test]
    fn duck_only_lowers_volume() {
        let volume = VolumeControl::new(50);
        volume.duck(70);
        assert_eq!(volume.gain(), 0.5, "duck por encima del base no sube");
        volume.set_percent(100);
        assert_eq!(volume.gain(), 0.7);
        volume.clear_duck();
        assert_eq!(volume.gain(), 1.0);
    }

    #[tokio::test]
    async fn emits_every_frame_with_advancing_timestamps() {
        let (pipeline, rx, _volume) = pipeline(StaticDecoder { frames: 5, sample: 1000 }, 100);
        let outcome = pipeline
            .run(
                &resolved_local(Some(Duration::from_secs(1))),
                PipelineSettings::default(),
                unpaused(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.finished);
        assert_eq!(outcome.position, FRAME_DURATION * 5);

        let frames: Vec<AudioFrame> = rx.drain().collect();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].timestamp, Duration::ZERO);
        assert_eq!(frames[4].timestamp, FRAME_DURATION * 4);
    }

    #[tokio::test]
    async fn skip_ranges_drop_frames_but_advance_position() {
        let (pipeline, rx, _volume) = pipeline(StaticDecoder { frames: 10, sample: 1000 }, 100);
        let settings = PipelineSettings {
            // salta del frame 2 (40ms) al 5 (100ms)
            skip_ranges: vec![SkipRange::new(0.040, 0.100)],
            ..Default::default()
        };
        let outcome = pipeline
            .run(
                &resolved_local(None),
                settings,
                unpaused(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.position, FRAME_DURATION * 10);
        let frames: Vec<AudioFrame> = rx.drain().collect();
        assert_eq!(frames.len(), 7);
        let timestamps: Vec<u64> = frames.iter().map(|f| f.timestamp.as_millis() as u64).collect();
        assert_eq!(timestamps, vec![0, 20, 100, 120, 140, 160, 180]);
    }

    #[tokio::test]
    async fn volume_applies_to_emitted_pcm() {
        let (pipeline, rx, _volume) = pipeline(StaticDecoder { frames: 1, sample: 10_000 }, 50);
        pipeline
            .run(
                &resolved_local(None),
                PipelineSettings::default(),
                unpaused(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let frame = rx.recv().unwrap();
        let first = i16::from_le_bytes([frame.pcm[0], frame.pcm[1]]);
        assert_eq!(first, 5_000);
    }

    #[tokio::test]
    async fn cancellation_stops_promptly_without_error() {
        // lector infinito de silencio
        struct EndlessDecoder;

        #[async_trait]
        impl Decoder for EndlessDecoder {
            async fn open(
                &self,
                _stream: &ResolvedStream,
                _start_offset: Duration,
            ) -> Result<DecodeStream, PlayerError> {
                Ok(DecodeStream {
                    reader: Box::new(tokio::io::repeat(0u8)),
                    child: None,
                })
            }
        }

        let (transport, rx) = ChannelTransport::new(8);
        let pipeline = AudioPipeline::new(
            Arc::new(EndlessDecoder),
            Arc::new(transport),
            Arc::new(VolumeControl::new(100)),
        );
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        // drenar en segundo plano para que haya avance
        tokio::spawn(async move {
            while rx.recv_async().await.is_ok() {}
        });

        let stream = resolved_local(None);
        let handle = tokio::spawn(async move {
            pipeline
                .run(&stream, PipelineSettings::default(), unpaused(), cancel_clone)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("la cancelación debe ser acotada")
            .unwrap()
            .unwrap();
        assert!(!outcome.finished);
    }

    #[tokio::test]
    async fn pause_gate_holds_frames_and_preserves_position() {
        let (pipeline, rx, _volume) = pipeline(StaticDecoder { frames: 4, sample: 100 }, 100);
        let (pause_tx, pause_rx) = watch::channel(true);

        let stream = resolved_local(None);
        let handle = tokio::spawn(async move {
            pipeline
                .run(&stream, PipelineSettings::default(), pause_rx, CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.is_empty(), "en pausa no deben salir frames");

        pause_tx.send_replace(false);
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(outcome.finished);
        assert_eq!(rx.drain().count(), 4);
    }
}
