use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{FormatDescriptor, MetadataProvider, TrackInfo, TrackReference};
use crate::error::PlayerError;

/// Proveedor respaldado por el CLI `yt-dlp`. Funciona también como ruta de
/// búsqueda: una referencia que no es URL se resuelve vía `ytsearch1:`.
pub struct YtDlpProvider {
    binary: String,
}

#[derive(Debug, Deserialize)]
struct YtDlpDump {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    is_live: bool,
    formats: Option<Vec<YtDlpFormat>>,
    /// Presente cuando el dump es un resultado de búsqueda/playlist
    entries: Option<Vec<YtDlpDump>>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: Option<String>,
    url: Option<String>,
    ext: Option<String>,
    acodec: Option<String>,
    vcodec: Option<String>,
    /// kbps
    abr: Option<f64>,
    /// kbps
    tbr: Option<f64>,
    asr: Option<u32>,
}

impl YtDlpProvider {
    pub fn new() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Verifica que el binario exista y responda; se invoca al arrancar
    pub async fn verify_dependencies(&self) -> Result<(), PlayerError> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("--version")
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                let version = String::from_utf8_lossy(&out.stdout);
                info!("✅ yt-dlp versión: {}", version.trim());
                Ok(())
            }
            _ => {
                error!("❌ yt-dlp no está instalado o no está en PATH");
                Err(PlayerError::provider("yt-dlp", "binario no disponible"))
            }
        }
    }

    async fn dump_json(&self, target: &str) -> Result<YtDlpDump, PlayerError> {
        let output = tokio::process::Command::new(&self.binary)
            .args([
                "-J",
                "--no-playlist",
                "--default-search",
                "ytsearch",
                "--socket-timeout",
                "15",
                "--retries",
                "2",
                "--no-warnings",
                target,
            ])
            .output()
            .await
            .map_err(|e| PlayerError::provider("yt-dlp", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlayerError::provider(
                "yt-dlp",
                stderr.trim().to_string(),
            ));
        }

        serde_json::from_slice::<YtDlpDump>(&output.stdout)
            .map_err(|e| PlayerError::ProviderParse(format!("yt-dlp: {e}")))
    }
}

impl Default for YtDlpProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataProvider for YtDlpProvider {
    async fn fetch_info(&self, reference: &TrackReference) -> Result<TrackInfo, PlayerError> {
        let target = if reference.is_url() {
            reference.query().to_string()
        } else {
            format!("ytsearch1:{}", reference.query())
        };

        debug!("🔍 yt-dlp -J: {}", target);
        let mut dump = self.dump_json(&target).await?;

        // Una búsqueda devuelve un dump-playlist: nos quedamos con la
        // primera entrada
        if let Some(entries) = dump.entries.take() {
            dump = entries.into_iter().next().ok_or_else(|| {
                PlayerError::provider("yt-dlp", "búsqueda sin resultados")
            })?;
        }

        dump_to_info(dump, reference)
    }

    fn provider_name(&self) -> &'static str {
        "yt-dlp"
    }
}

fn dump_to_info(dump: YtDlpDump, reference: &TrackReference) -> Result<TrackInfo, PlayerError> {
    let id = dump
        .id
        .ok_or_else(|| PlayerError::ProviderParse("yt-dlp: dump sin id".to_string()))?;

    let formats = dump
        .formats
        .into_iter()
        .flatten()
        .filter_map(parse_format)
        .collect();

    let duration = dump
        .duration
        .filter(|&d| d > 0.0)
        .map(Duration::from_secs_f64)
        .or(reference.duration_hint());

    Ok(TrackInfo {
        id,
        title: dump
            .title
            .or_else(|| reference.title_hint().map(str::to_string))
            .unwrap_or_else(|| "Desconocido".to_string()),
        author: dump.uploader.or(dump.channel),
        duration,
        is_live: dump.is_live,
        formats,
    })
}

fn parse_format(raw: YtDlpFormat) -> Option<FormatDescriptor> {
    let url = raw.url?;
    let has_audio = raw.acodec.as_deref().is_some_and(|c| c != "none");
    let has_video = raw.vcodec.as_deref().is_some_and(|c| c != "none");
    if !has_audio && !has_video {
        return None;
    }

    let audio_codec = raw
        .acodec
        .filter(|c| c != "none")
        .map(|c| normalize_acodec(&c));

    Some(FormatDescriptor {
        id: raw.format_id.unwrap_or_default(),
        url,
        container: raw.ext.unwrap_or_default(),
        audio_codec,
        sample_rate_hz: raw.asr,
        bitrate_bps: raw.tbr.map(|kbps| (kbps * 1000.0) as u64),
        audio_bitrate_bps: raw.abr.map(|kbps| (kbps * 1000.0) as u64),
        has_audio,
        has_video,
    })
}

fn normalize_acodec(codec: &str) -> String {
    for family in ["opus", "mp4a", "vorbis", "aac"] {
        if codec.starts_with(family) {
            return family.to_string();
        }
    }
    codec.to_string()
}
