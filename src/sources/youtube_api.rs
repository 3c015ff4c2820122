use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::resolver::ProviderHttp;
use super::{FormatDescriptor, MetadataProvider, TrackInfo, TrackReference};
use crate::error::PlayerError;

const PLAYER_ENDPOINT: &str = "https://www.youtube.com/youtubei/v1/player";
// El cliente ANDROID devuelve URLs directas sin firma cifrada
const CLIENT_NAME: &str = "ANDROID";
const CLIENT_VERSION: &str = "19.09.37";
const ANDROID_SDK: u32 = 30;

/// Proveedor respaldado por la API oficial del reproductor (Innertube)
pub struct YouTubeApiProvider {
    http: Arc<ProviderHttp>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerResponse {
    playability_status: Option<PlayabilityStatus>,
    streaming_data: Option<StreamingData>,
    video_details: Option<VideoDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayabilityStatus {
    status: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingData {
    adaptive_formats: Option<Vec<RawFormat>>,
    formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFormat {
    itag: Option<u64>,
    url: Option<String>,
    mime_type: Option<String>,
    bitrate: Option<u64>,
    average_bitrate: Option<u64>,
    audio_sample_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoDetails {
    video_id: String,
    title: String,
    author: Option<String>,
    length_seconds: Option<String>,
    #[serde(default)]
    is_live: bool,
    #[serde(default)]
    is_live_content: bool,
}

impl YouTubeApiProvider {
    pub fn new(http: Arc<ProviderHttp>) -> Self {
        Self { http }
    }

    pub fn is_youtube_url(url: &str) -> bool {
        url.contains("youtube.com") || url.contains("youtu.be") || url.contains("music.youtube.com")
    }

    /// Extrae el video ID de las variantes habituales de URL de YouTube
    pub fn extract_video_id(raw: &str) -> Result<String, PlayerError> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| PlayerError::provider("youtube-api", format!("URL mal formada: {e}")))?;

        // youtube.com/watch?v=VIDEO_ID
        for (key, value) in parsed.query_pairs() {
            if key == "v" && !value.is_empty() {
                return Ok(value.into_owned());
            }
        }

        // youtu.be/VIDEO_ID y youtube.com/shorts/VIDEO_ID
        if let Some(mut segments) = parsed.path_segments() {
            match parsed.host_str() {
                Some("youtu.be") => {
                    if let Some(id) = segments.next().filter(|s| !s.is_empty()) {
                        return Ok(id.to_string());
                    }
                }
                _ => {
                    let parts: Vec<&str> = segments.collect();
                    if let ["shorts" | "live" | "embed", id, ..] = parts.as_slice() {
                        if !id.is_empty() {
                            return Ok(id.to_string());
                        }
                    }
                }
            }
        }

        Err(PlayerError::provider(
            "youtube-api",
            format!("no se pudo extraer video ID de: {raw}"),
        ))
    }

    async fn fetch_player_response(&self, video_id: &str) -> Result<PlayerResponse, PlayerError> {
        let client = self.http.client().await?;

        let body = json!({
            "videoId": video_id,
            "context": {
                "client": {
                    "clientName": CLIENT_NAME,
                    "clientVersion": CLIENT_VERSION,
                    "androidSdkVersion": ANDROID_SDK,
                    "hl": "en",
                }
            },
            "contentCheckOk": true,
            "racyCheckOk": true,
        });

        let response = client
            .post(PLAYER_ENDPOINT)
            .query(&[("prettyPrint", "false")])
            .json(&body)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| PlayerError::provider("youtube-api", e))?;

        if !response.status().is_success() {
            return Err(PlayerError::provider(
                "youtube-api",
                format!("HTTP {}", response.status()),
            ));
        }

        response
            .json::<PlayerResponse>()
            .await
            .map_err(|e| PlayerError::ProviderParse(format!("youtube-api: {e}")))
    }
}

#[async_trait]
impl MetadataProvider for YouTubeApiProvider {
    async fn fetch_info(&self, reference: &TrackReference) -> Result<TrackInfo, PlayerError> {
        if !reference.is_url() || !Self::is_youtube_url(reference.query()) {
            return Err(PlayerError::provider(
                "youtube-api",
                "este proveedor solo acepta URLs de YouTube",
            ));
        }

        let video_id = Self::extract_video_id(reference.query())?;
        let response = self.fetch_player_response(&video_id).await?;

        if let Some(status) = &response.playability_status {
            let ok = status.status.as_deref() == Some("OK");
            if !ok {
                let reason = status
                    .reason
                    .clone()
                    .or_else(|| status.status.clone())
                    .unwrap_or_else(|| "estado desconocido".to_string());
                return Err(PlayerError::provider("youtube-api", reason));
            }
        }

        let details = response.video_details.ok_or_else(|| {
            PlayerError::ProviderParse("youtube-api: respuesta sin videoDetails".to_string())
        })?;

        let mut formats = Vec::new();
        if let Some(streaming) = response.streaming_data {
            for raw in streaming
                .adaptive_formats
                .into_iter()
                .flatten()
                .chain(streaming.formats.into_iter().flatten())
            {
                match parse_format(raw) {
                    Some(f) => formats.push(f),
                    None => debug!("🔒 Formato sin URL directa descartado"),
                }
            }
        }

        if formats.is_empty() {
            warn!("⚠️ youtube-api no devolvió formatos directos para {}", video_id);
        }

        let duration = details
            .length_seconds
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&s| s > 0)
            .map(Duration::from_secs);

        Ok(TrackInfo {
            id: details.video_id,
            title: details.title,
            author: details.author,
            duration,
            is_live: details.is_live || (details.is_live_content && duration.is_none()),
            formats,
        })
    }

    fn provider_name(&self) -> &'static str {
        "youtube-api"
    }
}

/// Parseo estricto de un formato crudo. Formatos cifrados (sin `url`) se
/// descartan: este cliente no descifra firmas.
fn parse_format(raw: RawFormat) -> Option<FormatDescriptor> {
    let url = raw.url?;
    let mime = raw.mime_type.unwrap_or_default();
    let (kind, container, codecs) = parse_mime(&mime)?;

    let has_audio = kind == "audio" || codecs.iter().any(|c| is_audio_codec(c));
    let has_video = kind == "video";
    let audio_codec = codecs.iter().find(|c| is_audio_codec(c)).cloned();

    let audio_bitrate = if has_audio && !has_video {
        raw.average_bitrate.or(raw.bitrate)
    } else {
        None
    };

    Some(FormatDescriptor {
        id: raw.itag.map(|i| i.to_string()).unwrap_or_default(),
        url,
        container,
        audio_codec,
        sample_rate_hz: raw.audio_sample_rate.and_then(|s| s.parse().ok()),
        bitrate_bps: raw.bitrate,
        audio_bitrate_bps: audio_bitrate,
        has_audio,
        has_video,
    })
}

/// `audio/webm; codecs="opus"` → ("audio", "webm", ["opus"])
fn parse_mime(mime: &str) -> Option<(String, String, Vec<String>)> {
    let mut parts = mime.splitn(2, ';');
    let media_type = parts.next()?.trim();
    let (kind, container) = media_type.split_once('/')?;

    let codecs = parts
        .next()
        .and_then(|rest| rest.split_once('='))
        .map(|(_, list)| {
            list.trim()
                .trim_matches('"')
                .split(',')
                .map(|c| normalize_codec(c.trim()))
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some((kind.to_string(), container.to_string(), codecs))
}

fn normalize_codec(codec: &str) -> String {
    for family in ["opus", "mp4a", "vorbis", "avc1", "vp9", "av01", "vp8"] {
        if codec.starts_with(family) {
            return family.to_string();
        }
    }
    codec.to_string()
}

fn is_audio_codec(codec: &str) -> bool {
    matches!(codec, "opus" | "mp4a" | "vorbis")
}
