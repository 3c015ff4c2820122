pub mod format;
pub mod resolver;
pub mod segments;
pub mod youtube_api;
pub mod ytdlp;

use async_trait::async_trait;
use base64::Engine;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PlayerError;

pub use resolver::SourceResolver;
pub use youtube_api::YouTubeApiProvider;
pub use ytdlp::YtDlpProvider;

/// Referencia a un track, agnóstica del proveedor. Inmutable una vez creada.
/// Puede ser una URL, un ID nativo o un término de búsqueda; colaboradores
/// externos (p. ej. conversión de Spotify) pueden adjuntar pistas de título
/// y duración.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackReference {
    query: String,
    title_hint: Option<String>,
    duration_hint: Option<Duration>,
}

impl TrackReference {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            title_hint: None,
            duration_hint: None,
        }
    }

    pub fn with_title_hint(mut self, title: impl Into<String>) -> Self {
        self.title_hint = Some(title.into());
        self
    }

    pub fn with_duration_hint(mut self, duration: Duration) -> Self {
        self.duration_hint = Some(duration);
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn title_hint(&self) -> Option<&str> {
        self.title_hint.as_deref()
    }

    pub fn duration_hint(&self) -> Option<Duration> {
        self.duration_hint
    }

    /// La referencia es una URL http(s) en lugar de un término de búsqueda
    pub fn is_url(&self) -> bool {
        url::Url::parse(&self.query)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false)
    }
}

/// Descriptor tipado de un formato crudo de proveedor. Los payloads sueltos
/// de cada proveedor nunca cruzan esta frontera sin pasar por un parseo
/// estricto.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatDescriptor {
    pub id: String,
    pub url: String,
    /// Contenedor ("webm", "m4a", ...)
    pub container: String,
    pub audio_codec: Option<String>,
    pub sample_rate_hz: Option<u32>,
    /// Bitrate total del formato
    pub bitrate_bps: Option<u64>,
    /// Bitrate solo del audio, si el proveedor lo distingue
    pub audio_bitrate_bps: Option<u64>,
    pub has_audio: bool,
    pub has_video: bool,
}

impl FormatDescriptor {
    pub fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }

    /// Bitrate de audio, con fallback al total si no se conoce
    pub fn effective_bitrate(&self) -> u64 {
        self.audio_bitrate_bps.or(self.bitrate_bps).unwrap_or(0)
    }
}

/// Metadata cruda devuelta por un proveedor para una referencia
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub duration: Option<Duration>,
    pub is_live: bool,
    pub formats: Vec<FormatDescriptor>,
}

/// Contrato común de los extractores de metadata. Los proveedores nuevos se
/// agregan implementando este trait, nunca ramificando en el resolver.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn fetch_info(&self, reference: &TrackReference) -> Result<TrackInfo, PlayerError>;

    fn provider_name(&self) -> &'static str;
}

/// Salida del resolver: un stream concreto listo para el pipeline de audio.
///
/// Invariante: `is_live == true` implica `local_path == None` (los streams
/// en vivo jamás se cachean) y `duration` es solo orientativa.
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub source_track_id: String,
    pub stream_url: String,
    /// Copia local en caché, si existe
    pub local_path: Option<PathBuf>,
    pub format_id: String,
    pub container: String,
    pub audio_codec: Option<String>,
    pub sample_rate_hz: Option<u32>,
    pub bitrate_bps: Option<u64>,
    pub is_live: bool,
    pub duration: Option<Duration>,
    pub provider: &'static str,
    pub title: String,
    pub author: Option<String>,
}

impl ResolvedStream {
    /// Clave de caché derivada de la identidad lógica del track más el
    /// formato elegido, apta como nombre de archivo.
    pub fn cache_key(&self) -> String {
        let raw = format!(
            "{}#{}#{}",
            self.source_track_id, self.format_id, self.container
        );
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    /// Entrada que debe consumir el decodificador: archivo local si está
    /// cacheado, URL en caso contrario.
    pub fn input_location(&self) -> String {
        match &self.local_path {
            Some(path) => path.to_string_lossy().into_owned(),
            None => self.stream_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resolved(id: &str, format_id: &str) -> ResolvedStream {
        ResolvedStream {
            source_track_id: id.to_string(),
            stream_url: "https://cdn.example/a".to_string(),
            local_path: None,
            format_id: format_id.to_string(),
            container: "webm".to_string(),
            audio_codec: Some("opus".to_string()),
            sample_rate_hz: Some(48_000),
            bitrate_bps: Some(128_000),
            is_live: false,
            duration: None,
            provider: "test",
            title: "t".to_string(),
            author: None,
        }
    }

    #[test]
    fn url_detection() {
        assert!(TrackReference::new("https://www.youtube.com/watch?v=abc").is_url());
        assert!(TrackReference::new("http://ejemplo.com/x").is_url());
        assert!(!TrackReference::new("never gonna give you up").is_url());
        assert!(!TrackReference::new("ftp://host/archivo").is_url());
    }

    #[test]
    fn cache_key_is_stable_and_format_sensitive() {
        let a = resolved("dQw4w9WgXcQ", "251");
        let b = resolved("dQw4w9WgXcQ", "251");
        let c = resolved("dQw4w9WgXcQ", "140");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
        // apta como nombre de archivo
        assert!(!a.cache_key().contains('/'));
    }

    #[test]
    fn effective_bitrate_falls_back_to_total() {
        let mut f = FormatDescriptor {
            id: "251".into(),
            url: "u".into(),
            container: "webm".into(),
            audio_codec: Some("opus".into()),
            sample_rate_hz: Some(48_000),
            bitrate_bps: Some(130_000),
            audio_bitrate_bps: None,
            has_audio: true,
            has_video: false,
        };
        assert_eq!(f.effective_bitrate(), 130_000);
        f.audio_bitrate_bps = Some(128_000);
        assert_eq!(f.effective_bitrate(), 128_000);
    }
}
