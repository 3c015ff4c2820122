use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Configuración del núcleo, cargada de variables de entorno (con `.env`
/// opcional vía dotenvy). Ningún valor sensible entra al `summary()`.
#[derive(Debug, Clone)]
pub struct Config {
    // Caché en disco
    pub cache_dir: PathBuf,
    pub cache_budget_bytes: u64,
    /// Tracks por encima de esta duración se reproducen en directo
    pub max_cacheable_duration: Duration,

    // Resolución de fuentes
    pub provider_timeout: Duration,
    pub ytdlp_binary: String,
    pub enable_youtube_api: bool,

    // Reproducción
    pub default_volume: u8,
    pub max_queue_size: usize,
    pub max_reconnects: u32,

    // Ducking por actividad de voz
    pub duck_enabled: bool,
    pub duck_target_volume: u8,

    // Saltos de segmentos (el lookup vive en un colaborador externo)
    pub sponsorblock_enabled: bool,
    pub sponsorblock_timeout: Duration,

    // Rendimiento
    pub worker_threads: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "./cache".to_string())
                .into(),
            cache_budget_bytes: parse_byte_size(
                &std::env::var("CACHE_BUDGET").unwrap_or_else(|_| "2GB".to_string()),
            )?,
            max_cacheable_duration: std::env::var("MAX_CACHEABLE_DURATION")
                .unwrap_or_else(|_| "30m".to_string())
                .parse::<humantime::Duration>()?
                .into(),

            provider_timeout: std::env::var("PROVIDER_TIMEOUT")
                .unwrap_or_else(|_| "30s".to_string())
                .parse::<humantime::Duration>()?
                .into(),
            ytdlp_binary: std::env::var("YTDLP_BINARY").unwrap_or_else(|_| "yt-dlp".to_string()),
            enable_youtube_api: std::env::var("ENABLE_YOUTUBE_API")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,

            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "500".to_string())
                .parse()?,
            max_reconnects: std::env::var("MAX_RECONNECTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,

            duck_enabled: std::env::var("DUCK_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
            duck_target_volume: std::env::var("DUCK_TARGET_VOLUME")
                .unwrap_or_else(|_| "70".to_string())
                .parse()?,

            sponsorblock_enabled: std::env::var("SPONSORBLOCK_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            sponsorblock_timeout: std::env::var("SPONSORBLOCK_TIMEOUT")
                .unwrap_or_else(|_| "10s".to_string())
                .parse::<humantime::Duration>()?
                .into(),

            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => num_cpus::get(),
            },
        };

        std::fs::create_dir_all(&config.cache_dir)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_volume > 100 {
            anyhow::bail!(
                "El volumen por defecto debe estar entre 0 y 100, llegó: {}",
                self.default_volume
            );
        }

        if self.duck_target_volume > 100 {
            anyhow::bail!(
                "El volumen de duck debe estar entre 0 y 100, llegó: {}",
                self.duck_target_volume
            );
        }

        if self.cache_budget_bytes == 0 {
            anyhow::bail!("El presupuesto de caché debe ser mayor que 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("El tamaño máximo de cola debe ser mayor que 0");
        }

        if self.provider_timeout.is_zero() {
            anyhow::bail!("El timeout de proveedores debe ser mayor que 0");
        }

        Ok(())
    }

    /// Resumen apto para el log de arranque
    pub fn summary(&self) -> String {
        format!(
            "Config:\n  \
            Caché: {} ({} máx, tracks hasta {})\n  \
            Fuentes: timeout {}, yt-dlp='{}', API oficial={}\n  \
            Reproducción: {}% vol, cola de {}, {} reintentos\n  \
            Duck: {} (objetivo {}%)\n  \
            Segmentos: {} (timeout {})\n  \
            Workers: {}",
            self.cache_dir.display(),
            format_byte_size(self.cache_budget_bytes),
            humantime::format_duration(self.max_cacheable_duration),
            humantime::format_duration(self.provider_timeout),
            self.ytdlp_binary,
            self.enable_youtube_api,
            self.default_volume,
            self.max_queue_size,
            self.max_reconnects,
            if self.duck_enabled { "sí" } else { "no" },
            self.duck_target_volume,
            if self.sponsorblock_enabled { "sí" } else { "no" },
            humantime::format_duration(self.sponsorblock_timeout),
            self.worker_threads,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: "./cache".into(),
            cache_budget_bytes: 2 * 1024 * 1024 * 1024,
            max_cacheable_duration: Duration::from_secs(30 * 60),
            provider_timeout: Duration::from_secs(30),
            ytdlp_binary: "yt-dlp".to_string(),
            enable_youtube_api: true,
            default_volume: 100,
            max_queue_size: 500,
            max_reconnects: 3,
            duck_enabled: true,
            duck_target_volume: 70,
            sponsorblock_enabled: false,
            sponsorblock_timeout: Duration::from_secs(10),
            worker_threads: num_cpus::get(),
        }
    }
}

/// Parsea tamaños del estilo "512MB", "2GB", "1048576"
fn parse_byte_size(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    let upper = trimmed.to_ascii_uppercase();

    let (digits, multiplier) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024u64 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024u64)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };

    let value: u64 = digits.trim().parse().map_err(|_| {
        anyhow::anyhow!("Tamaño de bytes no válido: '{}'", raw)
    })?;
    Ok(value * multiplier)
}

fn format_byte_size(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    if bytes >= GB {
        format!("{:.1}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{}B", bytes)
    }
}
