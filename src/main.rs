use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use cadencia::audio::{
    FfmpegDecoder, HttpFetcher, PlayerDeps, PlayerRegistry, PlayerSettings, RecentResolutions,
};
use cadencia::cache::CacheStore;
use cadencia::config::Config;
use cadencia::sources::resolver::ProviderHttp;
use cadencia::sources::segments::{DisabledSegments, SegmentSkipProvider};
use cadencia::sources::{MetadataProvider, SourceResolver, YouTubeApiProvider, YtDlpProvider};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cadencia=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando cadencia v{}", env!("CARGO_PKG_VERSION"));

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    let config = Config::load()?;
    info!("{}", config.summary());

    // Caché en disco con presupuesto LRU
    let cache = Arc::new(
        CacheStore::open(
            config.cache_dir.clone(),
            config.cache_budget_bytes,
            config.max_cacheable_duration,
        )
        .await?,
    );
    info!(
        "💾 Caché lista: {} entradas, {} bytes",
        cache.len(),
        cache.total_bytes()
    );

    // Cadena de proveedores en orden de prioridad: API oficial primero,
    // yt-dlp como respaldo universal
    let http = Arc::new(ProviderHttp::new(config.provider_timeout));
    let ytdlp = YtDlpProvider::with_binary(&config.ytdlp_binary);
    ytdlp.verify_dependencies().await?;

    let mut providers: Vec<Arc<dyn MetadataProvider>> = Vec::new();
    if config.enable_youtube_api {
        providers.push(Arc::new(YouTubeApiProvider::new(Arc::clone(&http))));
    }
    providers.push(Arc::new(ytdlp));
    let resolver = Arc::new(SourceResolver::new(providers, config.provider_timeout));

    let decoder = Arc::new(FfmpegDecoder::new());
    decoder.verify_dependencies().await?;

    let fetcher = Arc::new(HttpFetcher::new(http.client().await?.clone()));

    // El lookup de segmentos vive en un colaborador externo; el host lo
    // monta envuelto en `BoundedSegments` con config.sponsorblock_timeout.
    // Este binario arranca sin colaborador.
    let segments: Arc<dyn SegmentSkipProvider> = Arc::new(DisabledSegments);
    if config.sponsorblock_enabled {
        tracing::warn!("⚠️ SponsorBlock habilitado pero sin proveedor de segmentos montado");
    }

    let deps = Arc::new(PlayerDeps {
        resolver,
        cache,
        segments,
        decoder,
        fetcher,
        settings: PlayerSettings {
            default_volume_percent: config.default_volume,
            duck_enabled: config.duck_enabled,
            duck_target_percent: config.duck_target_volume,
            max_queue_size: config.max_queue_size,
            max_reconnects: config.max_reconnects,
        },
        recent: RecentResolutions::default(),
    });

    let registry = Arc::new(PlayerRegistry::new(deps));
    info!("🚀 Núcleo listo; esperando al host de voz");

    // El host (gateway + socket de voz) monta players vía `registry`; este
    // binario solo mantiene vivo el runtime hasta la señal de apagado.
    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    for guild_id in registry.guild_ids() {
        registry.remove(guild_id);
    }
    // margen para que las tareas de reproducción observen la cancelación
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}

async fn health_check() -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
