use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::format::select_best_audio;
use super::{MetadataProvider, ResolvedStream, TrackReference};
use crate::error::{PlayerError, ProviderFailure};

/// Cliente HTTP compartido entre proveedores, de inicialización única e
/// idempotente. Se inyecta explícitamente en lugar de vivir como estado
/// global ambiente.
pub struct ProviderHttp {
    cell: OnceCell<reqwest::Client>,
    timeout: Duration,
}

impl ProviderHttp {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cell: OnceCell::new(),
            timeout,
        }
    }

    pub async fn client(&self) -> Result<&reqwest::Client, PlayerError> {
        self.cell
            .get_or_try_init(|| async {
                reqwest::Client::builder()
                    .timeout(self.timeout)
                    .user_agent("com.google.android.youtube/19.09.37 (Linux; U; Android 11)")
                    .build()
                    .map_err(|e| PlayerError::provider("http", e))
            })
            .await
    }
}

/// Orquesta los proveedores de metadata en orden estricto de prioridad y
/// aplica el selector de formatos a cada respuesta.
///
/// Sin estado mutable: seguro de invocar concurrentemente para referencias
/// distintas.
pub struct SourceResolver {
    providers: Vec<Arc<dyn MetadataProvider>>,
    provider_timeout: Duration,
    broken_extractor: Regex,
}

impl SourceResolver {
    pub fn new(providers: Vec<Arc<dyn MetadataProvider>>, provider_timeout: Duration) -> Self {
        // Firmas conocidas de extractor roto. Solo alimentan el log: el
        // fallback al siguiente proveedor ocurre ante cualquier fallo.
        let broken_extractor = Regex::new(
            r"(?i)signature extraction|decipher|player[ _-]?script|cipher|nsig|unable to extract",
        )
        .expect("regex estática inválida");

        Self {
            providers,
            provider_timeout,
            broken_extractor,
        }
    }

    /// Resuelve una referencia a un stream reproducible, probando cada
    /// proveedor en orden. El primer éxito corta el resto; si todos fallan
    /// se devuelven los motivos de cada intento, en orden de prioridad.
    pub async fn resolve(&self, reference: &TrackReference) -> Result<ResolvedStream, PlayerError> {
        let mut failures: Vec<ProviderFailure> = Vec::new();

        for provider in &self.providers {
            let name = provider.provider_name();
            debug!("🔎 Intentando proveedor '{}' para {}", name, reference.query());

            let info = match tokio::time::timeout(
                self.provider_timeout,
                provider.fetch_info(reference),
            )
            .await
            {
                Ok(Ok(info)) => info,
                Ok(Err(err)) => {
                    let reason = err.to_string();
                    let extractor_broken = self.broken_extractor.is_match(&reason);
                    if extractor_broken {
                        warn!("🧩 Proveedor '{}' con firma de extractor roto: {}", name, reason);
                    } else {
                        warn!("❌ Proveedor '{}' falló: {}", name, reason);
                    }
                    failures.push(ProviderFailure {
                        provider: name,
                        reason,
                        extractor_broken,
                    });
                    continue;
                }
                Err(_) => {
                    warn!(
                        "⏰ Proveedor '{}' superó el timeout de {:?}",
                        name, self.provider_timeout
                    );
                    failures.push(ProviderFailure {
                        provider: name,
                        reason: format!("timeout tras {:?}", self.provider_timeout),
                        extractor_broken: false,
                    });
                    continue;
                }
            };

            let Some(best) = select_best_audio(&info.formats, info.is_live) else {
                warn!(
                    "🔇 Proveedor '{}' respondió pero sin formato de audio utilizable",
                    name
                );
                failures.push(ProviderFailure {
                    provider: name,
                    reason: PlayerError::NoSuitableFormat.to_string(),
                    extractor_broken: false,
                });
                continue;
            };

            info!(
                "✅ Resuelto '{}' vía '{}' (formato {}, {} bps)",
                info.title,
                name,
                best.id,
                best.effective_bitrate()
            );

            return Ok(ResolvedStream {
                source_track_id: info.id,
                stream_url: best.url.clone(),
                local_path: None,
                format_id: best.id.clone(),
                container: best.container.clone(),
                audio_codec: best.audio_codec.clone(),
                sample_rate_hz: best.sample_rate_hz,
                bitrate_bps: Some(best.effective_bitrate()).filter(|&b| b > 0),
                is_live: info.is_live,
                duration: info.duration.or(reference.duration_hint()),
                provider: name,
                title: info.title,
                author: info.author,
            });
        }

        Err(PlayerError::AllProvidersFailed(failures))
    }
}
