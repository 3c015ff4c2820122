use async_trait::async_trait;
use futures::TryStreamExt;
use serenity::model::id::{GuildId, UserId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::pipeline::{
    AudioPipeline, Decoder, PipelineSettings, PlaybackOutcome, VolumeControl,
};
use crate::audio::queue::{PlayQueue, QueueInfo, QueueItem};
use crate::cache::{CacheStore, PinnedEntry};
use crate::error::PlayerError;
use crate::sources::segments::SegmentSkipProvider;
use crate::sources::{ResolvedStream, SourceResolver, TrackReference};
use crate::voice::VoiceTransport;

/// Parámetros de comportamiento compartidos por todos los players
#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub default_volume_percent: u8,
    pub duck_enabled: bool,
    pub duck_target_percent: u8,
    pub max_queue_size: usize,
    pub max_reconnects: u32,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            default_volume_percent: 100,
            duck_enabled: true,
            duck_target_percent: 70,
            max_queue_size: 500,
            max_reconnects: 3,
        }
    }
}

/// Descarga del stream remoto para la escritura en caché. Separado en trait
/// para poder reproducir en tests sin red.
#[async_trait]
pub trait StreamFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>, PlayerError>;
}

/// Fetcher real sobre reqwest, compartiendo el cliente de los proveedores
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>, PlayerError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PlayerError::CacheWriteFailed(e.to_string()))?;

        let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        Ok(Box::new(tokio_util::io::StreamReader::new(stream)))
    }
}

/// Memo acotado referencia → resolución: una segunda reproducción del mismo
/// track cacheado no vuelve a tocar proveedores. Al superar la capacidad
/// sale la referencia memorizada hace más tiempo, y una entrada cuyo archivo
/// ya no está en caché se invalida en el siguiente lookup.
pub struct RecentResolutions {
    inner: parking_lot::Mutex<RecentInner>,
    capacity: usize,
}

struct RecentInner {
    map: HashMap<String, ResolvedStream>,
    order: VecDeque<String>,
}

impl RecentResolutions {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(RecentInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, reference: &str) -> Option<ResolvedStream> {
        self.inner.lock().map.get(reference).cloned()
    }

    pub fn insert(&self, reference: String, stream: ResolvedStream) {
        let mut inner = self.inner.lock();
        if inner.map.insert(reference.clone(), stream).is_none() {
            inner.order.push_back(reference);
        }
        while inner.map.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.map.remove(&oldest);
        }
    }

    pub fn invalidate(&self, reference: &str) {
        let mut inner = self.inner.lock();
        if inner.map.remove(reference).is_some() {
            inner.order.retain(|r| r != reference);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }
}

impl Default for RecentResolutions {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Dependencias compartidas que cada player recibe del registry
pub struct PlayerDeps {
    pub resolver: Arc<SourceResolver>,
    pub cache: Arc<CacheStore>,
    pub segments: Arc<dyn SegmentSkipProvider>,
    pub decoder: Arc<dyn Decoder>,
    pub fetcher: Arc<dyn StreamFetcher>,
    pub settings: PlayerSettings,
    pub recent: RecentResolutions,
}

/// Estados del player por guild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Resolving,
    Playing,
    Paused,
}

struct PlayerSession {
    state: PlayerState,
    queue: PlayQueue,
    current: Option<QueueItem>,
    track_cancel: Option<CancellationToken>,
    pending_seek: Option<Duration>,
    driver_running: bool,
    last_error: Option<String>,
}

/// Player de un guild: máquina de estados más la tarea que conduce la cola.
/// Todas las operaciones públicas son seguras de llamar desde cualquier
/// tarea; la reproducción real vive en una tarea propia.
pub struct GuildPlayer {
    guild_id: GuildId,
    deps: Arc<PlayerDeps>,
    transport: Arc<dyn VoiceTransport>,
    session: Mutex<PlayerSession>,
    volume: Arc<VolumeControl>,
    pause_tx: watch::Sender<bool>,
    position_ms: Arc<AtomicU64>,
    root_cancel: CancellationToken,
}

impl GuildPlayer {
    pub fn new(
        guild_id: GuildId,
        deps: Arc<PlayerDeps>,
        transport: Arc<dyn VoiceTransport>,
    ) -> Self {
        let (pause_tx, _) = watch::channel(false);
        let volume = Arc::new(VolumeControl::new(deps.settings.default_volume_percent));
        Self {
            guild_id,
            transport,
            session: Mutex::new(PlayerSession {
                state: PlayerState::Idle,
                queue: PlayQueue::new(deps.settings.max_queue_size),
                current: None,
                track_cancel: None,
                pending_seek: None,
                driver_running: false,
                last_error: None,
            }),
            volume,
            pause_tx,
            position_ms: Arc::new(AtomicU64::new(0)),
            root_cancel: CancellationToken::new(),
            deps,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Agrega una referencia a la cola y arranca el driver si está ocioso.
    /// Devuelve la posición en la cola (1-based).
    pub async fn enqueue(
        self: &Arc<Self>,
        reference: TrackReference,
        requested_by: UserId,
    ) -> Result<usize, PlayerError> {
        let mut session = self.session.lock().await;
        let position = session.queue.push(QueueItem::new(reference, requested_by))?;

        if !session.driver_running {
            session.driver_running = true;
            session.state = PlayerState::Resolving;
            let player = Arc::clone(self);
            tokio::spawn(async move { player.drive().await });
        }
        Ok(position)
    }

    /// Cancela el track actual y pasa al siguiente de la cola
    pub async fn skip(&self) {
        let session = self.session.lock().await;
        if let Some(cancel) = &session.track_cancel {
            info!("⏭️ Skip en guild {}", self.guild_id);
            cancel.cancel();
        }
    }

    /// Congela la emisión de frames; la posición y el proceso quedan intactos
    pub async fn pause(&self) {
        let mut session = self.session.lock().await;
        if session.state == PlayerState::Playing {
            session.state = PlayerState::Paused;
            self.pause_tx.send_replace(true);
            info!("⏸️ Pausado en guild {}", self.guild_id);
        }
    }

    pub async fn resume(&self) {
        let mut session = self.session.lock().await;
        if session.state == PlayerState::Paused {
            session.state = PlayerState::Playing;
            self.pause_tx.send_replace(false);
            info!("▶️ Reanudado en guild {}", self.guild_id);
        }
    }

    /// Reposiciona el track actual. Solo tiene efecto con un track en curso.
    pub async fn seek(&self, position: Duration) {
        let mut session = self.session.lock().await;
        match session.state {
            PlayerState::Playing | PlayerState::Paused => {
                session.pending_seek = Some(position);
                if let Some(cancel) = &session.track_cancel {
                    cancel.cancel();
                }
                info!("⏩ Seek a {:?} en guild {}", position, self.guild_id);
            }
            _ => warn!("⚠️ Seek ignorado: no hay track en curso"),
        }
    }

    /// Detiene todo: track actual cancelado, cola vaciada, estado Idle
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        session.queue.clear();
        session.pending_seek = None;
        if let Some(cancel) = &session.track_cancel {
            cancel.cancel();
        }
        self.pause_tx.send_replace(false);
        info!("⏹️ Detenido en guild {}", self.guild_id);
    }

    /// Volumen base en porcentaje (0-100), efectivo desde el frame siguiente
    pub fn set_volume(&self, percent: u8) {
        let clamped = percent.min(100);
        self.volume.set_percent(clamped);
        debug!("🔊 Volumen al {}% en guild {}", clamped, self.guild_id);
    }

    pub fn volume(&self) -> u8 {
        self.volume.percent()
    }

    /// Señal de actividad de voz: atenúa mientras alguien habla y restaura
    /// el volumen configurado al callar.
    pub fn notify_voice_activity(&self, someone_speaking: bool) {
        if !self.deps.settings.duck_enabled {
            return;
        }
        if someone_speaking {
            if !self.volume.is_ducked() {
                debug!("🦆 Duck activado en guild {}", self.guild_id);
            }
            self.volume.duck(self.deps.settings.duck_target_percent);
        } else {
            if self.volume.is_ducked() {
                debug!("🦆 Duck liberado en guild {}", self.guild_id);
            }
            self.volume.clear_duck();
        }
    }

    pub async fn state(&self) -> PlayerState {
        self.session.lock().await.state
    }

    pub async fn now_playing(&self) -> Option<QueueItem> {
        self.session.lock().await.current.clone()
    }

    pub async fn queue_info(&self) -> QueueInfo {
        self.session.lock().await.queue.info()
    }

    /// Reordena un elemento pendiente de la cola (índices 0-based)
    pub async fn move_track(&self, from: usize, to: usize) -> Result<(), PlayerError> {
        self.session.lock().await.queue.move_track(from, to)
    }

    /// Quita un elemento pendiente de la cola sin tocar el track actual
    pub async fn remove_track(&self, index: usize) -> Result<QueueItem, PlayerError> {
        self.session.lock().await.queue.remove_track(index)
    }

    pub async fn last_error(&self) -> Option<String> {
        self.session.lock().await.last_error.clone()
    }

    /// Posición aproximada dentro del track actual
    pub fn position(&self) -> Duration {
        Duration::from_millis(self.position_ms.load(Ordering::Relaxed))
    }

    /// Cancela todo y deja el player inutilizable; lo invoca el registry
    pub fn shutdown(&self) {
        self.root_cancel.cancel();
    }

    /// Tarea conductora: consume la cola hasta vaciarla y termina
    async fn drive(self: Arc<Self>) {
        loop {
            if self.root_cancel.is_cancelled() {
                break;
            }

            // desencolar e instalar el token del track van en la misma
            // sección crítica: un stop/skip concurrente siempre encuentra
            // el token del item que va a sonar, nunca el del anterior
            let (item, start_offset, cancel) = {
                let mut session = self.session.lock().await;
                let (item, start_offset) = if let Some(target) = session.pending_seek.take() {
                    match session.current.clone() {
                        Some(current) => (current, target),
                        None => continue,
                    }
                } else if let Some(next) = session.queue.pop_front() {
                    session.current = Some(next.clone());
                    (next, Duration::ZERO)
                } else {
                    session.current = None;
                    session.track_cancel = None;
                    session.state = PlayerState::Idle;
                    session.driver_running = false;
                    debug!("💤 Cola agotada en guild {}", self.guild_id);
                    return;
                };

                let cancel = self.root_cancel.child_token();
                session.state = PlayerState::Resolving;
                session.track_cancel = Some(cancel.clone());
                (item, start_offset, cancel)
            };

            match self.play_item(&item, start_offset, cancel).await {
                Ok(outcome) if outcome.finished => {
                    info!(
                        "🏁 Track terminado en guild {} ({:?})",
                        self.guild_id, outcome.position
                    );
                }
                Ok(_) => {
                    debug!("⏹️ Track cancelado en guild {}", self.guild_id);
                }
                Err(e) => {
                    // un track fallido nunca detiene la cola
                    warn!("❌ Track falló en guild {}: {}", self.guild_id, e);
                    let mut session = self.session.lock().await;
                    session.last_error = Some(e.to_string());
                }
            }
        }

        let mut session = self.session.lock().await;
        session.state = PlayerState::Idle;
        session.driver_running = false;
    }

    async fn play_item(
        &self,
        item: &QueueItem,
        start_offset: Duration,
        cancel: CancellationToken,
    ) -> Result<PlaybackOutcome, PlayerError> {
        let cancelled = PlaybackOutcome {
            position: start_offset,
            finished: false,
        };

        let (mut resolved, mut pinned) = match self.lookup_recent(&item.reference) {
            Some(hit) => hit,
            None => {
                let resolved = tokio::select! {
                    _ = cancel.cancelled() => return Ok(cancelled),
                    r = self.deps.resolver.resolve(&item.reference) => r?,
                };
                self.deps
                    .recent
                    .insert(item.reference.query().to_string(), resolved.clone());
                (resolved, None)
            }
        };

        // escritura write-through antes de reproducir; cualquier fallo de
        // caché degrada a streaming directo
        if pinned.is_none() && !resolved.is_live {
            let key = resolved.cache_key();
            if let Some(pin) = self.deps.cache.get(&key) {
                resolved.local_path = Some(pin.path().to_path_buf());
                pinned = Some(pin);
            } else if self.deps.cache.is_eligible(&resolved, start_offset) {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(cancelled),
                    written = self.write_through(&key, &resolved.stream_url) => {
                        if written {
                            if let Some(pin) = self.deps.cache.get(&key) {
                                resolved.local_path = Some(pin.path().to_path_buf());
                                pinned = Some(pin);
                            }
                        }
                    }
                }
            }
        }

        let skip_ranges = self.deps.segments.skip_ranges(&item.reference).await;

        {
            let mut session = self.session.lock().await;
            session.state = PlayerState::Playing;
        }
        self.pause_tx.send_replace(false);
        self.position_ms
            .store(start_offset.as_millis() as u64, Ordering::Relaxed);

        info!(
            "🎵 Reproduciendo en guild {}: {} ({})",
            self.guild_id,
            resolved.title,
            if resolved.local_path.is_some() {
                "caché"
            } else {
                "directo"
            }
        );

        let pipeline = AudioPipeline::new(
            Arc::clone(&self.deps.decoder),
            Arc::clone(&self.transport),
            Arc::clone(&self.volume),
        );
        let settings = PipelineSettings {
            start_offset,
            skip_ranges,
            max_reconnects: self.deps.settings.max_reconnects,
            position_out: Arc::clone(&self.position_ms),
        };

        let outcome = pipeline
            .run(&resolved, settings, self.pause_tx.subscribe(), cancel)
            .await;
        drop(pinned);
        outcome
    }

    /// Resolución memorizada: válida solo mientras el archivo siga en caché
    fn lookup_recent(
        &self,
        reference: &TrackReference,
    ) -> Option<(ResolvedStream, Option<PinnedEntry>)> {
        let previous = self.deps.recent.get(reference.query())?;
        let Some(pin) = self.deps.cache.get(&previous.cache_key()) else {
            // el archivo salió del caché: el memo ya no sirve
            self.deps.recent.invalidate(reference.query());
            return None;
        };
        let mut resolved = previous;
        resolved.local_path = Some(pin.path().to_path_buf());
        debug!(
            "💾 Resolución reutilizada sin tocar proveedores: {}",
            resolved.title
        );
        Some((resolved, Some(pin)))
    }

    /// Descarga y escribe en caché; `false` significa seguir en directo
    async fn write_through(&self, key: &str, url: &str) -> bool {
        let reader = match self.deps.fetcher.fetch(url).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!("⚠️ Descarga para caché falló, streaming directo: {}", e);
                return false;
            }
        };
        match self.deps.cache.put(key, reader).await {
            Ok(entry) => {
                debug!("💾 Cacheado {} ({} bytes)", key, entry.size_bytes);
                true
            }
            Err(e) => {
                warn!("⚠️ Escritura en caché falló, streaming directo: {}", e);
                false
            }
        }
    }
}
