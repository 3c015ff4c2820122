//! # Cache Module
//!
//! Content-addressable on-disk store for fully downloaded tracks.
//!
//! Entries are keyed by the logical track identity plus the selected format
//! and live as plain files inside the cache directory, so the index can
//! always be rebuilt by scanning it. The store enforces a byte budget with
//! least-recently-accessed eviction and never exposes a partially written
//! entry: data streams into a temp file that is atomically persisted only
//! after end-of-stream.
//!
//! Concurrency rules:
//! - one in-flight writer per key; concurrent writers for the same key wait
//!   on the same result instead of re-fetching
//! - readers of a completed entry are unrestricted; an entry pinned by an
//!   active read is never evicted (deferred until the pin drops)

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::PlayerError;
use crate::sources::ResolvedStream;

/// Entrada registrada del caché. Inmutable una vez persistida.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_access: SystemTime,
    pub created_at: SystemTime,
}

/// Guard de lectura: mientras viva, la entrada no puede ser evictada
pub struct PinnedEntry {
    entry: CacheEntry,
    pin: Arc<AtomicUsize>,
}

impl PinnedEntry {
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn path(&self) -> &Path {
        &self.entry.path
    }
}

impl Drop for PinnedEntry {
    fn drop(&mut self) {
        self.pin.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

/// Instantánea de las estadísticas para logging
#[derive(Debug, Clone, Copy)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub entries: usize,
    pub total_bytes: u64,
}

pub struct CacheStore {
    dir: PathBuf,
    budget_bytes: u64,
    max_cacheable: Duration,
    entries: DashMap<String, CacheEntry>,
    pins: DashMap<String, Arc<AtomicUsize>>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    total_bytes: AtomicU64,
    stats: CacheStats,
}

impl CacheStore {
    /// Abre (o crea) el directorio de caché y reconstruye el índice
    /// escaneándolo: la corrección depende solo del invariante de bytes,
    /// no de que el índice sobreviva reinicios.
    pub async fn open(
        dir: impl Into<PathBuf>,
        budget_bytes: u64,
        max_cacheable: Duration,
    ) -> Result<Self, PlayerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let store = Self {
            dir: dir.clone(),
            budget_bytes,
            max_cacheable,
            entries: DashMap::new(),
            pins: DashMap::new(),
            in_flight: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            stats: CacheStats::default(),
        };

        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(dirent) = read_dir.next_entry().await? {
            let path = dirent.path();
            let name = dirent.file_name().to_string_lossy().into_owned();
            // restos de escrituras abortadas
            if name.ends_with(".part") {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            let Ok(meta) = dirent.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }

            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let created = meta.created().unwrap_or(modified);
            store.entries.insert(
                name.clone(),
                CacheEntry {
                    key: name,
                    path,
                    size_bytes: meta.len(),
                    last_access: modified,
                    created_at: created,
                },
            );
            store.total_bytes.fetch_add(meta.len(), Ordering::SeqCst);
        }

        info!(
            "🗄️ Caché abierto: {} entradas, {} bytes de {} presupuestados",
            store.entries.len(),
            store.total_bytes.load(Ordering::SeqCst),
            budget_bytes
        );

        store.evict_if_needed().await;
        Ok(store)
    }

    /// Política de elegibilidad, decidida por el llamador antes de escribir:
    /// nunca en vivo, nunca con offset de arranque, nunca si la duración
    /// conocida supera el techo configurado. Duración desconocida es
    /// cacheable (se registra tras conocer los bytes totales).
    pub fn is_eligible(&self, stream: &ResolvedStream, start_offset: Duration) -> bool {
        if stream.is_live || !start_offset.is_zero() {
            return false;
        }
        stream.duration.map_or(true, |d| d <= self.max_cacheable)
    }

    /// Busca una entrada completa; si existe la marca como recién accedida y
    /// la deja fijada mientras viva el guard.
    pub fn get(&self, key: &str) -> Option<PinnedEntry> {
        let Some(mut found) = self.entries.get_mut(key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            debug!("❌ Cache miss: {}", key);
            return None;
        };
        found.last_access = SystemTime::now();

        // el pin se incrementa con el shard de `entries` aún retenido: una
        // eviction concurrente o bien ve la entrada ya fijada, o bien la
        // quitó antes y este lookup habría fallado
        let pin = self
            .pins
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        pin.fetch_add(1, Ordering::SeqCst);
        let entry = found.clone();
        drop(found);

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        debug!("✅ Cache hit: {}", key);
        Some(PinnedEntry { entry, pin })
    }

    /// Escribe el stream completo bajo `key`. La escritura va a un archivo
    /// temporal y solo se registra tras fin-de-stream (rename atómico); un
    /// aborto a mitad de camino no deja entrada parcial visible.
    ///
    /// Escrituras concurrentes para la misma clave se deduplican: la segunda
    /// espera a la primera y observa la misma entrada resultante.
    pub async fn put<R>(&self, key: &str, reader: R) -> Result<CacheEntry, PlayerError>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        let lock = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // otro escritor pudo completar la clave mientras esperábamos
        if let Some(existing) = self.entries.get(key) {
            let entry = existing.clone();
            drop(existing);
            self.in_flight.remove(key);
            return Ok(entry);
        }

        let result = self.write_entry(key, reader).await;
        self.in_flight.remove(key);

        match &result {
            Ok(entry) => {
                debug!("💾 Entrada cacheada: {} ({} bytes)", key, entry.size_bytes);
                self.evict_if_needed().await;
            }
            Err(e) => warn!("⚠️ Escritura de caché fallida para {}: {}", key, e),
        }
        result
    }

    async fn write_entry<R>(&self, key: &str, mut reader: R) -> Result<CacheEntry, PlayerError>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        let temp = tempfile::Builder::new()
            .suffix(".part")
            .tempfile_in(&self.dir)
            .map_err(|e| PlayerError::CacheWriteFailed(e.to_string()))?;

        let size_bytes = {
            let mut file = tokio::fs::File::create(temp.path())
                .await
                .map_err(|e| PlayerError::CacheWriteFailed(e.to_string()))?;
            let written = tokio::io::copy(&mut reader, &mut file)
                .await
                .map_err(|e| PlayerError::CacheWriteFailed(e.to_string()))?;
            file.sync_all()
                .await
                .map_err(|e| PlayerError::CacheWriteFailed(e.to_string()))?;
            written
        };

        let final_path = self.dir.join(key);
        temp.persist(&final_path)
            .map_err(|e| PlayerError::CacheWriteFailed(e.to_string()))?;

        let now = SystemTime::now();
        let entry = CacheEntry {
            key: key.to_string(),
            path: final_path,
            size_bytes,
            last_access: now,
            created_at: now,
        };
        self.entries.insert(key.to_string(), entry.clone());
        self.total_bytes.fetch_add(size_bytes, Ordering::SeqCst);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    /// Evicta entradas menos-recientemente-accedidas hasta volver al
    /// presupuesto. Las entradas fijadas por una lectura activa se saltan:
    /// su borrado queda diferido a la próxima pasada.
    pub async fn evict_if_needed(&self) {
        while self.total_bytes.load(Ordering::SeqCst) > self.budget_bytes {
            let mut candidates: Vec<(String, SystemTime, u64)> = self
                .entries
                .iter()
                .filter(|e| !self.is_pinned(e.key()))
                .map(|e| (e.key.clone(), e.last_access, e.size_bytes))
                .collect();
            candidates.sort_by_key(|(_, last_access, _)| *last_access);

            let Some((key, _, size)) = candidates.into_iter().next() else {
                // Presupuesto excedido pero nada evictable (todo fijado, o
                // una sola entrada mayor que el presupuesto). Nunca es un
                // error propagado: solo se registra.
                warn!(
                    "🚨 Presupuesto de caché excedido ({} > {}) y sin entradas evictables",
                    self.total_bytes.load(Ordering::SeqCst),
                    self.budget_bytes
                );
                return;
            };

            // el pin se re-verifica bajo el mismo shard que quita la
            // entrada: un lector que fijó la clave tras el snapshot la salva
            match self.entries.remove_if(&key, |k, _| !self.is_pinned(k)) {
                Some((_, entry)) => {
                    let _ = tokio::fs::remove_file(&entry.path).await;
                    self.total_bytes.fetch_sub(size, Ordering::SeqCst);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    self.pins.remove_if(&key, |_, p| p.load(Ordering::SeqCst) == 0);
                    debug!("🗑️ Evictado del caché: {} ({} bytes)", key, size);
                }
                None => {
                    debug!("🔒 Eviction aplazada, la entrada quedó fijada: {}", key);
                }
            }
        }
    }

    fn is_pinned(&self, key: &str) -> bool {
        self.pins
            .get(key)
            .map(|p| p.load(Ordering::SeqCst) > 0)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
            total_bytes: self.total_bytes(),
        }
    }
}
