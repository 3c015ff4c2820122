use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tracing::{debug, info};

use crate::audio::player::{GuildPlayer, PlayerDeps};
use crate::voice::VoiceTransport;

/// Arena de players: exactamente un `GuildPlayer` por guild activo. Todas
/// las dependencias pesadas (resolver, caché, HTTP) se comparten.
pub struct PlayerRegistry {
    players: DashMap<GuildId, Arc<GuildPlayer>>,
    deps: Arc<PlayerDeps>,
}

impl PlayerRegistry {
    pub fn new(deps: Arc<PlayerDeps>) -> Self {
        Self {
            players: DashMap::new(),
            deps,
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildPlayer>> {
        self.players.get(&guild_id).map(|p| Arc::clone(&p))
    }

    /// Devuelve el player del guild, creándolo si no existe. El transporte
    /// solo se usa en la creación; llamadas posteriores conservan el actual.
    pub fn get_or_create(
        &self,
        guild_id: GuildId,
        transport: Arc<dyn VoiceTransport>,
    ) -> Arc<GuildPlayer> {
        let player = self
            .players
            .entry(guild_id)
            .or_insert_with(|| {
                info!("🎛️ Player creado para guild {}", guild_id);
                Arc::new(GuildPlayer::new(guild_id, Arc::clone(&self.deps), transport))
            })
            .clone();
        player
    }

    /// Desmonta el player del guild: cancela su reproducción y lo olvida
    pub fn remove(&self, guild_id: GuildId) {
        if let Some((_, player)) = self.players.remove(&guild_id) {
            player.shutdown();
            debug!("🗑️ Player desmontado para guild {}", guild_id);
        }
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn guild_ids(&self) -> Vec<GuildId> {
        self.players.iter().map(|p| *p.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pipeline::FfmpegDecoder;
    use crate::audio::player::{PlayerSettings, RecentResolutions, StreamFetcher};
    use crate::cache::CacheStore;
    use crate::error::PlayerError;
    use crate::sources::segments::DisabledSegments;
    use crate::sources::SourceResolver;
    use crate::voice::ChannelTransport;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    struct NoFetcher;

    #[async_trait]
    impl StreamFetcher for NoFetcher {
        async fn fetch(
            &self,
            _url: &str,
        ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>, PlayerError> {
            Err(PlayerError::CacheWriteFailed("sin red".to_string()))
        }
    }

    async fn registry() -> (PlayerRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(
            CacheStore::open(dir.path().join("cache"), 1024, Duration::from_secs(60))
                .await
                .unwrap(),
        );
        let deps = Arc::new(PlayerDeps {
            resolver: Arc::new(SourceResolver::new(vec![], Duration::from_secs(5))),
            cache,
            segments: Arc::new(DisabledSegments),
            decoder: Arc::new(FfmpegDecoder::new()),
            fetcher: Arc::new(NoFetcher),
            settings: PlayerSettings::default(),
            recent: RecentResolutions::default(),
        });
        (PlayerRegistry::new(deps), dir)
    }

    #[tokio::test]
    async fn one_player_per_guild() {
        let (registry, _dir) = registry().await;
        let (t1, _r1) = ChannelTransport::new(4);
        let (t2, _r2) = ChannelTransport::new(4);

        let a = registry.get_or_create(GuildId::new(1), Arc::new(t1));
        let b = registry.get_or_create(GuildId::new(1), Arc::new(t2));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_forgets_the_player() {
        let (registry, _dir) = registry().await;
        let (transport, _rx) = ChannelTransport::new(4);
        registry.get_or_create(GuildId::new(7), Arc::new(transport));
        assert_eq!(registry.len(), 1);

        registry.remove(GuildId::new(7));
        assert!(registry.get(GuildId::new(7)).is_none());
        assert!(registry.is_empty());

        // remover un guild desconocido es inofensivo
        registry.remove(GuildId::new(99));
    }
}
