//! Núcleo de reproducción de audio para canales de voz de Discord.
//!
//! Resuelve referencias de tracks contra múltiples proveedores con
//! fallback, cachea los streams en disco bajo un presupuesto LRU y conduce
//! una máquina de estados de reproducción por guild que emite frames PCM
//! hacia el transporte de voz del host.

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod voice;

pub use audio::{GuildPlayer, PlayerRegistry, PlayerState};
pub use cache::CacheStore;
pub use config::Config;
pub use error::PlayerError;
pub use sources::{ResolvedStream, SourceResolver, TrackReference};
