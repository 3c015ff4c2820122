//! Motor de reproducción: cola por guild, máquina de estados del player y
//! el pipeline que troza PCM en frames para el transporte de voz.

pub mod pipeline;
pub mod player;
pub mod queue;
pub mod registry;

pub use pipeline::{AudioPipeline, Decoder, FfmpegDecoder, PipelineSettings, VolumeControl};
pub use player::{
    GuildPlayer, HttpFetcher, PlayerDeps, PlayerSettings, PlayerState, RecentResolutions,
    StreamFetcher,
};
pub use queue::{PlayQueue, QueueInfo, QueueItem};
pub use registry::PlayerRegistry;
