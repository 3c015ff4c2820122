use thiserror::Error;

/// Fallo de un proveedor individual dentro de la cadena de resolución
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub provider: &'static str,
    pub reason: String,
    /// Coincide con una firma conocida de extractor roto (solo observabilidad)
    pub extractor_broken: bool,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.provider, self.reason)
    }
}

/// Taxonomía de errores del núcleo de reproducción
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("proveedor '{provider}' falló: {reason}")]
    ProviderUnavailable {
        provider: &'static str,
        reason: String,
    },

    #[error("todos los proveedores fallaron ({0:?})")]
    AllProvidersFailed(Vec<ProviderFailure>),

    #[error("no hay ningún formato de audio utilizable")]
    NoSuitableFormat,

    #[error("stream interrumpido tras {attempts} reintentos: {reason}")]
    StreamInterrupted { attempts: u32, reason: String },

    #[error("fallo al escribir en caché: {0}")]
    CacheWriteFailed(String),

    #[error("el transporte de voz está cerrado")]
    VoiceTransportClosed,

    #[error("cola llena (máximo {max} elementos)")]
    QueueFull { max: usize },

    #[error("índice de cola fuera de rango")]
    QueueIndexOutOfRange,

    #[error("respuesta de proveedor no parseable: {0}")]
    ProviderParse(String),

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    /// Convierte cualquier error en un fallo de proveedor con nombre
    pub fn provider(provider: &'static str, err: impl std::fmt::Display) -> Self {
        Self::ProviderUnavailable {
            provider,
            reason: err.to_string(),
        }
    }
}
