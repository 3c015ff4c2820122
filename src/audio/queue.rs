use chrono::{DateTime, Utc};
use serenity::model::id::UserId;
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use crate::error::PlayerError;
use crate::sources::TrackReference;

/// Entrada de la cola: la referencia a resolver más metadatos de quién y
/// cuándo la pidió.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub reference: TrackReference,
    pub requested_by: UserId,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(reference: TrackReference, requested_by: UserId) -> Self {
        Self {
            reference,
            requested_by,
            enqueued_at: Utc::now(),
        }
    }
}

/// Instantánea de la cola para mostrar al usuario
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub length: usize,
    pub total_duration: Option<Duration>,
    pub items: Vec<QueueItem>,
}

/// Cola de reproducción por guild. FIFO estricto: primero en entrar,
/// primero en sonar.
#[derive(Debug)]
pub struct PlayQueue {
    items: VecDeque<QueueItem>,
    max_size: usize,
}

impl PlayQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega un track al final; falla si la cola está llena
    pub fn push(&mut self, item: QueueItem) -> Result<usize, PlayerError> {
        if self.items.len() >= self.max_size {
            return Err(PlayerError::QueueFull { max: self.max_size });
        }

        info!("➕ Agregado a la cola: {}", item.reference.query());
        self.items.push_back(item);
        Ok(self.items.len())
    }

    /// Siguiente track en orden FIFO estricto
    pub fn pop_front(&mut self) -> Option<QueueItem> {
        let next = self.items.pop_front();
        if let Some(ref item) = next {
            info!("➡️ Siguiente en cola: {}", item.reference.query());
        } else {
            debug!("📭 Cola vacía, no hay siguiente track");
        }
        next
    }

    /// Mueve el elemento en `from` a la posición `to` (índices 0-based)
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<(), PlayerError> {
        if from >= self.items.len() || to >= self.items.len() {
            return Err(PlayerError::QueueIndexOutOfRange);
        }
        if from == to {
            return Ok(());
        }
        let item = self
            .items
            .remove(from)
            .ok_or(PlayerError::QueueIndexOutOfRange)?;
        info!(
            "↕️ Movido en la cola: {} ({} → {})",
            item.reference.query(),
            from,
            to
        );
        self.items.insert(to, item);
        Ok(())
    }

    /// Elimina y devuelve el elemento en `index`
    pub fn remove_track(&mut self, index: usize) -> Result<QueueItem, PlayerError> {
        let removed = self
            .items
            .remove(index)
            .ok_or(PlayerError::QueueIndexOutOfRange)?;
        info!("🗑️ Eliminado de la cola: {}", removed.reference.query());
        Ok(removed)
    }

    /// Vacía la cola
    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            info!("🗑️ Cola limpiada ({} elementos)", self.items.len());
        }
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Instantánea con la duración total conocida. `None` cuando algún track
    /// no declara duración (la suma sería engañosa).
    pub fn info(&self) -> QueueInfo {
        let total_duration = self
            .items
            .iter()
            .map(|item| item.reference.duration_hint())
            .collect::<Option<Vec<Duration>>>()
            .map(|durations| durations.into_iter().sum());

        QueueInfo {
            length: self.items.len(),
            total_duration,
            items: self.items.iter().cloned().collect(),
        }
    }
}
