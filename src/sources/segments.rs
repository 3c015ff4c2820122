//! Rangos de salto (SponsorBlock y similares). El núcleo solo los consume:
//! la consulta real vive en un colaborador externo y nunca bloquea la
//! reproducción: ante cualquier fallo se reproduce sin saltos.

use async_trait::async_trait;
use std::time::Duration;

use super::TrackReference;

/// Rango de segundos a omitir durante la reproducción
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkipRange {
    pub start_secs: f64,
    pub end_secs: f64,
}

impl SkipRange {
    pub fn new(start_secs: f64, end_secs: f64) -> Self {
        Self {
            start_secs,
            end_secs,
        }
    }

    pub fn contains(&self, position: Duration) -> bool {
        let secs = position.as_secs_f64();
        secs >= self.start_secs && secs < self.end_secs
    }
}

/// Proveedor de rangos de salto. Infalible por contrato: lista vacía cuando
/// la consulta falla o está deshabilitada.
#[async_trait]
pub trait SegmentSkipProvider: Send + Sync {
    async fn skip_ranges(&self, reference: &TrackReference) -> Vec<SkipRange>;
}

/// Implementación nula: saltos deshabilitados por configuración
pub struct DisabledSegments;

#[async_trait]
impl SegmentSkipProvider for DisabledSegments {
    async fn skip_ranges(&self, _reference: &TrackReference) -> Vec<SkipRange> {
        Vec::new()
    }
}

/// Acota en tiempo a un proveedor real (p. ej. el colaborador de
/// SponsorBlock): si la consulta no responde dentro del plazo, se reproduce
/// sin saltos.
pub struct BoundedSegments {
    inner: std::sync::Arc<dyn SegmentSkipProvider>,
    timeout: Duration,
}

impl BoundedSegments {
    pub fn new(inner: std::sync::Arc<dyn SegmentSkipProvider>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl SegmentSkipProvider for BoundedSegments {
    async fn skip_ranges(&self, reference: &TrackReference) -> Vec<SkipRange> {
        match tokio::time::timeout(self.timeout, self.inner.skip_ranges(reference)).await {
            Ok(ranges) => ranges,
            Err(_) => {
                tracing::warn!(
                    "⏰ Consulta de segmentos superó {:?}; reproduciendo sin saltos",
                    self.timeout
                );
                Vec::new()
            }
        }
    }
}

/// Normaliza la lista cruda de un proveedor: descarta rangos inválidos,
/// ordena por inicio y fusiona solapes. El pipeline asume no-solapados y
/// ascendentes.
pub fn normalize(mut ranges: Vec<SkipRange>) -> Vec<SkipRange> {
    ranges.retain(|r| r.end_secs > r.start_secs && r.start_secs >= 0.0);
    ranges.sort_by(|a, b| a.start_secs.total_cmp(&b.start_secs));

    let mut merged: Vec<SkipRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start_secs <= last.end_secs => {
                last.end_secs = last.end_secs.max(range.end_secs);
            }
            _ => merged.push(range),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_sorts_merges_and_drops_invalid() {
        let ranges = vec![
            SkipRange::new(30.0, 45.0),
            SkipRange::new(10.0, 20.0),
            SkipRange::new(15.0, 25.0),
            SkipRange::new(50.0, 50.0),
            SkipRange::new(-5.0, 3.0),
        ];
        let normalized = normalize(ranges);
        assert_eq!(
            normalized,
            vec![SkipRange::new(10.0, 25.0), SkipRange::new(30.0, 45.0)]
        );
    }

    #[test]
    fn contains_is_half_open() {
        let range = SkipRange::new(10.0, 20.0);
        assert!(range.contains(Duration::from_secs(10)));
        assert!(range.contains(Duration::from_secs_f64(19.99)));
        assert!(!range.contains(Duration::from_secs(20)));
        assert!(!range.contains(Duration::from_secs(9)));
    }

    #[tokio::test]
    async fn bounded_provider_times_out_to_empty() {
        struct Slow;

        #[async_trait]
        impl SegmentSkipProvider for Slow {
            async fn skip_ranges(&self, _reference: &TrackReference) -> Vec<SkipRange> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                vec![SkipRange::new(1.0, 2.0)]
            }
        }

        let bounded = BoundedSegments::new(std::sync::Arc::new(Slow), Duration::from_millis(20));
        let ranges = bounded
            .skip_ranges(&TrackReference::new("https://youtu.be/abc"))
            .await;
        assert!(ranges.is_empty());
    }

    #[tokio::test]
    async fn bounded_provider_passes_ranges_through() {
        struct Fast;

        #[async_trait]
        impl SegmentSkipProvider for Fast {
            async fn skip_ranges(&self, _reference: &TrackReference) -> Vec<SkipRange> {
                vec![SkipRange::new(10.0, 20.0)]
            }
        }

        let bounded = BoundedSegments::new(std::sync::Arc::new(Fast), Duration::from_secs(5));
        let ranges = bounded
            .skip_ranges(&TrackReference::new("https://youtu.be/abc"))
            .await;
        assert_eq!(ranges, vec![SkipRange::new(10.0, 20.0)]);
    }

    #[tokio::test]
    async fn disabled_provider_returns_empty() {
        let provider = DisabledSegments;
        let ranges = provider
            .skip_ranges(&TrackReference::new("https://youtu.be/abc"))
            .await;
        assert!(ranges.is_empty());
    }
}
