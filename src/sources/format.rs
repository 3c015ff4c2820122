//! Selección determinista del mejor formato de audio para Discord.

use std::cmp::Reverse;

use super::FormatDescriptor;

/// Elige el mejor stream de audio de la lista cruda de un proveedor.
///
/// Política, en orden, gana el primer resultado no vacío:
/// 1. En vivo: cualquier formato solo-audio, mayor bitrate primero.
/// 2. Solo-audio opus/webm/48kHz, mayor bitrate primero.
/// 3. Cualquier formato solo-audio, bitrate de audio con fallback al total.
/// 4. Ninguno.
///
/// El orden es estable: ante empate de bitrate gana el que aparece primero
/// en la lista del proveedor.
pub fn select_best_audio(formats: &[FormatDescriptor], is_live: bool) -> Option<&FormatDescriptor> {
    if is_live {
        if let Some(best) = pick(formats, |f| f.is_audio_only()) {
            return Some(best);
        }
    }

    pick(formats, is_discord_native).or_else(|| pick(formats, |f| f.is_audio_only()))
}

/// opus/webm/48kHz: se reproduce en Discord sin retranscodificar
fn is_discord_native(f: &FormatDescriptor) -> bool {
    f.is_audio_only()
        && f.audio_codec.as_deref() == Some("opus")
        && f.container == "webm"
        && f.sample_rate_hz == Some(48_000)
}

fn pick<P>(formats: &[FormatDescriptor], predicate: P) -> Option<&FormatDescriptor>
where
    P: Fn(&FormatDescriptor) -> bool,
{
    let mut candidates: Vec<&FormatDescriptor> =
        formats.iter().filter(|f| predicate(f)).collect();
    // sort estable: el empate lo resuelve el orden original
    candidates.sort_by_key(|f| Reverse(f.effective_bitrate()));
    candidates.first().copied()
}
