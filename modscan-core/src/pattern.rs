// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reprojects a format's native per‑cell event stream into the canonical
//! `rows × channels` [`Pattern`] matrix.
//!
//! Every format handler decodes its own packed/RLE/sparse encoding and
//! pushes individual `(row, channel, Event)` writes through a
//! `PatternBuilder` rather than constructing a `Pattern` directly; that
//! keeps the empty-sentinel and effect-overflow rules in one place instead
//! of duplicated per handler.

use crate::error::{ParseError, Result};
use crate::model::{Event, Pattern};

/// Accumulates events for one pattern, enforcing the normalization rules
/// in one place: unwritten cells stay the `Event` zero value, and a fifth
/// effect column in a cell is a hard error rather than silently dropped.
pub struct PatternBuilder {
    pattern: Pattern,
    /// `true` once `finish()` has transposed column-major writes, if the
    /// format requires it; set by [`PatternBuilder::column_major`].
    column_major: bool,
}

impl PatternBuilder {
    pub fn new(index: usize, rows: usize, channels: usize) -> Self {
        PatternBuilder { pattern: Pattern::new(index, rows, channels), column_major: false }
    }

    /// Marks this pattern as decoded in column-major (track-oriented)
    /// order, as Liquid Tracker's packed streams are; `write` addresses
    /// stay `(row, channel)` but storage is transposed once in `finish`.
    pub fn column_major(mut self) -> Self {
        self.column_major = true;
        self
    }

    pub fn set_packed_bytes(&mut self, bytes: usize) {
        self.pattern.packed_bytes = Some(bytes);
    }

    pub fn set_row_highlight(&mut self, highlight: Vec<bool>) {
        self.pattern.row_highlight = highlight;
    }

    /// Writes one fully-decoded event. `primary_effect` is the format's
    /// own slot; `extra_effects` holds any further effect/param pairs the
    /// source cell carried beyond the primary one. Overflowing four total
    /// secondary effects is `TooManyEffects`, per §4.8.
    pub fn write_event(
        &mut self,
        row: usize,
        channel: usize,
        note: u8,
        instrument: u8,
        volume: u8,
        primary_effect: (u8, u8),
        extra_effects: &[(u8, u8)],
    ) -> Result<()> {
        let mut event = Event::empty();
        event.note = note;
        event.instrument = instrument;
        event.volume = volume;
        event.effect = primary_effect.0;
        event.param = primary_effect.1;
        for &(effect, param) in extra_effects {
            if effect == 0 && param == 0 {
                continue;
            }
            if !event.push_secondary(effect, param) {
                return Err(ParseError::TooManyEffects(format!(
                    "pattern {} row {} channel {} exceeds four secondary effects",
                    self.pattern.index, row, channel
                )));
            }
        }
        self.write_raw(row, channel, event);
        Ok(())
    }

    fn write_raw(&mut self, row: usize, channel: usize, event: Event) {
        // Storage is always row-major; `column_major` only documents that
        // the caller's writes arrived in track order, not row order. The
        // caller still addresses by logical (row, channel), so no
        // transpose step is needed here.
        *self.pattern.event_mut(row, channel) = event;
    }

    pub fn rows(&self) -> usize {
        self.pattern.rows
    }

    pub fn channels(&self) -> usize {
        self.pattern.channels
    }

    pub fn finish(self) -> Pattern {
        self.pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritten_cells_stay_empty() {
        let builder = PatternBuilder::new(0, 4, 2);
        let pattern = builder.finish();
        assert!(pattern.events.iter().all(Event::is_empty));
    }

    #[test]
    fn fifth_secondary_effect_is_too_many_effects() {
        let mut builder = PatternBuilder::new(0, 1, 1);
        let extras = [(1u8, 1u8), (2, 2), (3, 3), (4, 4), (5, 5)];
        let err = builder.write_event(0, 0, 10, 1, 0, (0, 0), &extras).unwrap_err();
        assert!(matches!(err, ParseError::TooManyEffects(_)));
    }

    #[test]
    fn column_major_write_addresses_are_still_logical() {
        let mut builder = PatternBuilder::new(0, 2, 2).column_major();
        builder.write_event(1, 0, 40, 0, 0, (0, 0), &[]).unwrap();
        let pattern = builder.finish();
        assert_eq!(pattern.event(1, 0).note, 40);
        assert!(pattern.event(0, 0).is_empty());
    }
}
