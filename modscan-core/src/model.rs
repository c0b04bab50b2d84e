// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! The in-memory artifact a [`crate::registry::FormatHandler`] produces.
//!
//! `Module` is the root; it owns every `Instrument` and `Pattern` it
//! references and is never aliased after a parse completes. `Archive`
//! is the parallel root for container formats (LZX, ArcFS) that hold
//! other files rather than a song.

use crate::usage::UsageSet;

/// Canonical empty sentinel for every Event slot.
pub const EMPTY: u8 = 0;

/// Special note values recognized uniformly after normalization.
pub mod note {
    pub const CUT: u8 = 254;
    pub const OFF: u8 = 255;
    pub const FADE: u8 = 253;
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 119;
}

/// One cell of a pattern grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Event {
    pub note: u8,
    pub instrument: u8,
    pub volume: u8,
    pub effect: u8,
    /// The primary effect column's parameter byte.
    pub param: u8,
    /// Up to four additional effect columns some formats carry per cell,
    /// packed as (effect, param) pairs.
    pub secondary: [u8; 8],
    pub secondary_len: u8,
}

impl Event {
    pub fn empty() -> Self {
        Event::default()
    }

    pub fn is_empty(&self) -> bool {
        self.note == EMPTY
            && self.instrument == EMPTY
            && self.volume == EMPTY
            && self.effect == EMPTY
            && self.param == EMPTY
            && self.secondary_len == 0
    }

    /// Appends a secondary effect, truncating (never panicking) past the
    /// four-slot cap; the caller is responsible for raising
    /// `ParseError::TooManyEffects` when that happens.
    pub fn push_secondary(&mut self, effect: u8, param: u8) -> bool {
        if (self.secondary_len as usize) >= self.secondary.len() / 2 {
            return false;
        }
        let i = self.secondary_len as usize * 2;
        self.secondary[i] = effect;
        self.secondary[i + 1] = param;
        self.secondary_len += 1;
        true
    }
}

/// A rectangular grid of [`Event`]s, `rows * channels` long, row-major.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub index: usize,
    pub rows: usize,
    pub channels: usize,
    pub events: Vec<Event>,
    /// Per-row highlight bitmap (e.g. every 4th/16th row), if the source
    /// format declares one; otherwise empty.
    pub row_highlight: Vec<bool>,
    /// Declared packed size in bytes, retained only for reporting.
    pub packed_bytes: Option<usize>,
}

impl Pattern {
    pub fn new(index: usize, rows: usize, channels: usize) -> Self {
        Pattern {
            index,
            rows,
            channels,
            events: vec![Event::empty(); rows * channels],
            row_highlight: Vec::new(),
            packed_bytes: None,
        }
    }

    pub fn event(&self, row: usize, channel: usize) -> &Event {
        &self.events[row * self.channels + channel]
    }

    pub fn event_mut(&mut self, row: usize, channel: usize) -> &mut Event {
        &mut self.events[row * self.channels + channel]
    }
}

/// Discriminates the kind of sound source an [`Instrument`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    Sample,
    AdLib,
    Synth,
    Hybrid,
    IffOctaved,
    Midi,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    None,
    Forward,
    PingPong,
    Sustain,
    SustainPingPong,
}

/// An IT-style envelope: at most 25 (tick, value) nodes.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub enabled: bool,
    pub looping: bool,
    pub sustain: bool,
    pub carry: bool,
    pub filter_for_pitch: bool,
    pub nodes: Vec<(i8, u16)>,
    pub loop_start: u8,
    pub loop_end: u8,
    pub sustain_start: u8,
    pub sustain_end: u8,
}

/// FM operator bytes for an AdLib-kind instrument (S3M OPL2 layout: two
/// 12-byte operator blocks plus feedback/connection byte).
#[derive(Debug, Clone, Copy, Default)]
pub struct AdLibOperators {
    pub bytes: [u8; 12],
}

#[derive(Debug, Clone)]
pub struct Instrument {
    pub kind: InstrumentKind,
    pub display_name: String,
    pub file_name_hint: String,
    pub default_volume: u8,
    pub finetune: i8,
    pub panning: Option<u8>,
    pub loop_kind: LoopKind,
    pub loop_start: u32,
    pub loop_end: u32,
    pub length: u32,
    pub sample_rate: u32,
    pub envelopes: Vec<Envelope>,
    pub adlib: Option<AdLibOperators>,
    pub midi_channel: Option<u8>,
    pub midi_program: Option<u8>,
    /// Compressed-sample block statistics, populated for IT samples with
    /// the compression flag set (see `codecs::it_depacker`).
    pub compression: Option<CompressionStats>,
    /// Index into a shared sample-data pool; unique within one Module.
    pub sample_pool_index: Option<usize>,
}

impl Instrument {
    pub fn empty(kind: InstrumentKind) -> Self {
        Instrument {
            kind,
            display_name: String::new(),
            file_name_hint: String::new(),
            default_volume: 0,
            finetune: 0,
            panning: None,
            loop_kind: LoopKind::None,
            loop_start: 0,
            loop_end: 0,
            length: 0,
            sample_rate: 0,
            envelopes: Vec::new(),
            adlib: None,
            midi_channel: None,
            midi_program: None,
            compression: None,
            sample_pool_index: None,
        }
    }

    /// `0 <= loop_start <= loop_end <= length` whenever a loop flag is set.
    pub fn loop_invariant_holds(&self) -> bool {
        if self.loop_kind == LoopKind::None {
            true
        } else {
            self.loop_start <= self.loop_end && self.loop_end <= self.length
        }
    }
}

/// Per-sample statistics gathered while scanning an IT compressed sample;
/// the PCM payload itself is never materialized by this core.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionStats {
    pub compressed_bytes: u32,
    pub uncompressed_bytes: u32,
    pub smallest_block_bytes: u32,
    pub largest_block_bytes: u32,
    pub smallest_block_samples: u32,
}

/// How an order-sequence value was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEntry {
    Pattern(u16),
    EndOfSong,
    Skip,
    Invalid(u16),
}

/// The root parsed artifact for a tracker song.
#[derive(Debug, Clone)]
pub struct Module {
    pub magic: String,
    pub display_name: String,
    pub tracker_id: String,
    pub channels: usize,
    pub num_patterns: usize,
    pub num_instruments: usize,
    pub num_orders: usize,
    pub initial_tempo: u16,
    pub initial_speed: u16,
    pub orders: Vec<OrderEntry>,
    pub instruments: Vec<Instrument>,
    pub patterns: Vec<Pattern>,
    pub usage: UsageSet,
    pub warnings: Vec<String>,
}

impl Module {
    pub fn new(magic: impl Into<String>, tracker_id: impl Into<String>) -> Self {
        Module {
            magic: magic.into(),
            display_name: String::new(),
            tracker_id: tracker_id.into(),
            channels: 0,
            num_patterns: 0,
            num_instruments: 0,
            num_orders: 0,
            initial_tempo: 0,
            initial_speed: 0,
            orders: Vec::new(),
            instruments: Vec::new(),
            patterns: Vec::new(),
            usage: UsageSet::new(),
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// One entry in an archive's directory: a byte range in the backing buffer
/// plus whatever bookkeeping the archive format requires to decode it.
#[derive(Debug, Clone)]
pub struct EntryHeader {
    pub filename: String,
    pub comment: String,
    pub uncompressed_size: u32,
    pub compressed_size: u32,
    pub data_offset: usize,
    pub merged: bool,
    pub crc32: u32,
}

/// A contiguous run of [`EntryHeader`]s sharing one decompressed payload.
#[derive(Debug, Clone)]
pub struct MergeGroup {
    /// Indices into `Archive::entries`, in file order; the last index is
    /// the terminal, payload-owning entry.
    pub members: Vec<usize>,
}

/// The root parsed artifact for a container/archive format.
#[derive(Debug, Clone)]
pub struct Archive {
    pub format_tag: String,
    pub entries: Vec<EntryHeader>,
    pub merge_groups: Vec<MergeGroup>,
    pub usage: UsageSet,
    pub warnings: Vec<String>,
}

impl Archive {
    pub fn new(format_tag: impl Into<String>) -> Self {
        Archive {
            format_tag: format_tag.into(),
            entries: Vec::new(),
            merge_groups: Vec::new(),
            usage: UsageSet::new(),
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_is_empty_by_default() {
        assert!(Event::empty().is_empty());
    }

    #[test]
    fn push_secondary_truncates_at_four() {
        let mut ev = Event::empty();
        for i in 0..4u8 {
            assert!(ev.push_secondary(i, i));
        }
        assert!(!ev.push_secondary(9, 9));
        assert_eq!(ev.secondary_len, 4);
    }

    #[test]
    fn loop_invariant_checks_bounds() {
        let mut ins = Instrument::empty(InstrumentKind::Sample);
        ins.length = 100;
        ins.loop_kind = LoopKind::Forward;
        ins.loop_start = 10;
        ins.loop_end = 50;
        assert!(ins.loop_invariant_holds());
        ins.loop_end = 200;
        assert!(!ins.loop_invariant_holds());
    }

    #[test]
    fn pattern_indexing_is_row_major() {
        let mut p = Pattern::new(0, 2, 3);
        p.event_mut(1, 2).note = 60;
        assert_eq!(p.events[1 * 3 + 2].note, 60);
    }
}
