// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Options the caller passes into a parse/render pass. Mirrors the toggle
//! surface the CLI driver exposes, kept independent of `clap` so the core
//! has no dependency on any particular argument parser.

/// Per-value-kind highlight map used by pattern-row rendering. Index is the
/// raw event byte value (0..=255); a set bit means "draw this value
/// distinctly".
pub const HIGHLIGHT_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Include module/song descriptive text.
    pub dump_descriptions: bool,
    /// Emit sample tables.
    pub dump_samples: bool,
    /// Emit sample tables with extended (loop/pan/extra) columns.
    pub dump_samples_extra: bool,
    /// Emit per-pattern summary lines.
    pub dump_patterns: bool,
    /// Emit full row-by-row event grids.
    pub dump_pattern_rows: bool,
    /// Suppress normal lines; warnings and errors still emit.
    pub quiet: bool,
    /// Bitmask selecting which value kinds participate in highlighting.
    pub highlight_mask: u32,
    /// Per-byte-value highlight table used when rendering pattern rows.
    pub highlight: [bool; HIGHLIGHT_LEN],
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            dump_descriptions: false,
            dump_samples: false,
            dump_samples_extra: false,
            dump_patterns: false,
            dump_pattern_rows: false,
            quiet: false,
            highlight_mask: 0,
            highlight: [false; HIGHLIGHT_LEN],
        }
    }
}

impl ScanConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highlighted(&self, value: u8) -> bool {
        self.highlight[value as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_quiet_by_feature_not_by_output() {
        let cfg = ScanConfig::default();
        assert!(!cfg.quiet);
        assert!(!cfg.dump_pattern_rows);
        assert!(!cfg.highlighted(0x80));
    }
}
