// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reporter the core renders into. Kept deliberately narrow and
//! opaque — the core only ever calls these methods, never owns a
//! terminal, a file, or a table library. A concrete implementation
//! (`modscan-cli`'s `TerminalReporter`) lives outside this crate.

/// Formatting hint for one column of a [`Reporter::table`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatHint {
    Decimal,
    Hex,
    ZeroPadded(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub header: &'static str,
    pub width: usize,
    pub align: Align,
    pub format: FormatHint,
}

impl ColumnSpec {
    pub fn new(header: &'static str, width: usize, align: Align, format: FormatHint) -> Self {
        ColumnSpec { header, width, align, format }
    }
}

/// Sink for structural findings. Every method takes already-formatted
/// strings or plain data; no method returns a value the core depends on.
pub trait Reporter {
    /// A labeled one-line field, e.g. `line("Type", "Protracker M.K.")`.
    fn line(&mut self, label: &str, text: &str);

    fn warning(&mut self, text: &str);
    fn error(&mut self, text: &str);

    /// The comma-joined labels of a module's observed [`crate::usage::Feature`]s.
    fn uses(&mut self, labels: &[&str]);

    /// An aligned table; `columns` describes layout, `rows` is the cell
    /// text already formatted by the caller per `columns[i].format`.
    fn table(&mut self, columns: &[ColumnSpec], rows: &[Vec<String>]);

    /// An inline list of byte-valued order numbers.
    fn orders(&mut self, label: &str, values: &[u8]);

    /// Begins a pattern section; `bytes` is the declared packed size if
    /// the source format recorded one.
    fn pattern_summary(&mut self, index: usize, channels: usize, rows: usize, bytes: Option<usize>);

    /// Emits one fully decoded pattern row. Only called when the caller's
    /// `ScanConfig::dump_pattern_rows` is set.
    fn pattern_row(&mut self, row: usize, cells: &[String]);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingReporter {
        lines: Vec<(String, String)>,
    }

    impl Reporter for RecordingReporter {
        fn line(&mut self, label: &str, text: &str) {
            self.lines.push((label.to_string(), text.to_string()));
        }
        fn warning(&mut self, _: &str) {}
        fn error(&mut self, _: &str) {}
        fn uses(&mut self, _: &[&str]) {}
        fn table(&mut self, _: &[ColumnSpec], _: &[Vec<String>]) {}
        fn orders(&mut self, _: &str, _: &[u8]) {}
        fn pattern_summary(&mut self, _: usize, _: usize, _: usize, _: Option<usize>) {}
        fn pattern_row(&mut self, _: usize, _: &[String]) {}
    }

    #[test]
    fn line_is_recorded_verbatim() {
        let mut r = RecordingReporter { lines: Vec::new() };
        r.line("Type", "Protracker M.K.");
        assert_eq!(r.lines[0], ("Type".to_string(), "Protracker M.K.".to_string()));
    }
}
