// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Renders a parsed [`Module`] or [`Archive`] into a [`Reporter`] per the
//! toggles in [`ScanConfig`]. This is the `Module.render(reporter,
//! config)` step of the control flow: the core owns it because it walks
//! the core's own types, even though the concrete `Reporter` the caller
//! supplies lives outside the crate.

use crate::config::ScanConfig;
use crate::model::{Archive, Event, Module, OrderEntry, Pattern};
use crate::report::{Align, ColumnSpec, FormatHint, Reporter};

fn order_byte(entry: &OrderEntry) -> u8 {
    match entry {
        OrderEntry::Pattern(p) => (*p).min(0xfd as u16) as u8,
        OrderEntry::EndOfSong => 0xff,
        OrderEntry::Skip => 0xfe,
        OrderEntry::Invalid(v) => (*v).min(0xff as u16) as u8,
    }
}

fn format_note(note: u8) -> String {
    match note {
        0 => "...".to_string(),
        crate::model::note::OFF => "OFF".to_string(),
        crate::model::note::CUT => "CUT".to_string(),
        crate::model::note::FADE => "FDE".to_string(),
        n => format!("{:03}", n),
    }
}

fn format_cell(event: &Event, config: &ScanConfig) -> String {
    let mut cell = format!(
        "{} {:02X} {:02X} {:02X}{:02X}",
        format_note(event.note),
        event.instrument,
        event.volume,
        event.effect,
        event.param
    );
    if config.highlighted(event.effect) {
        cell.push('*');
    }
    for i in 0..event.secondary_len as usize {
        cell.push_str(&format!(" +{:02X}{:02X}", event.secondary[i * 2], event.secondary[i * 2 + 1]));
    }
    cell
}

fn render_samples(module: &Module, reporter: &mut dyn Reporter, extra: bool) {
    let mut columns = vec![
        ColumnSpec::new("Name", 22, Align::Left, FormatHint::Decimal),
        ColumnSpec::new("Length", 10, Align::Right, FormatHint::Decimal),
        ColumnSpec::new("Vol", 4, Align::Right, FormatHint::Decimal),
    ];
    if extra {
        columns.push(ColumnSpec::new("LoopStart", 10, Align::Right, FormatHint::Decimal));
        columns.push(ColumnSpec::new("LoopEnd", 10, Align::Right, FormatHint::Decimal));
        columns.push(ColumnSpec::new("Rate", 8, Align::Right, FormatHint::Decimal));
    }

    let rows: Vec<Vec<String>> = module
        .instruments
        .iter()
        .map(|ins| {
            let mut row = vec![ins.display_name.clone(), ins.length.to_string(), ins.default_volume.to_string()];
            if extra {
                row.push(ins.loop_start.to_string());
                row.push(ins.loop_end.to_string());
                row.push(ins.sample_rate.to_string());
            }
            row
        })
        .collect();

    reporter.table(&columns, &rows);
}

fn render_patterns(module: &Module, reporter: &mut dyn Reporter, config: &ScanConfig) {
    for pattern in &module.patterns {
        reporter.pattern_summary(pattern.index, pattern.channels, pattern.rows, pattern.packed_bytes);
        if config.dump_pattern_rows {
            render_pattern_rows(pattern, reporter, config);
        }
    }
}

fn render_pattern_rows(pattern: &Pattern, reporter: &mut dyn Reporter, config: &ScanConfig) {
    for row in 0..pattern.rows {
        let cells: Vec<String> = (0..pattern.channels)
            .map(|ch| format_cell(pattern.event(row, ch), config))
            .collect();
        reporter.pattern_row(row, &cells);
    }
}

/// Renders one parsed module per the toggles in `config`.
pub fn render_module(module: &Module, reporter: &mut dyn Reporter, config: &ScanConfig) {
    if !config.quiet {
        if config.dump_descriptions {
            reporter.line("Name", &module.display_name);
        }
        reporter.line("Type", &module.tracker_id);
        reporter.line("Channels", &module.channels.to_string());
        reporter.line("Instruments", &module.num_instruments.to_string());
        reporter.line("Patterns", &module.num_patterns.to_string());
        reporter.line("Orders", &module.num_orders.to_string());
        reporter.line("Speed", &format!("{}/{}", module.initial_speed, module.initial_tempo));

        if !module.usage.is_empty() {
            reporter.uses(&module.usage.labels());
        }

        let order_bytes: Vec<u8> = module.orders.iter().map(order_byte).collect();
        reporter.orders("Orders", &order_bytes);
    }

    for warning in &module.warnings {
        reporter.warning(warning);
    }

    if config.dump_samples || config.dump_samples_extra {
        render_samples(module, reporter, config.dump_samples_extra);
    }

    if config.dump_patterns || config.dump_pattern_rows {
        render_patterns(module, reporter, config);
    }
}

/// Renders one parsed archive (LZX, ArcFS): one table row per entry plus
/// any warnings (CRC mismatches, unsupported merge groups) accumulated
/// during parsing.
pub fn render_archive(archive: &Archive, reporter: &mut dyn Reporter, config: &ScanConfig) {
    if !config.quiet {
        reporter.line("Type", &archive.format_tag);
        reporter.line("Entries", &archive.entries.len().to_string());
        if !archive.merge_groups.is_empty() {
            reporter.line("Merge groups", &archive.merge_groups.len().to_string());
        }
        if !archive.usage.is_empty() {
            reporter.uses(&archive.usage.labels());
        }

        let columns = [
            ColumnSpec::new("Name", 24, Align::Left, FormatHint::Decimal),
            ColumnSpec::new("Uncomp", 10, Align::Right, FormatHint::Decimal),
            ColumnSpec::new("Comp", 10, Align::Right, FormatHint::Decimal),
            ColumnSpec::new("CRC32", 8, Align::Right, FormatHint::Hex),
            ColumnSpec::new("Merged", 6, Align::Left, FormatHint::Decimal),
        ];
        let rows: Vec<Vec<String>> = archive
            .entries
            .iter()
            .map(|e| {
                vec![
                    e.filename.clone(),
                    e.uncompressed_size.to_string(),
                    e.compressed_size.to_string(),
                    format!("{:08x}", e.crc32),
                    if e.merged { "yes".to_string() } else { "no".to_string() },
                ]
            })
            .collect();
        reporter.table(&columns, &rows);
    }

    for warning in &archive.warnings {
        reporter.warning(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstrumentKind, Instrument};

    struct RecordingReporter {
        lines: Vec<(String, String)>,
        uses: Vec<String>,
        warnings: Vec<String>,
    }

    impl Reporter for RecordingReporter {
        fn line(&mut self, label: &str, text: &str) {
            self.lines.push((label.to_string(), text.to_string()));
        }
        fn warning(&mut self, text: &str) {
            self.warnings.push(text.to_string());
        }
        fn error(&mut self, _: &str) {}
        fn uses(&mut self, labels: &[&str]) {
            self.uses = labels.iter().map(|s| s.to_string()).collect();
        }
        fn table(&mut self, _: &[ColumnSpec], _: &[Vec<String>]) {}
        fn orders(&mut self, _: &str, _: &[u8]) {}
        fn pattern_summary(&mut self, _: usize, _: usize, _: usize, _: Option<usize>) {}
        fn pattern_row(&mut self, _: usize, _: &[String]) {}
    }

    #[test]
    fn quiet_suppresses_normal_lines_but_not_warnings() {
        let mut module = Module::new("MOD", "Protracker M.K.");
        module.warn("a truncated record");
        let mut config = ScanConfig::default();
        config.quiet = true;

        let mut reporter = RecordingReporter { lines: Vec::new(), uses: Vec::new(), warnings: Vec::new() };
        render_module(&module, &mut reporter, &config);

        assert!(reporter.lines.is_empty());
        assert_eq!(reporter.warnings, vec!["a truncated record".to_string()]);
    }

    #[test]
    fn non_quiet_emits_type_line() {
        let module = Module::new("MOD", "Protracker M.K.");
        let config = ScanConfig::default();

        let mut reporter = RecordingReporter { lines: Vec::new(), uses: Vec::new(), warnings: Vec::new() };
        render_module(&module, &mut reporter, &config);

        assert!(reporter.lines.contains(&("Type".to_string(), "Protracker M.K.".to_string())));
    }

    #[test]
    fn instrument_fixture_is_unused_placeholder_for_future_sample_table_tests() {
        // Keeps Instrument/InstrumentKind imports exercised; sample-table
        // rendering itself is covered via the CLI integration tests.
        let ins = Instrument::empty(InstrumentKind::Sample);
        assert_eq!(ins.length, 0);
    }
}
