// modscan-cli
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! A terminal-printing [`Reporter`], the only concrete implementation this
//! workspace ships. `modscan-core` never depends on this module; it is
//! wired in here, the driver side, so the core stays free of any table
//! library or notion of a terminal.

use modscan_core::report::{Align, ColumnSpec, Reporter};
use prettytable::{format, Attr, Cell, Row, Table};

/// Stateless terminal sink. All methods print directly; nothing here
/// buffers across calls, matching the per-file, print-as-you-go shape of
/// the original dumper this driver replaces.
pub struct TerminalReporter;

impl TerminalReporter {
    pub fn new() -> Self {
        TerminalReporter
    }
}

impl Default for TerminalReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn alignment(align: Align) -> format::Alignment {
    match align {
        Align::Left => format::Alignment::LEFT,
        Align::Right => format::Alignment::RIGHT,
    }
}

impl Reporter for TerminalReporter {
    fn line(&mut self, label: &str, text: &str) {
        println!("  {:<14}: {}", label, text);
    }

    fn warning(&mut self, text: &str) {
        eprintln!("  [warning] {}", text);
    }

    fn error(&mut self, text: &str) {
        eprintln!("  [error] {}", text);
    }

    fn uses(&mut self, labels: &[&str]) {
        if !labels.is_empty() {
            println!("  {:<14}: {}", "Uses", labels.join(", "));
        }
    }

    fn table(&mut self, columns: &[ColumnSpec], rows: &[Vec<String>]) {
        if rows.is_empty() {
            return;
        }

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);

        let header: Vec<Cell> = columns
            .iter()
            .map(|c| Cell::new_align(c.header, alignment(c.align)).with_style(Attr::Bold))
            .collect();
        table.add_row(Row::new(header));

        for row in rows {
            let cells: Vec<Cell> = row
                .iter()
                .zip(columns.iter())
                .map(|(text, col)| Cell::new_align(text, alignment(col.align)))
                .collect();
            table.add_row(Row::new(cells));
        }

        table.printstd();
    }

    fn orders(&mut self, label: &str, values: &[u8]) {
        let rendered: String = values
            .iter()
            .map(|v| match *v {
                0xff => "--".to_string(),
                0xfe => "++".to_string(),
                n => format!("{:02x}", n),
            })
            .collect::<Vec<_>>()
            .join(" ");
        println!("  {:<14}: {}", label, rendered);
    }

    fn pattern_summary(&mut self, index: usize, channels: usize, rows: usize, bytes: Option<usize>) {
        match bytes {
            Some(b) => println!("Pattern {:>3}: {} channels, {} rows, {} bytes packed", index, channels, rows, b),
            None => println!("Pattern {:>3}: {} channels, {} rows", index, channels, rows),
        }
    }

    fn pattern_row(&mut self, row: usize, cells: &[String]) {
        println!("{:>4} | {}", row, cells.join(" | "));
    }
}
