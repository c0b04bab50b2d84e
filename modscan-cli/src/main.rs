// modscan-cli
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Thin external driver: argv parsing, file/stdin traversal, and wiring a
//! [`TerminalReporter`] to `modscan-core`. The core never sees a `Path`,
//! an argv, or a terminal; this binary is the only place those concerns
//! live.

mod reporter;

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead};

use clap::{ArgAction, Parser};
use log::{error, info};

use modscan_core::io::{ByteReader, ReadBytes};
use modscan_core::registry::FormatHandler;
use modscan_core::{register_all, render_archive, render_module, LoaderRegistry, ParseError, ParsedArtifact, ScanConfig};

use reporter::TerminalReporter;

#[derive(Parser, Debug)]
#[command(
    name = "modscan",
    version,
    about = "Dump structural information about module(s) in various tracker and archive formats."
)]
struct Cli {
    /// Suppress text output. Overrides dumping flags.
    #[arg(short = 'q')]
    quiet: bool,

    /// Dump description. N=1 (optional) enables, N=0 disables (default).
    #[arg(short = 'd', num_args = 0..=1, default_missing_value = "1", value_name = "N")]
    descriptions: Option<i64>,

    /// Dump sample info. N=1 (optional) enables, N=0 disables (default).
    #[arg(short = 's', num_args = 0..=1, default_missing_value = "1", value_name = "N")]
    samples: Option<i64>,

    /// Dump patterns. N=1 enables, N=2 additionally dumps full row data.
    #[arg(short = 'p', num_args = 0..=1, default_missing_value = "1", value_name = "N")]
    patterns: Option<i64>,

    /// Enable/disable all dump vars at a given level (if not provided, N=1).
    #[arg(short = 'a', num_args = 0..=1, default_missing_value = "1", value_name = "N")]
    all: Option<i64>,

    /// Highlight data in pattern dump: 'C:#[,...]' where C is n/s/i/v/e/x/p.
    #[arg(short = 'H', value_name = "SPEC")]
    highlight: Option<String>,

    /// Filter by format loader extension and/or tag; comma separated or repeatable.
    #[arg(short = 'f', value_name = "EXT-OR-TAG", action = ArgAction::Append)]
    filter: Vec<String>,

    /// Input files. A bare '-' reads additional filenames from stdin, one
    /// per line; only the first '-' triggers a read.
    #[arg(value_name = "FILE")]
    inputs: Vec<String>,
}

fn apply_descriptions(config: &mut ScanConfig, level: i64) {
    config.dump_descriptions = level >= 1;
}

fn apply_samples(config: &mut ScanConfig, level: i64) {
    config.dump_samples = level >= 1;
    config.dump_samples_extra = level >= 2;
}

fn apply_patterns(config: &mut ScanConfig, level: i64) {
    config.dump_patterns = level >= 1;
    config.dump_pattern_rows = level >= 2;
}

fn highlight_bit(kind: char) -> u32 {
    match kind.to_ascii_lowercase() {
        'n' => 1 << 0,
        's' | 'i' => 1 << 1,
        'v' => 1 << 2,
        'e' | 'x' => 1 << 3,
        'p' => 1 << 4,
        _ => 0,
    }
}

/// Parses the `-H` highlight spec: a comma-separated list of `C:#` terms
/// where `C` names the column (note/instrument/volume/effect/param) and
/// `#` is the decimal value to highlight.
fn apply_highlight(config: &mut ScanConfig, spec: &str) -> Result<(), String> {
    for term in spec.split(',') {
        let term = term.trim();
        if term.is_empty() {
            return Err(format!("empty highlight term in '{}'", spec));
        }

        let mut chars = term.chars();
        let kind = chars.next().ok_or_else(|| format!("missing column type in '{}'", term))?;
        if !matches!(kind.to_ascii_lowercase(), 'n' | 's' | 'i' | 'v' | 'e' | 'x' | 'p') {
            return Err(format!("unknown highlight column type '{}'", kind));
        }

        let rest: String = chars.collect();
        let value = rest
            .strip_prefix(':')
            .ok_or_else(|| format!("expected ':' after column type in '{}'", term))?;
        let idx: u16 = value.parse().map_err(|_| format!("invalid highlight value '{}'", value))?;
        if idx > 255 {
            return Err(format!("highlight value {} out of range", idx));
        }

        config.highlight[idx as usize] = true;
        config.highlight_mask |= highlight_bit(kind);
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<ScanConfig, String> {
    let mut config = ScanConfig::default();

    if let Some(level) = cli.all {
        apply_descriptions(&mut config, level);
        apply_samples(&mut config, level);
        apply_patterns(&mut config, level);
    }
    if let Some(level) = cli.descriptions {
        apply_descriptions(&mut config, level);
    }
    if let Some(level) = cli.samples {
        apply_samples(&mut config, level);
    }
    if let Some(level) = cli.patterns {
        apply_patterns(&mut config, level);
    }
    if let Some(spec) = &cli.highlight {
        apply_highlight(&mut config, spec)?;
    }
    if cli.quiet {
        apply_descriptions(&mut config, 0);
        apply_samples(&mut config, 0);
        apply_patterns(&mut config, 0);
        config.quiet = true;
    }

    Ok(config)
}

fn normalized_filters(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|f| f.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn handler_matches(handler: &dyn FormatHandler, filters: &[String]) -> bool {
    filters.is_empty()
        || filters.iter().any(|f| {
            handler.tag().eq_ignore_ascii_case(f) || handler.name().to_ascii_lowercase() == *f
        })
}

/// Mirrors `LoaderRegistry::try_load`'s rewind-and-retry dispatch, but
/// restricted to handlers the `-f` filter admits and returning the
/// winning handler's name for error reporting.
fn dispatch(
    registry: &LoaderRegistry,
    reader: &mut ByteReader<'_>,
    filters: &[String],
) -> modscan_core::Result<(&'static str, &'static str, ParsedArtifact)> {
    let start = reader.position();
    for handler in registry.handlers() {
        if !handler_matches(handler.as_ref(), filters) {
            continue;
        }
        reader.seek(start)?;
        match handler.accept_and_parse(reader) {
            Ok(artifact) => return Ok((handler.name(), handler.tag(), artifact)),
            Err(ParseError::NotRecognized) => continue,
            Err(other) => return Err(other),
        }
    }
    Err(ParseError::NotRecognized)
}

fn collect_inputs(raw: &[String]) -> Vec<String> {
    let mut files = Vec::new();
    let mut stdin_consumed = false;

    for input in raw {
        if input == "-" {
            if !stdin_consumed {
                stdin_consumed = true;
                let stdin = io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        files.push(trimmed.to_string());
                    }
                }
            }
            continue;
        }
        files.push(input.clone());
    }

    files
}

fn print_usage_and_formats(registry: &LoaderRegistry) {
    println!("Dump information about module(s) in various module formats.\n");
    println!("Usage:\n  modscan [options] [filename.ext...]\n");
    println!("Supported formats:");
    for handler in registry.handlers() {
        println!(" * {} ({})", handler.name(), handler.tag());
    }
    println!();
}

fn check_one(
    path: &str,
    registry: &LoaderRegistry,
    filters: &[String],
    config: &ScanConfig,
    reporter: &mut TerminalReporter,
    handler_counts: &mut HashMap<&'static str, u64>,
) -> bool {
    reporter.line("File", path);

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("failed to open '{}': {}", path, err);
            reporter.error(&format!("failed to open '{}': {}", path, err));
            return false;
        }
    };

    let mut file_reader = ByteReader::new(&bytes);
    match dispatch(registry, &mut file_reader, filters) {
        Ok((name, tag, artifact)) => {
            *handler_counts.entry(tag).or_insert(0) += 1;
            info!("'{}' recognized as {}", path, name);
            match artifact {
                ParsedArtifact::Module(module) => render_module(&module, reporter, config),
                ParsedArtifact::Archive(archive) => render_archive(&archive, reporter, config),
            }
            true
        }
        Err(ParseError::NotRecognized) => {
            reporter.error("unknown format.");
            false
        }
        Err(other) => {
            error!("'{}': {}", path, other);
            reporter.error(&other.to_string());
            false
        }
    }
}

fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(-1);
        }
    };

    let registry = register_all();

    if cli.inputs.is_empty() {
        print_usage_and_formats(&registry);
        std::process::exit(0);
    }

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("modscan: {}", msg);
            std::process::exit(-1);
        }
    };

    let filters = normalized_filters(&cli.filter);
    let files = collect_inputs(&cli.inputs);

    let mut reporter = TerminalReporter::new();
    let mut handler_counts: HashMap<&'static str, u64> = HashMap::new();
    let mut attempted = 0u64;
    let mut succeeded = 0u64;

    for path in &files {
        attempted += 1;
        if check_one(path, &registry, &filters, &config, &mut reporter, &mut handler_counts) {
            succeeded += 1;
        }
    }

    for handler in registry.handlers() {
        let count = handler_counts.get(handler.tag()).copied().unwrap_or(0);
        handler.report_global_stats(&mut reporter, count);
    }

    let ret = if attempted > 0 && succeeded == 0 { 1 } else { 0 };
    std::process::exit(ret);
}
