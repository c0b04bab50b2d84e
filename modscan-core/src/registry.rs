// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! The loader registry: an ordered list of format handlers, tried in turn
//! against a rewindable reader until one accepts or all reject.
//!
//! The source this crate is modeled on historically registered handlers
//! through file-scope constructors that pushed themselves into a global
//! vector at an unspecified order relative to each other. That pattern
//! does not translate to a language without guaranteed static
//! initialization order, so here the registry is an explicit builder: each
//! format module exposes a free function returning a boxed handler, and
//! [`register_all`] composes them in one deterministic, documented order.

use crate::error::{ParseError, Result};
use crate::io::ByteReader;
use crate::model::{Archive, Module};
use crate::report::Reporter;

/// What a handler produced: a song (`Module`) or a container (`Archive`).
/// Kept as one enum rather than two parallel registries because the
/// registry's dispatch loop is identical either way.
pub enum ParsedArtifact {
    Module(Module),
    Archive(Archive),
}

/// Per-format parser. Each implementation MUST follow the five-phase
/// discipline: identify, header, directory, bodies, cross-checks; phase 1
/// must not commit any state visible after a `NotRecognized` return.
pub trait FormatHandler {
    /// Display name, e.g. "Impulse Tracker".
    fn name(&self) -> &'static str;

    /// One-to-three-letter tag, e.g. "IT".
    fn tag(&self) -> &'static str;

    fn accept_and_parse(&self, reader: &mut ByteReader<'_>) -> Result<ParsedArtifact>;

    /// Called once after the whole input batch is processed, with
    /// cumulative counters the driver tallied across files of this format.
    fn report_global_stats(&self, _reporter: &mut dyn Reporter, _file_count: u64) {}
}

/// Ordered list of [`FormatHandler`]s. Handlers with a strong fixed-ASCII
/// magic are ordered before handlers that only sniff heuristically
/// (15-sample Soundtracker, Coconizer), and any heuristic handler that is
/// known to collide with a stronger-signatured format must itself reject
/// that collision (see the STM handler's `SCRM`-at-offset-60 check).
pub struct LoaderRegistry {
    handlers: Vec<Box<dyn FormatHandler>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        LoaderRegistry { handlers: Vec::new() }
    }

    pub fn register(&mut self, handler: Box<dyn FormatHandler>) {
        self.handlers.push(handler);
    }

    pub fn handlers(&self) -> &[Box<dyn FormatHandler>] {
        &self.handlers
    }

    /// Tries each handler in registration order. Before each attempt the
    /// reader's position is saved and restored on `NotRecognized`; any
    /// other error is terminal and surfaced immediately. This is the only
    /// place in the crate allowed to rewind a reader.
    pub fn try_load(
        &self,
        reader: &mut ByteReader<'_>,
    ) -> Result<(&'static str, &'static str, ParsedArtifact)> {
        let start = reader.position();
        for handler in &self.handlers {
            reader.seek(start).map_err(|_| ParseError::SeekError("rewind failed".into()))?;
            match handler.accept_and_parse(reader) {
                Ok(artifact) => return Ok((handler.name(), handler.tag(), artifact)),
                Err(ParseError::NotRecognized) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(ParseError::NotRecognized)
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Assembles the registry in the documented sniffing order: strongest
/// fixed-magic formats first, the two heuristic-only formats (15-sample
/// Soundtracker via the Protracker handler, Coconizer) last, and
/// known-colliding pairs (S3M before STM) ordered so the false positive
/// never occurs.
pub fn register_all() -> LoaderRegistry {
    let mut registry = LoaderRegistry::new();

    // Archive/container formats: tried first since they wrap, rather than
    // are, a tracker module.
    registry.register(Box::new(crate::formats::lzx_archive::handler()));
    registry.register(Box::new(crate::formats::arcfs::handler()));

    // Strong fixed-ASCII-magic module formats.
    registry.register(Box::new(crate::formats::it::handler()));
    registry.register(Box::new(crate::formats::s3m::handler()));
    registry.register(Box::new(crate::formats::med::handler()));
    registry.register(Box::new(crate::formats::masi::handler()));
    registry.register(Box::new(crate::formats::liq::handler()));
    registry.register(Box::new(crate::formats::rtm::handler()));
    registry.register(Box::new(crate::formats::gdm::handler()));
    registry.register(Box::new(crate::formats::dsm::handler()));
    registry.register(Box::new(crate::formats::far::handler()));
    registry.register(Box::new(crate::formats::mtm::handler()));
    registry.register(Box::new(crate::formats::sixsixnine::handler()));
    registry.register(Box::new(crate::formats::ult::handler()));
    registry.register(Box::new(crate::formats::dtt::handler()));
    registry.register(Box::new(crate::formats::amf::asylum_handler()));
    registry.register(Box::new(crate::formats::amf::dsmi_handler()));

    // STM must run after S3M: it rejects any stream with `SCRM` at offset
    // 60 to avoid misclassifying an S3M as an STM.
    registry.register(Box::new(crate::formats::stm::handler()));

    // Protracker-lineage MOD, including the magicless 15-sample
    // Soundtracker heuristic and the WOW/Mod's Grave reclassification.
    registry.register(Box::new(crate::formats::protracker::handler()));

    // Coconizer is headerless and purely heuristic; it must run last.
    registry.register(Box::new(crate::formats::coconizer::handler()));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysReject;
    impl FormatHandler for AlwaysReject {
        fn name(&self) -> &'static str {
            "reject"
        }
        fn tag(&self) -> &'static str {
            "RJ"
        }
        fn accept_and_parse(&self, _reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
            Err(ParseError::NotRecognized)
        }
    }

    struct AlwaysAccept;
    impl FormatHandler for AlwaysAccept {
        fn name(&self) -> &'static str {
            "accept"
        }
        fn tag(&self) -> &'static str {
            "AC"
        }
        fn accept_and_parse(&self, _reader: &mut ByteReader<'_>) -> Result<ParsedArtifact> {
            Ok(ParsedArtifact::Module(Module::new("AC", "accept")))
        }
    }

    #[test]
    fn tries_in_order_and_rewinds_on_reject() {
        let mut registry = LoaderRegistry::new();
        registry.register(Box::new(AlwaysReject));
        registry.register(Box::new(AlwaysAccept));

        let data = [0u8; 16];
        let mut reader = ByteReader::new(&data);
        reader.skip(4).unwrap();
        let start = reader.position();

        let (name, _, _) = registry.try_load(&mut reader).unwrap();
        assert_eq!(name, "accept");
        // The registry rewinds to the saved start before each attempt;
        // AlwaysAccept doesn't move the cursor further so it should equal start.
        assert_eq!(reader.position(), start);
    }

    #[test]
    fn all_reject_yields_not_recognized() {
        let mut registry = LoaderRegistry::new();
        registry.register(Box::new(AlwaysReject));
        let data = [0u8; 4];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(registry.try_load(&mut reader), Err(ParseError::NotRecognized)));
    }
}
