// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! The crate-wide error taxonomy.
//!
//! A single sum type is used everywhere rather than one type per format
//! module: handlers disagree on almost nothing about *how* they fail, only
//! on the message attached, and a flat enum keeps the registry's dispatch
//! loop (which only ever needs to distinguish `NotRecognized` from
//! everything else) simple.

use std::fmt;

/// Everything that can go wrong while recognizing or parsing a stream.
///
/// `NotRecognized` is the only variant the [`crate::registry::LoaderRegistry`]
/// treats as recoverable; every other variant is terminal for the current
/// input.
#[derive(Debug)]
pub enum ParseError {
    /// Phase 1 (Identify) rejected the stream; try the next handler.
    NotRecognized,
    /// The underlying byte source failed or hit an unexpected, committed EOF.
    ReadError(String),
    /// A seek went outside the bounds of the backing buffer.
    SeekError(String),
    /// A structural rule was violated: counts out of range, a nested magic
    /// mismatch, an offset outside the input.
    Invalid(String),
    /// A decompressor detected a violation of its own encoded-stream
    /// invariants (illegal bit width, unterminated run, over-long code).
    BadPacking(String),
    /// A version field was read successfully but falls outside the known,
    /// supported range.
    UnsupportedVersion(String),
    /// A declared count exceeds the format's structural cap.
    TooManyBlocks(String),
    TooManyInstruments(String),
    TooManyEffects(String),
    TooManyChannels(String),
    /// The host could not obtain memory for a requested buffer.
    AllocationError(String),
}

impl ParseError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ParseError::Invalid(reason.into())
    }

    pub fn unsupported_version(reason: impl Into<String>) -> Self {
        ParseError::UnsupportedVersion(reason.into())
    }

    pub fn bad_packing(reason: impl Into<String>) -> Self {
        ParseError::BadPacking(reason.into())
    }

    pub fn too_many_effects(reason: impl Into<String>) -> Self {
        ParseError::TooManyEffects(reason.into())
    }

    pub fn too_many_instruments(reason: impl Into<String>) -> Self {
        ParseError::TooManyInstruments(reason.into())
    }

    pub fn too_many_blocks(reason: impl Into<String>) -> Self {
        ParseError::TooManyBlocks(reason.into())
    }

    pub fn too_many_channels(reason: impl Into<String>) -> Self {
        ParseError::TooManyChannels(reason.into())
    }

    /// `true` for every variant the registry is allowed to recover from by
    /// trying the next handler.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ParseError::NotRecognized)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NotRecognized => write!(f, "not recognized"),
            ParseError::ReadError(msg) => write!(f, "read error: {}", msg),
            ParseError::SeekError(msg) => write!(f, "seek error: {}", msg),
            ParseError::Invalid(msg) => write!(f, "invalid: {}", msg),
            ParseError::BadPacking(msg) => write!(f, "bad packing: {}", msg),
            ParseError::UnsupportedVersion(msg) => write!(f, "unsupported version: {}", msg),
            ParseError::TooManyBlocks(msg) => write!(f, "too many blocks: {}", msg),
            ParseError::TooManyInstruments(msg) => write!(f, "too many instruments: {}", msg),
            ParseError::TooManyEffects(msg) => write!(f, "too many effects: {}", msg),
            ParseError::TooManyChannels(msg) => write!(f, "too many channels: {}", msg),
            ParseError::AllocationError(msg) => write!(f, "allocation error: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ParseError::ReadError("unexpected eof".into()),
            _ => ParseError::ReadError(err.to_string()),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_recognized_is_recoverable() {
        assert!(ParseError::NotRecognized.is_recoverable());
        assert!(!ParseError::invalid("x").is_recoverable());
    }
}
