// modscan-core
// Licensed under the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file,
// You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-module feature tracking.
//!
//! Every format lists its own alphabet of quirks in `spec.md` terms; rather
//! than one enum per format (which the teacher avoids for its own error
//! type) this is one flat enum, namespaced by variant-name prefix.

/// A single observed structural or encoding quirk. Ordinals are stable
/// within a release; new variants are always appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    // --- MOD / WOW ---
    ModAdpcmSample,
    ModWowReclassified,
    ModWowFalsePositive,
    ModSoundtracker15,
    ModUnknownTag,

    // --- IT ---
    ItCompressedSample,
    ItInvalidBitWidth,
    ItOldInstrumentFormat,
    ItStereoSample,
    ItLinearSlides,

    // --- S3M ---
    S3mInstrumentCountOver255,
    S3mPatternCountOver256,
    S3mOrderCountOver256,
    S3mAdLib,
    S3mAdLibInstrument,
    S3mGpSoundBlaster,
    S3mGpGravisUltrasound,
    S3mHighSampleSegment,
    S3mStereoSample,
    S3mSixteenBitSample,
    S3mAdpcmSample,
    S3mModPlug,

    // --- MED / OctaMED ---
    MedOldPatternLayout,
    MedExtendedInstrument,
    MedUnimplementedTail,

    // --- MASI / PS16 ---
    MasiOldFormat,
    MasiNewFormat,

    // --- Liquid Tracker ---
    LiqTrackFormat,
    LiqNoFormat,

    // --- RTM ---
    RtmExtendedEffect,

    // --- Coconizer ---
    CocoArmWrapped,

    // --- LZX archive ---
    LzxMergedGroup,
    LzxHeaderCrcMismatch,
    LzxPayloadCrcMismatch,
    LzxUncompressedBlock,
    LzxAlignedBlock,

    // --- ArcFS ---
    ArcCompressedEntryUnsupported,

    // --- 669 ---
    SixSixNineComposerVariant,

    // --- STM ---
    StmFalseS3m,

    // --- Farandole ---
    FarBreakTable,

    // --- DSM ---
    DsmChunkSkipped,

    // --- GDM ---
    GdmSubChunkTable,

    // --- MTM ---
    MtmSharedTrack,

    // --- AMF ---
    AmfAsylumVariant,
    AmfAsylumFxOver16,
    AmfDsmiV1NumEventsAmbiguous,
    AmfNote7f,
    AmfVolumeFf,
    AmfBlankTrack,
    AmfOutOfBoundsTrack,
    AmfMultipleEffects,
    AmfTooManyEffects,

    // --- Ultra Tracker ---
    UltLoopFlagsVariant,

    // --- DigiTrakker ---
    DttNestedChunk,

    // --- cross-format diagnostics ---
    TruncatedRecordZeroFilled,
    OrderOutOfRange,
}

impl Feature {
    /// Human readable label printed on the renderer's "Uses" line.
    pub fn label(self) -> &'static str {
        use Feature::*;
        match self {
            ModAdpcmSample => "S:ADPCM",
            ModWowReclassified => "WOW",
            ModWowFalsePositive => "WOW(fp)",
            ModSoundtracker15 => "Soundtracker15",
            ModUnknownTag => "UnknownTag",
            ItCompressedSample => "S:Compressed",
            ItInvalidBitWidth => "InvalidBitWidth",
            ItOldInstrumentFormat => "OldInstrument",
            ItStereoSample => "S:Stereo",
            ItLinearSlides => "LinearSlides",
            S3mInstrumentCountOver255 => "I>255",
            S3mPatternCountOver256 => "P>256",
            S3mOrderCountOver256 => "O>256",
            S3mAdLib => "AdLib",
            S3mAdLibInstrument => "AdLib(I)",
            S3mGpSoundBlaster => "Gp:SB",
            S3mGpGravisUltrasound => "Gp:GUS",
            S3mHighSampleSegment => "S:HiSeg",
            S3mStereoSample => "S:Stereo",
            S3mSixteenBitSample => "S:16",
            S3mAdpcmSample => "S:ADPCM",
            S3mModPlug => "ModPlug",
            MedOldPatternLayout => "MMD0Pattern",
            MedExtendedInstrument => "ExtInstrument",
            MedUnimplementedTail => "NotImplemented",
            MasiOldFormat => "PSM-Old",
            MasiNewFormat => "PSM-New",
            LiqTrackFormat => "LIQ",
            LiqNoFormat => "NO",
            RtmExtendedEffect => "ExtEffect",
            CocoArmWrapped => "ARM-wrapped",
            LzxMergedGroup => "Merged",
            LzxHeaderCrcMismatch => "HeaderCRC!",
            LzxPayloadCrcMismatch => "PayloadCRC!",
            LzxUncompressedBlock => "Uncompressed",
            LzxAlignedBlock => "Aligned",
            ArcCompressedEntryUnsupported => "Compressed(unsupported)",
            SixSixNineComposerVariant => "Composer669",
            StmFalseS3m => "FalseS3M",
            FarBreakTable => "BreakTable",
            DsmChunkSkipped => "ChunkSkipped",
            GdmSubChunkTable => "SubChunks",
            MtmSharedTrack => "SharedTrack",
            AmfAsylumVariant => "ASYLUM",
            AmfAsylumFxOver16 => "X:>16",
            AmfDsmiV1NumEventsAmbiguous => "NumEvents+1?",
            AmfNote7f => "Note7F",
            AmfVolumeFf => "VolFF",
            AmfBlankTrack => "Track0",
            AmfOutOfBoundsTrack => "Track>Max",
            AmfMultipleEffects => ">1fx",
            AmfTooManyEffects => ">4fx",
            UltLoopFlagsVariant => "LoopFlagsV2",
            DttNestedChunk => "Nested",
            TruncatedRecordZeroFilled => "Truncated",
            OrderOutOfRange => "Order!",
        }
    }
}

/// Bit vector of observed [`Feature`]s for one module. `set` is idempotent
/// and flags are never cleared once raised, matching the monotonicity
/// invariant the renderer relies on.
#[derive(Debug, Clone, Default)]
pub struct UsageSet {
    flags: Vec<Feature>,
}

impl UsageSet {
    pub fn new() -> Self {
        UsageSet { flags: Vec::new() }
    }

    pub fn set(&mut self, feature: Feature) {
        if !self.flags.contains(&feature) {
            self.flags.push(feature);
        }
    }

    pub fn is_set(&self, feature: Feature) -> bool {
        self.flags.contains(&feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.flags.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.flags.iter().map(|f| f.label()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent_and_monotone() {
        let mut usage = UsageSet::new();
        usage.set(Feature::ModWowReclassified);
        usage.set(Feature::ModWowReclassified);
        assert_eq!(usage.iter().count(), 1);
        assert!(usage.is_set(Feature::ModWowReclassified));
        assert!(!usage.is_set(Feature::ItCompressedSample));
    }
}
