//! Builders for constructing SAM/BAM records in tests.
//!
//! A fluent API for building individual records and read pairs without
//! dragging a file or header around, plus a small helper for making
//! headers with reference sequences.
//!
//! ```
//! use fgmerge::sam::builder::RecordBuilder;
//!
//! let record = RecordBuilder::new()
//!     .name("read1")
//!     .sequence("ACGT")
//!     .build();
//! assert!(record.cigar().as_ref().is_empty());
//! ```

use bstr::BString;
use noodles::core::Position;
use noodles::sam::Header;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::data::field::Value as BufValue;
use noodles::sam::alignment::record_buf::{Cigar, QualityScores, RecordBuf, Sequence};
use noodles::sam::header::record::value::Map;
use noodles::sam::header::record::value::map::ReferenceSequence;
use std::num::NonZeroUsize;

use crate::sam::record_utils::{parse_cigar, read_length};

/// Default base quality for generated qualities.
pub const DEFAULT_BASE_QUALITY: u8 = 30;

/// Builds a header with the given `(name, length)` reference sequences.
///
/// # Panics
///
/// Panics if any reference length is zero.
#[must_use]
pub fn header_with_references(references: &[(&str, usize)]) -> Header {
    let mut builder = Header::builder();
    for (name, length) in references {
        let map = Map::<ReferenceSequence>::new(
            NonZeroUsize::new(*length).expect("reference length must be non-zero"),
        );
        builder = builder.add_reference_sequence(BString::from(*name), map);
    }
    builder.build()
}

/// Builder for a single record.
///
/// Sequence and qualities are auto-generated when only a CIGAR is given,
/// and qualities default to [`DEFAULT_BASE_QUALITY`] when only a sequence
/// is given.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    name: Option<Vec<u8>>,
    flags: Flags,
    reference_sequence_id: Option<usize>,
    alignment_start: Option<usize>,
    mapping_quality: Option<u8>,
    cigar: Option<String>,
    sequence: Vec<u8>,
    qualities: Vec<u8>,
    tags: Vec<(Tag, BufValue)>,
    mate_reference_sequence_id: Option<usize>,
    mate_alignment_start: Option<usize>,
    template_length: Option<i32>,
}

impl RecordBuilder {
    /// Creates a builder with empty defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.as_bytes().to_vec());
        self
    }

    /// Sets the sequence, auto-generating qualities if unset.
    #[must_use]
    pub fn sequence(mut self, seq: &str) -> Self {
        self.sequence = seq.as_bytes().to_vec();
        if self.qualities.is_empty() {
            self.qualities = vec![DEFAULT_BASE_QUALITY; seq.len()];
        }
        self
    }

    /// Sets the quality scores.
    #[must_use]
    pub fn qualities(mut self, quals: &[u8]) -> Self {
        self.qualities = quals.to_vec();
        self
    }

    /// Sets all flags at once.
    #[must_use]
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the paired flag.
    #[must_use]
    pub fn paired(mut self, paired: bool) -> Self {
        self.flags.set(Flags::SEGMENTED, paired);
        self
    }

    /// Sets the first-segment (R1) flag; implies paired. `false` marks the
    /// record as the last segment.
    #[must_use]
    pub fn first_segment(mut self, is_first: bool) -> Self {
        self.flags.set(Flags::SEGMENTED, true);
        self.flags.set(Flags::FIRST_SEGMENT, is_first);
        self.flags.set(Flags::LAST_SEGMENT, !is_first);
        self
    }

    /// Sets the properly paired flag; implies paired when set.
    #[must_use]
    pub fn properly_paired(mut self, properly_paired: bool) -> Self {
        if properly_paired {
            self.flags.set(Flags::SEGMENTED, true);
        }
        self.flags.set(Flags::PROPERLY_SEGMENTED, properly_paired);
        self
    }

    /// Sets the unmapped flag.
    #[must_use]
    pub fn unmapped(mut self, unmapped: bool) -> Self {
        self.flags.set(Flags::UNMAPPED, unmapped);
        self
    }

    /// Sets the reverse complement flag.
    #[must_use]
    pub fn reverse_complement(mut self, reverse: bool) -> Self {
        self.flags.set(Flags::REVERSE_COMPLEMENTED, reverse);
        self
    }

    /// Sets the secondary alignment flag.
    #[must_use]
    pub fn secondary(mut self, secondary: bool) -> Self {
        self.flags.set(Flags::SECONDARY, secondary);
        self
    }

    /// Sets the supplementary alignment flag.
    #[must_use]
    pub fn supplementary(mut self, supplementary: bool) -> Self {
        self.flags.set(Flags::SUPPLEMENTARY, supplementary);
        self
    }

    /// Sets the mate reverse complement flag.
    #[must_use]
    pub fn mate_reverse_complement(mut self, reverse: bool) -> Self {
        self.flags.set(Flags::MATE_REVERSE_COMPLEMENTED, reverse);
        self
    }

    /// Sets the mate unmapped flag.
    #[must_use]
    pub fn mate_unmapped(mut self, unmapped: bool) -> Self {
        self.flags.set(Flags::MATE_UNMAPPED, unmapped);
        self
    }

    /// Sets the reference sequence id (0-based).
    #[must_use]
    pub fn reference_sequence_id(mut self, id: usize) -> Self {
        self.reference_sequence_id = Some(id);
        self
    }

    /// Sets the alignment start (1-based).
    #[must_use]
    pub fn alignment_start(mut self, pos: usize) -> Self {
        self.alignment_start = Some(pos);
        self
    }

    /// Sets the mapping quality.
    #[must_use]
    pub fn mapping_quality(mut self, mapq: u8) -> Self {
        self.mapping_quality = Some(mapq);
        self
    }

    /// Sets the CIGAR string.
    #[must_use]
    pub fn cigar(mut self, cigar: &str) -> Self {
        self.cigar = Some(cigar.to_string());
        self
    }

    /// Sets the mate reference sequence id (0-based).
    #[must_use]
    pub fn mate_reference_sequence_id(mut self, id: usize) -> Self {
        self.mate_reference_sequence_id = Some(id);
        self
    }

    /// Sets the mate alignment start (1-based).
    #[must_use]
    pub fn mate_alignment_start(mut self, pos: usize) -> Self {
        self.mate_alignment_start = Some(pos);
        self
    }

    /// Sets the template length.
    #[must_use]
    pub fn template_length(mut self, tlen: i32) -> Self {
        self.template_length = Some(tlen);
        self
    }

    /// Adds a SAM tag.
    #[must_use]
    pub fn tag<V: Into<BufValue>>(mut self, tag: &str, value: V) -> Self {
        let bytes = tag.as_bytes();
        if bytes.len() == 2 {
            self.tags.push((Tag::new(bytes[0], bytes[1]), value.into()));
        }
        self
    }

    /// Builds the record.
    ///
    /// # Panics
    ///
    /// Panics on an invalid CIGAR string, alignment start, or mapping
    /// quality.
    #[must_use]
    pub fn build(self) -> RecordBuf {
        let mut record = RecordBuf::default();

        if let Some(name) = self.name {
            *record.name_mut() = Some(BString::from(name));
        }
        *record.flags_mut() = self.flags;

        if let Some(ref_id) = self.reference_sequence_id {
            *record.reference_sequence_id_mut() = Some(ref_id);
        }
        if let Some(pos) = self.alignment_start {
            *record.alignment_start_mut() =
                Some(Position::try_from(pos).expect("alignment start must be >= 1"));
        }
        if let Some(mate_ref_id) = self.mate_reference_sequence_id {
            *record.mate_reference_sequence_id_mut() = Some(mate_ref_id);
        }
        if let Some(mate_pos) = self.mate_alignment_start {
            *record.mate_alignment_start_mut() =
                Some(Position::try_from(mate_pos).expect("mate alignment start must be >= 1"));
        }
        if let Some(tlen) = self.template_length {
            *record.template_length_mut() = tlen;
        }
        if let Some(mapq) = self.mapping_quality {
            *record.mapping_quality_mut() = Some(
                noodles::sam::alignment::record::MappingQuality::try_from(mapq)
                    .expect("mapping quality must be valid"),
            );
        }

        // Generate a sequence from the CIGAR when only the CIGAR was given
        let (cigar, sequence) = match (self.cigar, self.sequence.is_empty()) {
            (Some(cigar), true) => {
                let ops = parse_cigar(&cigar);
                let seq_len = read_length(&ops);
                let generated: Vec<u8> =
                    (0..seq_len).map(|i| b"ACGT"[i % 4]).collect();
                (Some(ops), generated)
            }
            (Some(cigar), false) => (Some(parse_cigar(&cigar)), self.sequence),
            (None, _) => (None, self.sequence),
        };

        if let Some(ops) = cigar {
            *record.cigar_mut() = Cigar::from(ops);
        }

        let qualities = if self.qualities.is_empty() && !sequence.is_empty() {
            vec![DEFAULT_BASE_QUALITY; sequence.len()]
        } else {
            self.qualities
        };
        *record.sequence_mut() = Sequence::from(sequence);
        *record.quality_scores_mut() = QualityScores::from(qualities);

        for (tag, value) in self.tags {
            record.data_mut().insert(tag, value);
        }

        record
    }
}

/// Builder for an FR read pair with proper mate fields and template
/// lengths.
///
/// Defaults: both ends on reference 0, R1 forward, R2 reverse, mapping
/// quality 60 on mapped ends. An end without a start position is built
/// unmapped.
#[derive(Debug)]
pub struct RecordPairBuilder {
    name: String,
    r1_sequence: Option<String>,
    r2_sequence: Option<String>,
    r1_start: Option<usize>,
    r2_start: Option<usize>,
    r1_cigar: Option<String>,
    r2_cigar: Option<String>,
    reference_sequence_id: usize,
    r2_reference_sequence_id: Option<usize>,
    mapping_quality: u8,
    r1_reverse: bool,
    r2_reverse: bool,
    tags: Vec<(String, BufValue)>,
}

impl Default for RecordPairBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordPairBuilder {
    /// Creates a pair builder with FR defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "pair".to_string(),
            r1_sequence: None,
            r2_sequence: None,
            r1_start: None,
            r2_start: None,
            r1_cigar: None,
            r2_cigar: None,
            reference_sequence_id: 0,
            r2_reference_sequence_id: None,
            mapping_quality: 60,
            r1_reverse: false,
            r2_reverse: true,
            tags: Vec::new(),
        }
    }

    /// Sets the read name shared by both ends.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Sets the R1 sequence.
    #[must_use]
    pub fn r1_sequence(mut self, seq: &str) -> Self {
        self.r1_sequence = Some(seq.to_string());
        self
    }

    /// Sets the R2 sequence.
    #[must_use]
    pub fn r2_sequence(mut self, seq: &str) -> Self {
        self.r2_sequence = Some(seq.to_string());
        self
    }

    /// Sets the R1 alignment start; unset leaves R1 unmapped.
    #[must_use]
    pub fn r1_start(mut self, start: usize) -> Self {
        self.r1_start = Some(start);
        self
    }

    /// Sets the R2 alignment start; unset leaves R2 unmapped.
    #[must_use]
    pub fn r2_start(mut self, start: usize) -> Self {
        self.r2_start = Some(start);
        self
    }

    /// Sets the R1 CIGAR.
    #[must_use]
    pub fn r1_cigar(mut self, cigar: &str) -> Self {
        self.r1_cigar = Some(cigar.to_string());
        self
    }

    /// Sets the R2 CIGAR.
    #[must_use]
    pub fn r2_cigar(mut self, cigar: &str) -> Self {
        self.r2_cigar = Some(cigar.to_string());
        self
    }

    /// Sets the reference sequence id for both ends.
    #[must_use]
    pub fn reference_sequence_id(mut self, id: usize) -> Self {
        self.reference_sequence_id = id;
        self
    }

    /// Sets a different reference sequence id for R2.
    #[must_use]
    pub fn r2_reference_sequence_id(mut self, id: usize) -> Self {
        self.r2_reference_sequence_id = Some(id);
        self
    }

    /// Sets the R1 strand.
    #[must_use]
    pub fn r1_reverse(mut self, reverse: bool) -> Self {
        self.r1_reverse = reverse;
        self
    }

    /// Sets the R2 strand.
    #[must_use]
    pub fn r2_reverse(mut self, reverse: bool) -> Self {
        self.r2_reverse = reverse;
        self
    }

    /// Adds a tag to both ends.
    #[must_use]
    pub fn tag<V: Into<BufValue>>(mut self, tag: &str, value: V) -> Self {
        self.tags.push((tag.to_string(), value.into()));
        self
    }

    /// Builds the pair, returning `(R1, R2)`.
    #[must_use]
    pub fn build(self) -> (RecordBuf, RecordBuf) {
        let r1_seq = self.r1_sequence.unwrap_or_else(|| "ACGT".to_string());
        let r2_seq = self.r2_sequence.unwrap_or_else(|| "ACGT".to_string());
        let r1_cigar = self.r1_cigar.unwrap_or_else(|| format!("{}M", r1_seq.len()));
        let r2_cigar = self.r2_cigar.unwrap_or_else(|| format!("{}M", r2_seq.len()));
        let r2_ref_id = self.r2_reference_sequence_id.unwrap_or(self.reference_sequence_id);

        let mut b1 = RecordBuilder::new()
            .name(&self.name)
            .sequence(&r1_seq)
            .first_segment(true)
            .reverse_complement(self.r1_reverse)
            .mate_reverse_complement(self.r2_reverse);
        let mut b2 = RecordBuilder::new()
            .name(&self.name)
            .sequence(&r2_seq)
            .first_segment(false)
            .reverse_complement(self.r2_reverse)
            .mate_reverse_complement(self.r1_reverse);

        match self.r1_start {
            Some(start) => {
                b1 = b1
                    .reference_sequence_id(self.reference_sequence_id)
                    .alignment_start(start)
                    .cigar(&r1_cigar)
                    .mapping_quality(self.mapping_quality);
                b2 = b2
                    .mate_reference_sequence_id(self.reference_sequence_id)
                    .mate_alignment_start(start);
            }
            None => {
                b1 = b1.unmapped(true);
                b2 = b2.mate_unmapped(true);
            }
        }
        match self.r2_start {
            Some(start) => {
                b2 = b2
                    .reference_sequence_id(r2_ref_id)
                    .alignment_start(start)
                    .cigar(&r2_cigar)
                    .mapping_quality(self.mapping_quality);
                b1 = b1.mate_reference_sequence_id(r2_ref_id).mate_alignment_start(start);
            }
            None => {
                b2 = b2.unmapped(true);
                b1 = b1.mate_unmapped(true);
            }
        }

        // Template length when both ends sit on the same reference
        if let (Some(start1), Some(start2)) = (self.r1_start, self.r2_start) {
            if self.reference_sequence_id == r2_ref_id {
                let end1 = start1 as i32 + r1_seq.len() as i32 - 1;
                let end2 = start2 as i32 + r2_seq.len() as i32 - 1;
                let (left, right) =
                    if start1 <= start2 { (start1 as i32, end2) } else { (start2 as i32, end1) };
                let tlen = right - left + 1;
                b1 = b1.template_length(if start1 <= start2 { tlen } else { -tlen });
                b2 = b2.template_length(if start2 < start1 { tlen } else { -tlen });
            }
        }

        for (tag, value) in &self.tags {
            b1 = b1.tag(tag, value.clone());
            b2 = b2.tag(tag, value.clone());
        }

        (b1.build(), b2.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder_defaults() {
        let record = RecordBuilder::new().name("r").sequence("ACGT").build();
        assert_eq!(record.name().map(|n| n.as_ref() as &[u8]), Some(b"r".as_ref()));
        assert_eq!(record.sequence().as_ref(), b"ACGT");
        assert_eq!(record.quality_scores().as_ref(), &[DEFAULT_BASE_QUALITY; 4]);
        assert!(record.cigar().as_ref().is_empty());
        assert_eq!(record.mapping_quality(), None);
    }

    #[test]
    fn test_record_builder_generates_sequence_from_cigar() {
        let record = RecordBuilder::new().cigar("4M2S").alignment_start(10).build();
        assert_eq!(record.sequence().len(), 6);
        assert_eq!(record.quality_scores().as_ref().len(), 6);
    }

    #[test]
    fn test_first_segment_sets_pair_flags() {
        let r1 = RecordBuilder::new().first_segment(true).build();
        assert!(r1.flags().is_segmented());
        assert!(r1.flags().is_first_segment());
        let r2 = RecordBuilder::new().first_segment(false).build();
        assert!(r2.flags().is_last_segment());
    }

    #[test]
    fn test_pair_builder_fr_defaults() {
        let (r1, r2) = RecordPairBuilder::new()
            .name("p")
            .r1_sequence(&"A".repeat(100))
            .r2_sequence(&"A".repeat(100))
            .r1_start(100)
            .r2_start(200)
            .build();

        assert!(r1.flags().is_first_segment());
        assert!(r2.flags().is_last_segment());
        assert!(!r1.flags().is_reverse_complemented());
        assert!(r2.flags().is_reverse_complemented());
        assert!(r1.flags().is_mate_reverse_complemented());
        assert_eq!(r1.mate_alignment_start().map(usize::from), Some(200));
        assert_eq!(r2.mate_alignment_start().map(usize::from), Some(100));
        assert_eq!(r1.template_length(), 200);
        assert_eq!(r2.template_length(), -200);
    }

    #[test]
    fn test_pair_builder_unmapped_end() {
        let (r1, r2) = RecordPairBuilder::new().name("p").r1_start(100).build();
        assert!(!r1.flags().is_unmapped());
        assert!(r1.flags().is_mate_unmapped());
        assert!(r2.flags().is_unmapped());
        assert!(!r2.flags().is_mate_unmapped());
    }

    #[test]
    fn test_header_with_references() {
        let header = header_with_references(&[("chr1", 1000), ("chr2", 500)]);
        assert_eq!(header.reference_sequences().len(), 2);
        let (name, map) = header.reference_sequences().get_index(1).unwrap();
        assert_eq!(name.as_ref() as &[u8], b"chr2");
        assert_eq!(usize::from(map.length()), 500);
    }
}
