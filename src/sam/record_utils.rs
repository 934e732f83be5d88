//! Record-level utilities for SAM/BAM records.
//!
//! This module provides utilities for working with individual SAM records:
//! - CIGAR parsing, printing, and length arithmetic
//! - Position mapping between read and reference coordinates
//! - Pair orientation detection
//! - Query-name comparison for merge-order checks

use std::cmp::Ordering;

use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::record::cigar::Op;
use noodles::sam::alignment::record::cigar::op::Kind;

/// Pair orientation for paired-end reads.
///
/// The orientation of a read pair based on the relative positioning and
/// strand of the two reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairOrientation {
    /// Forward-Reverse ("innie") - reads face each other:
    /// ```text
    /// 5' --F-->       <--R-- 5'
    /// ```
    FR,

    /// Reverse-Forward ("outie") - reads face away from each other:
    /// ```text
    /// <--R-- 5'       5' --F-->
    /// ```
    RF,

    /// Tandem - both reads on the same strand.
    Tandem,
}

/// Compares two read names.
///
/// This is the comparator the merge driver uses to decide whether the
/// aligned stream has run ahead of the unmapped stream, and the order the
/// [`crate::hits::HitGrouper`] requires of its input: plain byte-wise
/// comparison, with no numeric-aware tie-breaking.
#[must_use]
pub fn compare_read_names(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Returns the record's CIGAR as an owned vector of operations.
#[must_use]
pub fn cigar_ops(record: &RecordBuf) -> Vec<Op> {
    record.cigar().as_ref().to_vec()
}

/// Parses a CIGAR string into a vector of operations, or `None` on
/// malformed input (used for CIGARs arriving through tag values).
#[must_use]
pub fn try_parse_cigar(cigar_str: &str) -> Option<Vec<Op>> {
    if cigar_str == "*" {
        return Some(Vec::new());
    }

    let mut ops = Vec::new();
    let mut num_str = String::new();

    for c in cigar_str.chars() {
        if c.is_ascii_digit() {
            num_str.push(c);
        } else {
            let len: usize = num_str.parse().ok()?;
            let kind = match c {
                'M' => Kind::Match,
                'I' => Kind::Insertion,
                'D' => Kind::Deletion,
                'N' => Kind::Skip,
                'S' => Kind::SoftClip,
                'H' => Kind::HardClip,
                'P' => Kind::Pad,
                '=' => Kind::SequenceMatch,
                'X' => Kind::SequenceMismatch,
                _ => return None,
            };
            ops.push(Op::new(kind, len));
            num_str.clear();
        }
    }

    if num_str.is_empty() { Some(ops) } else { None }
}

/// Parses a CIGAR string into a vector of operations.
///
/// # Panics
///
/// Panics if the CIGAR string contains invalid characters or formatting.
/// Intended for test fixtures and trusted values.
#[must_use]
pub fn parse_cigar(cigar_str: &str) -> Vec<Op> {
    try_parse_cigar(cigar_str).expect("Invalid CIGAR string")
}

/// Formats CIGAR operations as a string, e.g. `5S45M`.
///
/// An empty operation list formats as `*`, the SAM missing-CIGAR sentinel.
#[must_use]
pub fn cigar_to_string(ops: &[Op]) -> String {
    if ops.is_empty() {
        return "*".to_string();
    }
    let mut out = String::new();
    for op in ops {
        let c = match op.kind() {
            Kind::Match => 'M',
            Kind::Insertion => 'I',
            Kind::Deletion => 'D',
            Kind::Skip => 'N',
            Kind::SoftClip => 'S',
            Kind::HardClip => 'H',
            Kind::Pad => 'P',
            Kind::SequenceMatch => '=',
            Kind::SequenceMismatch => 'X',
        };
        out.push_str(&op.len().to_string());
        out.push(c);
    }
    out
}

/// Returns true if the operation consumes read bases (M/I/S/=/X).
#[must_use]
pub fn consumes_read(kind: Kind) -> bool {
    matches!(
        kind,
        Kind::Match | Kind::Insertion | Kind::SoftClip | Kind::SequenceMatch | Kind::SequenceMismatch
    )
}

/// Returns true if the operation consumes reference bases (M/D/N/=/X).
#[must_use]
pub fn consumes_reference(kind: Kind) -> bool {
    matches!(
        kind,
        Kind::Match | Kind::Deletion | Kind::Skip | Kind::SequenceMatch | Kind::SequenceMismatch
    )
}

/// Number of read bases implied by the CIGAR (sum of query-consuming ops).
#[must_use]
pub fn read_length(ops: &[Op]) -> usize {
    ops.iter().filter(|op| consumes_read(op.kind())).map(|op| op.len()).sum()
}

/// Number of reference bases spanned by the CIGAR.
#[must_use]
pub fn reference_length(ops: &[Op]) -> usize {
    ops.iter().filter(|op| consumes_reference(op.kind())).map(|op| op.len()).sum()
}

/// Returns true if no operation aligns a read base to the reference.
///
/// A record whose CIGAR has no M/=/X operation maps zero bases and cannot
/// remain mapped.
#[must_use]
pub fn maps_no_bases_to_reference(ops: &[Op]) -> bool {
    !ops.iter().any(|op| {
        matches!(op.kind(), Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch)
    })
}

/// Leading clipping (soft + hard).
#[must_use]
pub fn leading_clipping(ops: &[Op]) -> usize {
    ops.iter()
        .take_while(|op| matches!(op.kind(), Kind::SoftClip | Kind::HardClip))
        .map(|op| op.len())
        .sum()
}

/// Trailing clipping (soft + hard).
#[must_use]
pub fn trailing_clipping(ops: &[Op]) -> usize {
    ops.iter()
        .rev()
        .take_while(|op| matches!(op.kind(), Kind::SoftClip | Kind::HardClip))
        .map(|op| op.len())
        .sum()
}

/// Leading soft clipping only.
#[must_use]
pub fn leading_soft_clipping(ops: &[Op]) -> usize {
    ops.iter()
        .skip_while(|op| op.kind() == Kind::HardClip)
        .take_while(|op| op.kind() == Kind::SoftClip)
        .map(|op| op.len())
        .sum()
}

/// Gets the read's alignment end position (1-based, inclusive).
///
/// Calculated as `alignment_start + reference_length - 1`. Returns `None`
/// for unplaced records.
#[must_use]
pub fn alignment_end(record: &RecordBuf) -> Option<usize> {
    let start = usize::from(record.alignment_start()?);
    let ref_len = reference_length(&cigar_ops(record));
    Some(start + ref_len.saturating_sub(1))
}

/// Gets the unclipped start position (alignment start minus leading clips).
///
/// May be zero or negative when clipping extends past the start of the
/// reference, hence the signed return.
#[must_use]
pub fn unclipped_start(record: &RecordBuf) -> Option<isize> {
    let start = usize::from(record.alignment_start()?) as isize;
    Some(start - leading_clipping(&cigar_ops(record)) as isize)
}

/// Gets the unclipped end position (alignment end plus trailing clips).
#[must_use]
pub fn unclipped_end(record: &RecordBuf) -> Option<usize> {
    let end = alignment_end(record)?;
    Some(end + trailing_clipping(&cigar_ops(record)))
}

/// Returns the 1-based read position corresponding to a reference position.
///
/// # Arguments
/// * `record` - The SAM record
/// * `ref_pos` - The 1-based reference position to query
/// * `return_last_base_if_deleted` - If true, returns the last aligned base
///   position when `ref_pos` falls in a deletion; if false, returns 0
///
/// Returns 0 when the position does not overlap the aligned portion of the
/// read, or the record has no alignment start.
#[must_use]
pub fn read_pos_at_ref_pos(
    record: &RecordBuf,
    ref_pos: usize,
    return_last_base_if_deleted: bool,
) -> usize {
    let Some(alignment_start) = record.alignment_start().map(usize::from) else {
        return 0;
    };

    // Walk the CIGAR tracking both read and reference positions
    let mut read_pos: usize = 0; // 0-based position in read
    let mut ref_cursor = alignment_start; // 1-based reference position
    let mut last_aligned_read_pos: usize = 0;

    for op in record.cigar().as_ref() {
        let len = op.len();
        match op.kind() {
            Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch => {
                if ref_pos >= ref_cursor && ref_pos < ref_cursor + len {
                    let offset = ref_pos - ref_cursor;
                    return read_pos + offset + 1; // +1 for 1-based
                }
                last_aligned_read_pos = read_pos + len;
                read_pos += len;
                ref_cursor += len;
            }
            Kind::Insertion | Kind::SoftClip => {
                read_pos += len;
            }
            Kind::Deletion | Kind::Skip => {
                if ref_pos >= ref_cursor && ref_pos < ref_cursor + len {
                    return if return_last_base_if_deleted && last_aligned_read_pos > 0 {
                        last_aligned_read_pos
                    } else {
                        0
                    };
                }
                ref_cursor += len;
            }
            Kind::HardClip | Kind::Pad => {}
        }
    }

    0
}

/// Returns the 1-based read position aligned to `ref_pos`, treating soft
/// clips as if they consumed reference.
///
/// Soft-clipped bases are counted as matches, so the read's effective
/// reference span extends left of the alignment start by the leading
/// soft-clip length and right of the alignment end by the trailing one
/// (which is why `ref_pos` is signed). When `ref_pos` falls in a deletion,
/// the position of the last read base before the deletion is returned.
/// Returns 0 when the position is outside the (extended) span.
#[must_use]
pub fn read_pos_at_ref_pos_ignoring_soft_clips(record: &RecordBuf, ref_pos: isize) -> usize {
    let Some(alignment_start) = record.alignment_start().map(usize::from) else {
        return 0;
    };

    let ops = cigar_ops(record);

    // Soft clips count as matches, so the walk starts to the left of the
    // alignment start by the leading soft-clip length.
    let mut ref_cursor = alignment_start as isize - leading_soft_clipping(&ops) as isize;
    let mut read_pos: usize = 0;
    let mut last_aligned_read_pos: usize = 0;

    for op in &ops {
        let len = op.len();
        match op.kind() {
            Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch | Kind::SoftClip => {
                if ref_pos >= ref_cursor && ref_pos < ref_cursor + len as isize {
                    let offset = (ref_pos - ref_cursor) as usize;
                    return read_pos + offset + 1;
                }
                last_aligned_read_pos = read_pos + len;
                read_pos += len;
                ref_cursor += len as isize;
            }
            Kind::Insertion => {
                read_pos += len;
            }
            Kind::Deletion | Kind::Skip => {
                if ref_pos >= ref_cursor && ref_pos < ref_cursor + len as isize {
                    return if last_aligned_read_pos > 0 { last_aligned_read_pos } else { 0 };
                }
                ref_cursor += len as isize;
            }
            Kind::HardClip | Kind::Pad => {}
        }
    }

    0
}

/// Gets the pair orientation implied by a record's own fields.
///
/// Uses the mate position, template length, and strand flags, so it can be
/// evaluated on a single record once mate information has been set.
#[must_use]
pub fn pair_orientation(record: &RecordBuf) -> PairOrientation {
    let is_reverse = record.flags().is_reverse_complemented();
    let mate_reverse = record.flags().is_mate_reverse_complemented();

    if is_reverse == mate_reverse {
        return PairOrientation::Tandem;
    }

    let alignment_start = record.alignment_start().map_or(0, usize::from);
    let mate_start = record.mate_alignment_start().map_or(0, usize::from);
    let insert_size = record.template_length();

    let (positive_five_prime, negative_five_prime) = if is_reverse {
        // This read is on the reverse strand, its mate on the positive one.
        let end = alignment_end(record).unwrap_or(alignment_start);
        (mate_start as i64, end as i64)
    } else {
        (alignment_start as i64, alignment_start as i64 + i64::from(insert_size))
    };

    if positive_five_prime < negative_five_prime {
        PairOrientation::FR
    } else {
        PairOrientation::RF
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam::builder::RecordBuilder;

    fn mapped(pos: usize, cigar: &str) -> RecordBuf {
        RecordBuilder::new()
            .name("read")
            .cigar(cigar)
            .reference_sequence_id(0)
            .alignment_start(pos)
            .build()
    }

    #[test]
    fn test_parse_and_print_cigar() {
        let ops = parse_cigar("5H10S50M10S5H");
        assert_eq!(ops.len(), 5);
        assert_eq!(ops[0], Op::new(Kind::HardClip, 5));
        assert_eq!(cigar_to_string(&ops), "5H10S50M10S5H");
        assert_eq!(cigar_to_string(&[]), "*");
    }

    #[test]
    fn test_lengths() {
        let ops = parse_cigar("10M5I3D2N7S4H1P6=8X");
        // read: 10 + 5 + 7 + 6 + 8 = 36
        assert_eq!(read_length(&ops), 36);
        // ref: 10 + 3 + 2 + 6 + 8 = 29
        assert_eq!(reference_length(&ops), 29);
    }

    #[test]
    fn test_clipping_sums() {
        let ops = parse_cigar("5H10S50M10S5H");
        assert_eq!(leading_clipping(&ops), 15);
        assert_eq!(trailing_clipping(&ops), 15);
        assert_eq!(leading_soft_clipping(&ops), 10);
    }

    #[test]
    fn test_maps_no_bases_to_reference() {
        assert!(maps_no_bases_to_reference(&parse_cigar("50S")));
        assert!(maps_no_bases_to_reference(&parse_cigar("10S5I10S")));
        assert!(!maps_no_bases_to_reference(&parse_cigar("1M49S")));
    }

    #[test]
    fn test_alignment_end() {
        assert_eq!(alignment_end(&mapped(100, "50M")), Some(149));
        assert_eq!(alignment_end(&mapped(100, "25M5D25M")), Some(154));
        assert_eq!(alignment_end(&mapped(100, "25M5I25M")), Some(149));
    }

    #[test]
    fn test_unclipped_positions() {
        let read = mapped(100, "5S45M10H");
        assert_eq!(unclipped_start(&read), Some(95));
        assert_eq!(unclipped_end(&read), Some(154));

        // Unclipped start may run off the front of the reference
        let read = mapped(3, "5S45M");
        assert_eq!(unclipped_start(&read), Some(-2));
    }

    #[test]
    fn test_read_pos_at_ref_pos_simple() {
        let read = mapped(100, "50M");
        assert_eq!(read_pos_at_ref_pos(&read, 100, false), 1);
        assert_eq!(read_pos_at_ref_pos(&read, 149, false), 50);
        assert_eq!(read_pos_at_ref_pos(&read, 150, false), 0);
        assert_eq!(read_pos_at_ref_pos(&read, 99, false), 0);
    }

    #[test]
    fn test_read_pos_at_ref_pos_deletion() {
        let read = mapped(100, "10M5D10M");
        assert_eq!(read_pos_at_ref_pos(&read, 112, false), 0);
        assert_eq!(read_pos_at_ref_pos(&read, 112, true), 10);
        assert_eq!(read_pos_at_ref_pos(&read, 115, false), 11);
    }

    #[test]
    fn test_read_pos_at_ref_pos_soft_clip_skipped() {
        let read = mapped(100, "5S10M");
        assert_eq!(read_pos_at_ref_pos(&read, 100, false), 6);
    }

    #[test]
    fn test_ignoring_soft_clips_treats_clips_as_matches() {
        // 5S10M at 100: soft clip occupies effective positions 95..=99
        let read = mapped(100, "5S10M");
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 95), 1);
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 99), 5);
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 100), 6);
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 109), 15);
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 110), 0);
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 94), 0);
    }

    #[test]
    fn test_ignoring_soft_clips_trailing() {
        // 10M5S at 100: trailing clip occupies effective positions 110..=114
        let read = mapped(100, "10M5S");
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 110), 11);
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 114), 15);
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 115), 0);
    }

    #[test]
    fn test_ignoring_soft_clips_deletion_returns_prior_base() {
        let read = mapped(100, "10M5D10M");
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 112), 10);
    }

    #[test]
    fn test_ignoring_soft_clips_negative_query() {
        // Effective span can reach zero and below when leading clips are long
        let read = mapped(3, "5S10M");
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, -2), 1);
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, 0), 3);
        assert_eq!(read_pos_at_ref_pos_ignoring_soft_clips(&read, -3), 0);
    }

    #[test]
    fn test_compare_read_names() {
        assert_eq!(compare_read_names(b"q1", b"q1"), Ordering::Equal);
        assert_eq!(compare_read_names(b"q1", b"q2"), Ordering::Less);
        // Byte-wise, not numeric-aware
        assert_eq!(compare_read_names(b"q10", b"q2"), Ordering::Less);
    }

    #[test]
    fn test_pair_orientation_fr() {
        let read = RecordBuilder::new()
            .name("p")
            .sequence(&"A".repeat(100))
            .reference_sequence_id(0)
            .alignment_start(100)
            .cigar("100M")
            .first_segment(true)
            .mate_reverse_complement(true)
            .mate_reference_sequence_id(0)
            .mate_alignment_start(150)
            .template_length(200)
            .build();
        assert_eq!(pair_orientation(&read), PairOrientation::FR);
    }

    #[test]
    fn test_pair_orientation_rf() {
        let read = RecordBuilder::new()
            .name("p")
            .sequence(&"A".repeat(100))
            .reference_sequence_id(0)
            .alignment_start(200)
            .cigar("100M")
            .first_segment(true)
            .mate_reverse_complement(true)
            .mate_reference_sequence_id(0)
            .mate_alignment_start(100)
            .template_length(-100)
            .build();
        assert_eq!(pair_orientation(&read), PairOrientation::RF);
    }

    #[test]
    fn test_pair_orientation_tandem() {
        let read = RecordBuilder::new()
            .name("p")
            .sequence(&"A".repeat(100))
            .reference_sequence_id(0)
            .alignment_start(100)
            .cigar("100M")
            .first_segment(true)
            .mate_reference_sequence_id(0)
            .mate_alignment_start(200)
            .template_length(200)
            .build();
        assert_eq!(pair_orientation(&read), PairOrientation::Tandem);
    }
}
