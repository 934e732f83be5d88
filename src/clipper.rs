//! Read clipping for BAM/SAM records.
//!
//! Three operations used by the transfer engine and pair fixer:
//!
//! - [`clip_three_prime_end`]: clip a read from a 1-based position (in
//!   sequencer orientation) to its 3' end, softly or hard. Hard clipping
//!   removes bases and qualities and stashes them in the `XB`/`XQ` tags so
//!   the original read can be reconstructed.
//! - [`soft_clip_overhang_end`]: soft-clip the portion of an alignment that
//!   hangs off the end of its reference sequence.
//! - [`add_soft_clips_to_ends_of_cigar`]: re-add soft clips for bases that
//!   were trimmed before alignment or never sent to the aligner.

use anyhow::Result;
use bstr::ByteSlice;
use noodles::core::Position;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::record::cigar::Op;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::{Cigar, QualityScores, Sequence};

use crate::errors::MergeError;
use crate::sam::record_utils::{alignment_end, cigar_ops, read_length};
use crate::tags::{HARD_CLIPPED_BASES, HARD_CLIPPED_QUALITIES};

/// How clipped bases are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClippingMode {
    /// Convert to S operators; bases and qualities stay in the record.
    Soft,
    /// Convert to H operators; bases and qualities are removed.
    Hard,
}

/// Clips a read from `clip_from` (1-based, sequencer orientation) through
/// its 3' end.
///
/// For a forward-strand record the 3' end is the right end of the stored
/// sequence; for a reverse-strand record it is the left end, and the
/// alignment start advances past any reference bases the clip consumed.
///
/// When hard-clipping, the removed bases and qualities are first stashed in
/// the `XB` and `XQ` tags in the order the sequencer produced them
/// (reverse-complemented / reversed for negative-strand records).
///
/// # Errors
///
/// Fails with [`MergeError::HardClipTagCollision`] if `XB` or `XQ` is
/// already present when hard-clipping.
pub fn clip_three_prime_end(
    record: &mut RecordBuf,
    clip_from: usize,
    mode: ClippingMode,
) -> Result<()> {
    let read_len = record.sequence().len();
    if read_len == 0 || clip_from == 0 || clip_from > read_len {
        return Ok(());
    }
    let bases_to_clip = read_len - clip_from + 1;

    if mode == ClippingMode::Hard {
        stash_clipped_bases_in_tags(record, clip_from)?;
    }

    if record.flags().is_reverse_complemented() {
        clip_start_of_alignment(record, bases_to_clip, mode);
    } else {
        clip_end_of_alignment(record, bases_to_clip, mode);
    }

    Ok(())
}

/// Soft-clips the 3' overhang of an alignment extending past the end of its
/// reference sequence.
///
/// A trailing soft clip already on the record is absorbed into the new one
/// rather than left as a separate element. No-op for unmapped records and
/// for alignments ending on or before `ref_seq_length`.
pub fn soft_clip_overhang_end(record: &mut RecordBuf, ref_seq_length: usize) {
    if record.flags().is_unmapped() {
        return;
    }
    let Some(end) = alignment_end(record) else { return };
    let ops = cigar_ops(record);
    if let Some(new_ops) = soft_clip_ops_past_reference_end(&ops, end, ref_seq_length) {
        *record.cigar_mut() = Cigar::from(new_ops);
    }
}

/// Computes a replacement CIGAR soft-clipping the overhang past
/// `ref_seq_length`, or `None` when the alignment already ends on the
/// reference.
///
/// Operates on bare operations so the same logic serves the record itself
/// and the mate CIGAR carried in the `MC` tag.
#[must_use]
pub fn soft_clip_ops_past_reference_end(
    ops: &[Op],
    alignment_end: usize,
    ref_seq_length: usize,
) -> Option<Vec<Op>> {
    if alignment_end <= ref_seq_length {
        return None;
    }
    let overhang = alignment_end - ref_seq_length;
    let read_len = read_length(ops);

    // 1-based index of the first base to clip; an existing trailing soft
    // clip is folded into the window so it merges rather than stacking.
    let mut clip_from = read_len.checked_sub(overhang)? + 1;
    if let Some(last) = ops.last() {
        if last.kind() == Kind::SoftClip {
            clip_from = clip_from.saturating_sub(last.len());
        }
    }
    if clip_from < 1 || clip_from > read_len {
        return None;
    }

    let (new_ops, _) = clip_ops_end(ops, read_len - clip_from + 1, ClippingMode::Soft);
    Some(new_ops)
}

/// Re-adds soft clips at the ends of a CIGAR for bases the aligner never
/// saw.
///
/// `three_prime_end` bases are added at the 3' end (bases the aligner
/// returned short) and `five_prime_end` bases at the 5' end (bases trimmed
/// before alignment), both in sequencer orientation; the CIGAR is reversed
/// around the insertion for negative-strand records. An adjacent existing
/// soft clip is merged.
#[must_use]
pub fn add_soft_clips_to_ends_of_cigar(
    ops: &[Op],
    negative_strand: bool,
    three_prime_end: usize,
    five_prime_end: usize,
) -> Vec<Op> {
    let mut new_ops: Vec<Op> = ops.to_vec();
    if negative_strand {
        new_ops.reverse();
    }

    if three_prime_end > 0 {
        let mut clipped = three_prime_end;
        if let Some(last) = new_ops.last() {
            if last.kind() == Kind::SoftClip {
                clipped += last.len();
                new_ops.pop();
            }
        }
        new_ops.push(Op::new(Kind::SoftClip, clipped));
    }

    if five_prime_end > 0 {
        let mut clipped = five_prime_end;
        if let Some(first) = new_ops.first() {
            if first.kind() == Kind::SoftClip {
                clipped += first.len();
                new_ops.remove(0);
            }
        }
        new_ops.insert(0, Op::new(Kind::SoftClip, clipped));
    }

    if negative_strand {
        new_ops.reverse();
    }
    new_ops
}

/// Stashes the bases and qualities about to be hard-clipped into `XB`/`XQ`.
fn stash_clipped_bases_in_tags(record: &mut RecordBuf, clip_from: usize) -> Result<()> {
    if record.data().get(&HARD_CLIPPED_BASES).is_some()
        || record.data().get(&HARD_CLIPPED_QUALITIES).is_some()
    {
        let name =
            record.name().map_or_else(String::new, |n| String::from_utf8_lossy(n.as_ref()).into_owned());
        return Err(MergeError::HardClipTagCollision { name }.into());
    }

    let read_len = record.sequence().len();
    let negative = record.flags().is_reverse_complemented();

    // Window of stored bases being removed: the stored left end for
    // negative-strand records, the stored right end otherwise.
    let (from, to) = if negative { (0, read_len - clip_from + 1) } else { (clip_from - 1, read_len) };

    let mut bases: Vec<u8> = record.sequence().as_ref()[from..to].to_vec();
    let mut quals: Vec<u8> =
        record.quality_scores().as_ref()[from..to].iter().map(|q| q + 33).collect();

    if negative {
        // Stash in the order the sequencer produced them.
        crate::dna::reverse_complement_in_place(&mut bases);
        quals.reverse();
    }

    record.data_mut().insert(HARD_CLIPPED_BASES, Value::String(bases.into()));
    record.data_mut().insert(HARD_CLIPPED_QUALITIES, Value::String(quals.into()));
    Ok(())
}

/// Clips `bases_to_clip` read bases from the right end of the stored
/// alignment. Soft-clipped bases inside the window count as read bases;
/// soft clips outside it survive.
fn clip_end_of_alignment(record: &mut RecordBuf, bases_to_clip: usize, mode: ClippingMode) {
    let ops = cigar_ops(record);
    if ops.is_empty() {
        return;
    }
    let (new_ops, read_clipped) = clip_ops_end(&ops, bases_to_clip, mode);
    *record.cigar_mut() = Cigar::from(new_ops);

    if mode == ClippingMode::Hard && read_clipped > 0 {
        let keep = record.sequence().len() - read_clipped;
        let new_seq = record.sequence().as_ref()[..keep].to_vec();
        let new_qual = record.quality_scores().as_ref()[..keep].to_vec();
        *record.sequence_mut() = Sequence::from(new_seq);
        *record.quality_scores_mut() = QualityScores::from(new_qual);
    }
}

/// Clips `bases_to_clip` read bases from the left end of the stored
/// alignment, advancing the alignment start past the reference bases the
/// clip consumed.
fn clip_start_of_alignment(record: &mut RecordBuf, bases_to_clip: usize, mode: ClippingMode) {
    let ops = cigar_ops(record);
    if ops.is_empty() {
        return;
    }
    let (new_ops, read_clipped, ref_clipped) = clip_ops_start(&ops, bases_to_clip, mode);
    *record.cigar_mut() = Cigar::from(new_ops);

    if ref_clipped > 0 {
        if let Some(start) = record.alignment_start() {
            if let Some(new_start) = Position::new(usize::from(start) + ref_clipped) {
                *record.alignment_start_mut() = Some(new_start);
            }
        }
    }

    if mode == ClippingMode::Hard && read_clipped > 0 {
        let new_seq = record.sequence().as_ref()[read_clipped..].to_vec();
        let new_qual = record.quality_scores().as_ref()[read_clipped..].to_vec();
        *record.sequence_mut() = Sequence::from(new_seq);
        *record.quality_scores_mut() = QualityScores::from(new_qual);
    }
}

/// Clip `bases_to_clip` read bases from the end of `ops`.
///
/// Returns the new operations and the number of read bases removed from the
/// record in hard mode (soft mode removes none). An existing trailing hard
/// clip is preserved and, in hard mode, merged into the new one. A deletion
/// left dangling at the clip boundary is removed with the window.
fn clip_ops_end(ops: &[Op], bases_to_clip: usize, mode: ClippingMode) -> (Vec<Op>, usize) {
    let mut ops = ops.to_vec();

    let existing_hard = if ops.last().map(|op| op.kind()) == Some(Kind::HardClip) {
        ops.pop().map_or(0, |op| op.len())
    } else {
        0
    };

    let mut read_clipped = 0usize;
    let mut kept: Vec<Op> = Vec::with_capacity(ops.len());
    let mut iter = ops.iter().rev().peekable();

    while read_clipped < bases_to_clip
        || (read_clipped == bases_to_clip
            && kept.is_empty()
            && iter.peek().map(|op| op.kind()) == Some(Kind::Deletion))
    {
        let Some(op) = iter.next() else { break };
        let kind = op.kind();
        let len = op.len();
        let takes_read = matches!(
            kind,
            Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch | Kind::Insertion | Kind::SoftClip
        );

        if takes_read && len > bases_to_clip - read_clipped {
            if kind == Kind::Insertion {
                // An insertion split by the clip boundary is consumed whole.
                read_clipped += len;
            } else {
                let take = bases_to_clip - read_clipped;
                read_clipped += take;
                kept.push(Op::new(kind, len - take));
            }
        } else if takes_read {
            read_clipped += len;
        }
        // Reference-only ops inside the window simply disappear.
    }

    // Remaining operations, restored to left-to-right order.
    let mut new_ops: Vec<Op> = iter.copied().collect();
    new_ops.reverse();
    new_ops.extend(kept.into_iter().rev());

    match mode {
        ClippingMode::Soft => {
            // Merge with a soft clip that survived at the seam.
            let mut soft = read_clipped;
            if new_ops.last().map(|op| op.kind()) == Some(Kind::SoftClip) {
                soft += new_ops.pop().map_or(0, |op| op.len());
            }
            if soft > 0 {
                new_ops.push(Op::new(Kind::SoftClip, soft));
            }
            if existing_hard > 0 {
                new_ops.push(Op::new(Kind::HardClip, existing_hard));
            }
            (new_ops, 0)
        }
        ClippingMode::Hard => {
            if read_clipped + existing_hard > 0 {
                new_ops.push(Op::new(Kind::HardClip, read_clipped + existing_hard));
            }
            (new_ops, read_clipped)
        }
    }
}

/// Clip `bases_to_clip` read bases from the start of `ops`.
///
/// Returns the new operations, the read bases removed (hard mode), and the
/// reference bases the clip consumed (the alignment start shift).
fn clip_ops_start(ops: &[Op], bases_to_clip: usize, mode: ClippingMode) -> (Vec<Op>, usize, usize) {
    let mut ops = ops.to_vec();

    let existing_hard = if ops.first().map(|op| op.kind()) == Some(Kind::HardClip) {
        let len = ops[0].len();
        ops.remove(0);
        len
    } else {
        0
    };

    let mut read_clipped = 0usize;
    let mut ref_clipped = 0usize;
    let mut kept: Vec<Op> = Vec::with_capacity(ops.len());
    let mut iter = ops.iter().peekable();

    while read_clipped < bases_to_clip
        || (read_clipped == bases_to_clip
            && kept.is_empty()
            && iter.peek().map(|op| op.kind()) == Some(Kind::Deletion))
    {
        let Some(op) = iter.next() else { break };
        let kind = op.kind();
        let len = op.len();
        let takes_read = matches!(
            kind,
            Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch | Kind::Insertion | Kind::SoftClip
        );
        let takes_ref = matches!(
            kind,
            Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch | Kind::Deletion | Kind::Skip
        );

        if takes_read && len > bases_to_clip - read_clipped {
            if kind == Kind::Insertion {
                read_clipped += len;
            } else {
                let take = bases_to_clip - read_clipped;
                read_clipped += take;
                if takes_ref {
                    ref_clipped += take;
                }
                kept.push(Op::new(kind, len - take));
            }
        } else {
            if takes_read {
                read_clipped += len;
            }
            if takes_ref {
                ref_clipped += len;
            }
        }
    }

    let mut tail: Vec<Op> = kept;
    tail.extend(iter.copied());

    let mut new_ops: Vec<Op> = Vec::with_capacity(tail.len() + 2);
    match mode {
        ClippingMode::Soft => {
            if existing_hard > 0 {
                new_ops.push(Op::new(Kind::HardClip, existing_hard));
            }
            let mut soft = read_clipped;
            if tail.first().map(|op| op.kind()) == Some(Kind::SoftClip) {
                soft += tail.remove(0).len();
            }
            if soft > 0 {
                new_ops.push(Op::new(Kind::SoftClip, soft));
            }
            new_ops.extend(tail);
            (new_ops, 0, ref_clipped)
        }
        ClippingMode::Hard => {
            if read_clipped + existing_hard > 0 {
                new_ops.push(Op::new(Kind::HardClip, read_clipped + existing_hard));
            }
            new_ops.extend(tail);
            (new_ops, read_clipped, ref_clipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam::builder::RecordBuilder;
    use crate::sam::record_utils::{cigar_to_string, parse_cigar};

    fn record(pos: usize, cigar: &str, seq: &str, reverse: bool) -> RecordBuf {
        RecordBuilder::new()
            .name("q")
            .sequence(seq)
            .reference_sequence_id(0)
            .alignment_start(pos)
            .cigar(cigar)
            .reverse_complement(reverse)
            .build()
    }

    fn cigar_of(rec: &RecordBuf) -> String {
        cigar_to_string(&cigar_ops(rec))
    }

    #[test]
    fn test_soft_clip_forward() {
        // Clip from base 41 of 50: last 10 bases become soft clips
        let mut rec = record(100, "50M", &"A".repeat(50), false);
        clip_three_prime_end(&mut rec, 41, ClippingMode::Soft).unwrap();
        assert_eq!(cigar_of(&rec), "40M10S");
        assert_eq!(rec.alignment_start().map(usize::from), Some(100));
        assert_eq!(rec.sequence().len(), 50);
    }

    #[test]
    fn test_soft_clip_forward_merges_existing_clip() {
        let mut rec = record(100, "45M5S", &"A".repeat(50), false);
        clip_three_prime_end(&mut rec, 41, ClippingMode::Soft).unwrap();
        assert_eq!(cigar_of(&rec), "40M10S");
    }

    #[test]
    fn test_soft_clip_negative_strand_shifts_start() {
        // Sequencer 3' end is the stored left end; clipping 10 bases moves
        // the alignment start forward past 10 reference bases.
        let mut rec = record(100, "50M", &"A".repeat(50), true);
        clip_three_prime_end(&mut rec, 41, ClippingMode::Soft).unwrap();
        assert_eq!(cigar_of(&rec), "10S40M");
        assert_eq!(rec.alignment_start().map(usize::from), Some(110));
    }

    #[test]
    fn test_soft_clip_through_deletion() {
        // 20M5D25M, clip from 21: deletion at boundary disappears
        let mut rec = record(100, "20M5D25M", &"A".repeat(45), false);
        clip_three_prime_end(&mut rec, 21, ClippingMode::Soft).unwrap();
        assert_eq!(cigar_of(&rec), "20M25S");
    }

    #[test]
    fn test_soft_clip_insertion_at_boundary_consumed() {
        // 20M5I25M, clip from 23 lands inside the insertion: the whole
        // insertion is clipped with the window
        let mut rec = record(100, "20M5I25M", &"A".repeat(50), false);
        clip_three_prime_end(&mut rec, 23, ClippingMode::Soft).unwrap();
        assert_eq!(cigar_of(&rec), "20M30S");
    }

    #[test]
    fn test_hard_clip_removes_and_stashes() {
        let seq: String = "ACGT".repeat(10) + "TTTTTTTTTT"; // 50 bases
        let mut rec = record(100, "50M", &seq, false);
        clip_three_prime_end(&mut rec, 41, ClippingMode::Hard).unwrap();

        assert_eq!(cigar_of(&rec), "40M10H");
        assert_eq!(rec.sequence().len(), 40);
        assert_eq!(rec.quality_scores().as_ref().len(), 40);
        assert_eq!(
            rec.data().get(&HARD_CLIPPED_BASES),
            Some(&Value::String("TTTTTTTTTT".into()))
        );
        // Default quality 30 -> Phred+33 '?'
        assert_eq!(
            rec.data().get(&HARD_CLIPPED_QUALITIES),
            Some(&Value::String("??????????".into()))
        );
    }

    #[test]
    fn test_hard_clip_negative_strand_stashes_sequencer_order() {
        // Stored left end holds the sequencer 3' bases; the stash must be
        // reverse-complemented back to sequencer order.
        let seq = "CCCCCAAAAAAAAAA".to_string(); // 15 bases, clip last 5 (stored CCCCC)
        let mut rec = record(100, "15M", &seq, true);
        clip_three_prime_end(&mut rec, 11, ClippingMode::Hard).unwrap();

        assert_eq!(cigar_of(&rec), "5H10M");
        assert_eq!(rec.sequence().as_ref(), b"AAAAAAAAAA");
        assert_eq!(rec.alignment_start().map(usize::from), Some(105));
        assert_eq!(rec.data().get(&HARD_CLIPPED_BASES), Some(&Value::String("GGGGG".into())));
    }

    #[test]
    fn test_hard_clip_keeps_inner_soft_clip() {
        // 40M8S2S-equivalent window: clipping 5 bases of 40M8S from base 44
        // leaves the inner soft clip bases intact
        let mut rec = record(100, "40M10S", &"A".repeat(50), false);
        clip_three_prime_end(&mut rec, 46, ClippingMode::Hard).unwrap();
        assert_eq!(cigar_of(&rec), "40M5S5H");
        assert_eq!(rec.sequence().len(), 45);
    }

    #[test]
    fn test_hard_clip_tag_collision() {
        let mut rec = RecordBuilder::new()
            .name("q")
            .sequence(&"A".repeat(50))
            .reference_sequence_id(0)
            .alignment_start(100)
            .cigar("50M")
            .tag("XB", "ACGT")
            .build();
        let err = clip_three_prime_end(&mut rec, 41, ClippingMode::Hard).unwrap_err();
        assert!(err.to_string().contains("hard-clipped bases"));
    }

    #[test]
    fn test_clip_past_read_length_is_noop() {
        let mut rec = record(100, "50M", &"A".repeat(50), false);
        clip_three_prime_end(&mut rec, 51, ClippingMode::Soft).unwrap();
        assert_eq!(cigar_of(&rec), "50M");
    }

    #[test]
    fn test_overhang_clip() {
        // chr length 1000, read of 50 ends at 1010: last 10 bases clip
        let mut rec = record(961, "50M", &"A".repeat(50), false);
        soft_clip_overhang_end(&mut rec, 1000);
        assert_eq!(cigar_of(&rec), "40M10S");
    }

    #[test]
    fn test_overhang_clip_absorbs_existing_soft_clip() {
        // 47M3S ending at 1010 with ref length 1000: result ends 13S, not 3S10S
        let mut rec = record(964, "47M3S", &"A".repeat(50), false);
        soft_clip_overhang_end(&mut rec, 1000);
        assert_eq!(cigar_of(&rec), "37M13S");
    }

    #[test]
    fn test_overhang_clip_noop_when_inside_reference() {
        let mut rec = record(900, "50M", &"A".repeat(50), false);
        soft_clip_overhang_end(&mut rec, 1000);
        assert_eq!(cigar_of(&rec), "50M");
    }

    #[test]
    fn test_add_soft_clips_trim_forward() {
        // Aligner saw 45 of 50 bases (5 trimmed at 5'): 45M -> 5S45M
        let ops = parse_cigar("45M");
        let out = add_soft_clips_to_ends_of_cigar(&ops, false, 0, 5);
        assert_eq!(cigar_to_string(&out), "5S45M");
    }

    #[test]
    fn test_add_soft_clips_trim_negative_strand() {
        // On the negative strand the 5' trim lands at the stored right end
        let ops = parse_cigar("45M");
        let out = add_soft_clips_to_ends_of_cigar(&ops, true, 0, 5);
        assert_eq!(cigar_to_string(&out), "45M5S");
    }

    #[test]
    fn test_add_soft_clips_not_written_merges() {
        let ops = parse_cigar("40M5S");
        let out = add_soft_clips_to_ends_of_cigar(&ops, false, 5, 0);
        assert_eq!(cigar_to_string(&out), "40M10S");
    }

    #[test]
    fn test_add_soft_clips_both_ends() {
        let ops = parse_cigar("40M");
        let out = add_soft_clips_to_ends_of_cigar(&ops, false, 4, 6);
        assert_eq!(cigar_to_string(&out), "6S40M4S");
    }

    #[test]
    fn test_hard_clip_stash_roundtrip() {
        // Concatenating the kept bases with the stash reconstructs the
        // submitted read
        let seq = "ACGTACGTACGTACGTACGT".to_string();
        let mut rec = record(100, "20M", &seq, false);
        clip_three_prime_end(&mut rec, 16, ClippingMode::Hard).unwrap();

        let kept = String::from_utf8(rec.sequence().as_ref().to_vec()).unwrap();
        let Some(Value::String(stash)) = rec.data().get(&HARD_CLIPPED_BASES) else {
            panic!("missing stash")
        };
        let restored = kept + &String::from_utf8(stash.as_bytes().to_vec()).unwrap();
        assert_eq!(restored, seq);
    }
}
