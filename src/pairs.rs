//! Pair fix-ups: overlap clipping, mate linkage, and proper-pair flags.

use anyhow::Result;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::data::field::Value;

use crate::clipper::{ClippingMode, clip_three_prime_end};
use crate::sam::record_utils::{
    PairOrientation, alignment_end, cigar_ops, cigar_to_string, pair_orientation,
    read_pos_at_ref_pos_ignoring_soft_clips, unclipped_end, unclipped_start,
};
use crate::tags::MATE_CIGAR;

/// Clips the ends of an inward-facing pair so that neither read's aligned
/// 3' end extends past the 5' aligned start of its mate.
///
/// Applied when both ends are mapped, on opposite strands, and their
/// reference intervals overlap. The first pass soft-clips against the
/// aligned start/end of the mate; when `use_hard_clipping` is set, a second
/// pass hard-clips against the *unclipped* start/end, stashing the removed
/// bases and qualities in tags:
///
/// ```text
///              <-MMMMMMMMMMMMMMMMM
///                   MMMMMMMMMMMMMMMMM->
/// becomes
///              <-SSSMMMMMMMMMMMMMM
///                   MMMMMMMMMMMMMMSSS->
/// and, hard-clipped on top of that,
///              <-HHHMMMMMMMMMMMMMM
///                   MMMMMMMMMMMMMMHHH->
/// ```
pub fn clip_for_overlapping_reads(
    read1: &mut RecordBuf,
    read2: &mut RecordBuf,
    use_hard_clipping: bool,
) -> Result<()> {
    if read1.flags().is_unmapped() || read2.flags().is_unmapped() {
        return Ok(());
    }
    if read1.flags().is_reverse_complemented() == read2.flags().is_reverse_complemented() {
        return Ok(());
    }
    if !overlaps(read1, read2) {
        return Ok(());
    }

    let (pos, neg) = if read1.flags().is_reverse_complemented() {
        (read2, read1)
    } else {
        (read1, read2)
    };

    // First soft-clip each 3' aligned end back to the mate's 5' aligned end
    clip_three_prime_ends_to_five_prime_ends(pos, neg, false, false)?;

    if use_hard_clipping {
        // Then hard-clip so the unclipped extents line up as well
        clip_three_prime_ends_to_five_prime_ends(pos, neg, true, true)?;
    }

    Ok(())
}

/// True when both records are placed on the same reference and their
/// aligned intervals intersect.
fn overlaps(a: &RecordBuf, b: &RecordBuf) -> bool {
    let (Some(a_ref), Some(b_ref)) = (a.reference_sequence_id(), b.reference_sequence_id()) else {
        return false;
    };
    if a_ref != b_ref {
        return false;
    }
    let (Some(a_start), Some(b_start)) =
        (a.alignment_start().map(usize::from), b.alignment_start().map(usize::from))
    else {
        return false;
    };
    let (Some(a_end), Some(b_end)) = (alignment_end(a), alignment_end(b)) else {
        return false;
    };
    a_start <= b_end && b_start <= a_end
}

fn clip_three_prime_ends_to_five_prime_ends(
    pos: &mut RecordBuf,
    neg: &mut RecordBuf,
    hard_clip: bool,
    use_unclipped_ends: bool,
) -> Result<()> {
    let mode = if hard_clip { ClippingMode::Hard } else { ClippingMode::Soft };

    let neg_end: isize = if use_unclipped_ends {
        unclipped_end(neg).map_or(0, |e| e as isize)
    } else {
        alignment_end(neg).map_or(0, |e| e as isize)
    };
    let pos_start: isize = if use_unclipped_ends {
        unclipped_start(pos).unwrap_or(0)
    } else {
        pos.alignment_start().map_or(0, |s| usize::from(s) as isize)
    };

    // For the positive strand we find the 3'-most base that stays, then
    // step one base toward 3' for the first base to clip: the lookup
    // returns the base before a deletion when the queried position falls
    // inside one.
    let pos_read_len = pos.sequence().len();
    let pos_three_prime_most_unclipped = read_pos_at_ref_pos_ignoring_soft_clips(pos, neg_end);
    if pos_three_prime_most_unclipped > 0 && pos_three_prime_most_unclipped < pos_read_len {
        clip_three_prime_end(pos, pos_three_prime_most_unclipped + 1, mode)?;
    }

    // For the negative strand the lookup gives the 5'-most base to clip,
    // counted from the aligned start; convert to a count from the 5' end of
    // the read.
    let neg_read_len = neg.sequence().len();
    let neg_five_prime_most_from_start = read_pos_at_ref_pos_ignoring_soft_clips(neg, pos_start - 1);
    let neg_first_base_to_clip = if neg_five_prime_most_from_start > 0 {
        (neg_read_len + 1).saturating_sub(neg_five_prime_most_from_start)
    } else {
        0
    };
    if neg_first_base_to_clip > 0 {
        clip_three_prime_end(neg, neg_first_base_to_clip, mode)?;
    }

    Ok(())
}

/// Computes the signed insert size between two ends of a pair.
///
/// Zero when either end is unmapped or the ends are placed on different
/// references; otherwise the 5'-to-5' distance, positive on the end whose
/// 5' position is leftmost.
#[must_use]
pub fn compute_insert_size(first_end: &RecordBuf, second_end: &RecordBuf) -> i32 {
    if first_end.flags().is_unmapped() || second_end.flags().is_unmapped() {
        return 0;
    }
    if first_end.reference_sequence_id() != second_end.reference_sequence_id() {
        return 0;
    }

    let five_prime_of = |rec: &RecordBuf| -> i64 {
        if rec.flags().is_reverse_complemented() {
            alignment_end(rec).unwrap_or(0) as i64
        } else {
            rec.alignment_start().map_or(0, usize::from) as i64
        }
    };

    let first = five_prime_of(first_end);
    let second = five_prime_of(second_end);
    let adjustment = if second >= first { 1 } else { -1 };
    (second - first + adjustment) as i32
}

/// Sets mate linkage fields on both ends of a pair.
///
/// Covers the three placement cases: both mapped (full linkage, template
/// lengths, optional MC tags), both unmapped (everything cleared), and one
/// mapped (the unmapped end is placed at its mate's coordinates per the SAM
/// convention).
pub fn set_mate_info(rec1: &mut RecordBuf, rec2: &mut RecordBuf, add_mate_cigar: bool) {
    let unmapped1 = rec1.flags().is_unmapped();
    let unmapped2 = rec2.flags().is_unmapped();

    if !unmapped1 && !unmapped2 {
        link_mates(rec1, rec2, add_mate_cigar);
        let insert = compute_insert_size(rec1, rec2);
        *rec1.template_length_mut() = insert;
        *rec2.template_length_mut() = -insert;
    } else if unmapped1 && unmapped2 {
        for rec in [&mut *rec1, &mut *rec2] {
            *rec.reference_sequence_id_mut() = None;
            *rec.alignment_start_mut() = None;
            *rec.mate_reference_sequence_id_mut() = None;
            *rec.mate_alignment_start_mut() = None;
            rec.flags_mut().set(Flags::MATE_UNMAPPED, true);
            *rec.template_length_mut() = 0;
            rec.data_mut().remove(&MATE_CIGAR);
        }
        rec1.flags_mut().set(
            Flags::MATE_REVERSE_COMPLEMENTED,
            rec2.flags().is_reverse_complemented(),
        );
        rec2.flags_mut().set(
            Flags::MATE_REVERSE_COMPLEMENTED,
            rec1.flags().is_reverse_complemented(),
        );
    } else {
        let (mapped, unmapped) = if unmapped1 { (rec2, rec1) } else { (rec1, rec2) };

        // Per SAM convention the unmapped end sits at its mate's position
        *unmapped.reference_sequence_id_mut() = mapped.reference_sequence_id();
        *unmapped.alignment_start_mut() = mapped.alignment_start();

        *mapped.mate_reference_sequence_id_mut() = mapped.reference_sequence_id();
        *mapped.mate_alignment_start_mut() = mapped.alignment_start();
        mapped
            .flags_mut()
            .set(Flags::MATE_REVERSE_COMPLEMENTED, unmapped.flags().is_reverse_complemented());
        mapped.flags_mut().set(Flags::MATE_UNMAPPED, true);
        mapped.data_mut().remove(&MATE_CIGAR);

        *unmapped.mate_reference_sequence_id_mut() = mapped.reference_sequence_id();
        *unmapped.mate_alignment_start_mut() = mapped.alignment_start();
        unmapped
            .flags_mut()
            .set(Flags::MATE_REVERSE_COMPLEMENTED, mapped.flags().is_reverse_complemented());
        unmapped.flags_mut().set(Flags::MATE_UNMAPPED, false);
        if add_mate_cigar {
            unmapped
                .data_mut()
                .insert(MATE_CIGAR, Value::String(cigar_to_string(&cigar_ops(mapped)).into()));
        }

        *mapped.template_length_mut() = 0;
        *unmapped.template_length_mut() = 0;
    }
}

fn link_mates(rec1: &mut RecordBuf, rec2: &mut RecordBuf, add_mate_cigar: bool) {
    *rec1.mate_reference_sequence_id_mut() = rec2.reference_sequence_id();
    *rec1.mate_alignment_start_mut() = rec2.alignment_start();
    rec1.flags_mut()
        .set(Flags::MATE_REVERSE_COMPLEMENTED, rec2.flags().is_reverse_complemented());
    rec1.flags_mut().set(Flags::MATE_UNMAPPED, false);

    *rec2.mate_reference_sequence_id_mut() = rec1.reference_sequence_id();
    *rec2.mate_alignment_start_mut() = rec1.alignment_start();
    rec2.flags_mut()
        .set(Flags::MATE_REVERSE_COMPLEMENTED, rec1.flags().is_reverse_complemented());
    rec2.flags_mut().set(Flags::MATE_UNMAPPED, false);

    if add_mate_cigar {
        let cigar1 = cigar_to_string(&cigar_ops(rec1));
        let cigar2 = cigar_to_string(&cigar_ops(rec2));
        rec1.data_mut().insert(MATE_CIGAR, Value::String(cigar2.into()));
        rec2.data_mut().insert(MATE_CIGAR, Value::String(cigar1.into()));
    } else {
        rec1.data_mut().remove(&MATE_CIGAR);
        rec2.data_mut().remove(&MATE_CIGAR);
    }
}

/// Sets or clears the proper-pair flag on both ends.
///
/// A pair is proper when both ends are mapped to the same reference and
/// the pair orientation is in the expected set.
pub fn set_proper_pair_flags(
    rec1: &mut RecordBuf,
    rec2: &mut RecordBuf,
    expected_orientations: &[PairOrientation],
) {
    let proper = !rec1.flags().is_unmapped()
        && !rec2.flags().is_unmapped()
        && rec1.reference_sequence_id() == rec2.reference_sequence_id()
        && expected_orientations.contains(&pair_orientation(rec1));
    rec1.flags_mut().set(Flags::PROPERLY_SEGMENTED, proper);
    rec2.flags_mut().set(Flags::PROPERLY_SEGMENTED, proper);
}

/// Sets mate linkage on a supplementary record from the primary hit of the
/// opposite end.
pub fn set_mate_info_on_supplemental(
    supplemental: &mut RecordBuf,
    mate_primary: &RecordBuf,
    add_mate_cigar: bool,
) {
    *supplemental.mate_reference_sequence_id_mut() = mate_primary.reference_sequence_id();
    *supplemental.mate_alignment_start_mut() = mate_primary.alignment_start();
    supplemental
        .flags_mut()
        .set(Flags::MATE_REVERSE_COMPLEMENTED, mate_primary.flags().is_reverse_complemented());
    supplemental.flags_mut().set(Flags::MATE_UNMAPPED, mate_primary.flags().is_unmapped());

    if add_mate_cigar && !mate_primary.flags().is_unmapped() {
        supplemental
            .data_mut()
            .insert(MATE_CIGAR, Value::String(cigar_to_string(&cigar_ops(mate_primary)).into()));
    } else {
        supplemental.data_mut().remove(&MATE_CIGAR);
    }

    *supplemental.template_length_mut() = compute_insert_size(supplemental, mate_primary);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam::builder::RecordPairBuilder;

    fn cigar_of(rec: &RecordBuf) -> String {
        cigar_to_string(&cigar_ops(rec))
    }

    /// A read-through pair: R1 forward at [100, 200], R2 reverse at
    /// [90, 190]. R1's 3' end extends past R2's 5' end (190) and R2's 3'
    /// end extends before R1's 5' start (100).
    fn read_through_pair() -> (RecordBuf, RecordBuf) {
        RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(101))
            .r2_sequence(&"A".repeat(101))
            .r1_start(100)
            .r2_start(90)
            .r1_cigar("101M")
            .r2_cigar("101M")
            .build()
    }

    #[test]
    fn test_overlap_soft_clip() {
        let (mut r1, mut r2) = read_through_pair();
        clip_for_overlapping_reads(&mut r1, &mut r2, false).unwrap();

        // R1's aligned end pulled back to R2's 5' end; R2's aligned start
        // pushed up to R1's 5' start
        assert_eq!(alignment_end(&r1), Some(190));
        assert_eq!(r2.alignment_start().map(usize::from), Some(100));
        assert_eq!(cigar_of(&r1), "91M10S");
        assert_eq!(cigar_of(&r2), "10S91M");
        // Soft clipping keeps the bases
        assert_eq!(r1.sequence().len(), 101);
        assert_eq!(r2.sequence().len(), 101);
    }

    #[test]
    fn test_overlap_clip_noop_without_read_through() {
        // Ordinary FR overlap: R1 [100, 200] forward, R2 [150, 250]
        // reverse. Neither 3' end passes the mate's 5' end, so nothing is
        // clipped.
        let (mut r1, mut r2) = RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(101))
            .r2_sequence(&"A".repeat(101))
            .r1_start(100)
            .r2_start(150)
            .r1_cigar("101M")
            .r2_cigar("101M")
            .build();
        clip_for_overlapping_reads(&mut r1, &mut r2, false).unwrap();
        assert_eq!(cigar_of(&r1), "101M");
        assert_eq!(cigar_of(&r2), "101M");
    }

    #[test]
    fn test_overlap_clip_idempotent() {
        let (mut r1, mut r2) = read_through_pair();
        clip_for_overlapping_reads(&mut r1, &mut r2, false).unwrap();
        let (snap1, snap2) = (r1.clone(), r2.clone());

        clip_for_overlapping_reads(&mut r1, &mut r2, false).unwrap();
        assert_eq!(r1, snap1);
        assert_eq!(r2, snap2);
    }

    #[test]
    fn test_overlap_hard_clip_stashes() {
        let (mut r1, mut r2) = read_through_pair();
        clip_for_overlapping_reads(&mut r1, &mut r2, true).unwrap();

        assert_eq!(cigar_of(&r1), "91M10H");
        assert_eq!(cigar_of(&r2), "10H91M");
        assert_eq!(r1.sequence().len(), 91);
        assert_eq!(r2.sequence().len(), 91);
        assert!(r1.data().get(&crate::tags::HARD_CLIPPED_BASES).is_some());
        assert!(r2.data().get(&crate::tags::HARD_CLIPPED_BASES).is_some());
        // Hard clipping leaves the unclipped extents aligned with the mate
        assert_eq!(alignment_end(&r1), Some(190));
        assert_eq!(r2.alignment_start().map(usize::from), Some(100));
    }

    #[test]
    fn test_no_clip_when_not_overlapping() {
        let (mut r1, mut r2) = RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(50))
            .r2_sequence(&"A".repeat(50))
            .r1_start(100)
            .r2_start(500)
            .build();
        clip_for_overlapping_reads(&mut r1, &mut r2, false).unwrap();
        assert_eq!(cigar_of(&r1), "50M");
        assert_eq!(cigar_of(&r2), "50M");
    }

    #[test]
    fn test_no_clip_on_same_strand() {
        let (mut r1, mut r2) = RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(101))
            .r2_sequence(&"A".repeat(101))
            .r1_start(100)
            .r2_start(150)
            .r2_reverse(false)
            .build();
        clip_for_overlapping_reads(&mut r1, &mut r2, false).unwrap();
        assert_eq!(cigar_of(&r1), "101M");
    }

    #[test]
    fn test_compute_insert_size() {
        let (r1, r2) = RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(100))
            .r2_sequence(&"A".repeat(100))
            .r1_start(100)
            .r2_start(200)
            .build();
        // R1 5' = 100, R2 5' = alignment end = 299: insert = 200
        assert_eq!(compute_insert_size(&r1, &r2), 200);
        assert_eq!(compute_insert_size(&r2, &r1), -200);
    }

    #[test]
    fn test_set_mate_info_both_mapped() {
        let (mut r1, mut r2) = RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(100))
            .r2_sequence(&"A".repeat(100))
            .r1_start(100)
            .r2_start(200)
            .build();
        set_mate_info(&mut r2, &mut r1, true);

        assert_eq!(r1.mate_alignment_start().map(usize::from), Some(200));
        assert_eq!(r2.mate_alignment_start().map(usize::from), Some(100));
        assert!(r1.flags().is_mate_reverse_complemented());
        assert!(!r2.flags().is_mate_reverse_complemented());
        assert_eq!(
            r1.data().get(&MATE_CIGAR),
            Some(&Value::String("100M".into()))
        );
        assert_eq!(r1.template_length(), -r2.template_length());
        assert_ne!(r1.template_length(), 0);
    }

    #[test]
    fn test_set_mate_info_one_unmapped_places_mate() {
        let (mut r1, mut r2) = RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(100))
            .r2_sequence(&"A".repeat(100))
            .r1_start(100)
            .build(); // no r2_start: R2 unmapped
        set_mate_info(&mut r2, &mut r1, true);

        // Unmapped end placed at its mate's coordinates
        assert_eq!(r2.reference_sequence_id(), r1.reference_sequence_id());
        assert_eq!(r2.alignment_start(), r1.alignment_start());
        assert!(r1.flags().is_mate_unmapped());
        assert!(!r2.flags().is_mate_unmapped());
        assert_eq!(r1.template_length(), 0);
        assert_eq!(r2.template_length(), 0);
        // Only the unmapped end carries MC (its mate is mapped)
        assert!(r1.data().get(&MATE_CIGAR).is_none());
        assert!(r2.data().get(&MATE_CIGAR).is_some());
    }

    #[test]
    fn test_set_mate_info_both_unmapped() {
        let (mut r1, mut r2) = RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(100))
            .r2_sequence(&"A".repeat(100))
            .build();
        set_mate_info(&mut r2, &mut r1, true);
        for rec in [&r1, &r2] {
            assert_eq!(rec.reference_sequence_id(), None);
            assert_eq!(rec.mate_reference_sequence_id(), None);
            assert!(rec.flags().is_mate_unmapped());
            assert_eq!(rec.template_length(), 0);
        }
    }

    #[test]
    fn test_proper_pair_fr_expected() {
        let (mut r1, mut r2) = RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(100))
            .r2_sequence(&"A".repeat(100))
            .r1_start(100)
            .r2_start(200)
            .build();
        set_mate_info(&mut r2, &mut r1, false);
        set_proper_pair_flags(&mut r2, &mut r1, &[PairOrientation::FR]);
        assert!(r1.flags().is_properly_segmented());
        assert!(r2.flags().is_properly_segmented());

        // The same pair is not proper when only RF is expected
        set_proper_pair_flags(&mut r2, &mut r1, &[PairOrientation::RF]);
        assert!(!r1.flags().is_properly_segmented());
    }

    #[test]
    fn test_proper_pair_requires_both_mapped() {
        let (mut r1, mut r2) = RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(100))
            .r2_sequence(&"A".repeat(100))
            .r1_start(100)
            .build();
        set_mate_info(&mut r2, &mut r1, false);
        set_proper_pair_flags(&mut r2, &mut r1, &[PairOrientation::FR]);
        assert!(!r1.flags().is_properly_segmented());
        assert!(!r2.flags().is_properly_segmented());
    }

    #[test]
    fn test_supplemental_mate_info() {
        let (r1, _r2) = RecordPairBuilder::new()
            .name("pair")
            .r1_sequence(&"A".repeat(100))
            .r2_sequence(&"A".repeat(100))
            .r1_start(100)
            .r2_start(200)
            .build();

        let mut supp = crate::sam::builder::RecordBuilder::new()
            .name("pair")
            .sequence(&"A".repeat(40))
            .reference_sequence_id(0)
            .alignment_start(5000)
            .cigar("40M")
            .first_segment(false)
            .supplementary(true)
            .build();

        set_mate_info_on_supplemental(&mut supp, &r1, true);
        assert_eq!(supp.mate_alignment_start().map(usize::from), Some(100));
        assert!(!supp.flags().is_mate_unmapped());
        assert_eq!(
            supp.data().get(&MATE_CIGAR),
            Some(&Value::String("100M".into()))
        );
    }

}
