//! NM/MD/UQ recomputation against the reference.
//!
//! Clipping and strand flipping during the merge invalidate whatever edit
//! distance the aligner reported, so the final coordinate-sorted pass
//! recomputes the tags from the CIGAR, the read bases, and the reference:
//!
//! - **NM**: mismatches + inserted bases + deleted bases
//! - **MD**: mismatched and deleted reference bases, per the SAM spec
//! - **UQ**: sum of base qualities at mismatched positions
//!
//! In bisulfite mode, C→T mismatches (G→A for reverse-strand records) are
//! chemistry, not sequencing error, and are excluded from NM and UQ; MD
//! still records them as mismatches.

use anyhow::{Context, Result, bail};
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record_buf::data::field::Value;

use crate::reference::ReferenceSource;
use crate::sam::record_utils::cigar_ops;
use crate::tags::{MD, NM, UQ};

/// True when a read/reference mismatch is explained by bisulfite
/// conversion: C→T on the positive strand, G→A on the negative.
#[must_use]
pub fn is_bisulfite_converted(read_base: u8, ref_base: u8, negative_strand: bool) -> bool {
    let read = read_base.to_ascii_uppercase();
    let reference = ref_base.to_ascii_uppercase();
    if negative_strand {
        reference == b'G' && read == b'A'
    } else {
        reference == b'C' && read == b'T'
    }
}

/// Recomputes the NM, MD, and UQ tags on a mapped record.
///
/// Returns false without touching the record when it is unmapped or
/// carries the "no qualities" sentinel (empty quality scores).
pub fn fix_nm_md_uq(
    record: &mut RecordBuf,
    reference: &mut dyn ReferenceSource,
    bisulfite: bool,
) -> Result<bool> {
    if record.flags().is_unmapped() || record.quality_scores().as_ref().is_empty() {
        return Ok(false);
    }

    let ref_id = record.reference_sequence_id().context("Mapped record without reference id")?;
    let start = usize::from(record.alignment_start().context("Mapped record without start")?);
    let negative = record.flags().is_reverse_complemented();
    let ops = cigar_ops(record);

    let ref_span: usize = ops
        .iter()
        .filter(|op| {
            matches!(
                op.kind(),
                Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch | Kind::Deletion
            )
        })
        .map(|op| op.len())
        .sum();

    // A CIGAR with no reference-consuming operations gets neutral tags
    if ref_span == 0 {
        record.data_mut().insert(NM, Value::from(0i32));
        record.data_mut().insert(MD, Value::String("0".into()));
        record.data_mut().insert(UQ, Value::from(0i32));
        return Ok(false);
    }

    let contig = reference.get(ref_id)?;
    if start - 1 + ref_span > contig.len() {
        bail!(
            "Alignment spans [{start}, {}] but reference sequence {ref_id} is {} bp",
            start + ref_span - 1,
            contig.len()
        );
    }
    let ref_bases = contig[start - 1..start - 1 + ref_span].to_vec();

    let seq = record.sequence().as_ref().to_vec();
    let quals = record.quality_scores().as_ref().to_vec();

    let mut nm: i64 = 0;
    let mut uq: i64 = 0;
    let mut md = String::new();
    let mut ref_offset = 0usize;
    let mut seq_pos = 0usize;
    let mut match_count = 0usize;

    for op in &ops {
        let len = op.len();
        match op.kind() {
            Kind::Match | Kind::SequenceMatch | Kind::SequenceMismatch => {
                for &ref_base in &ref_bases[ref_offset..ref_offset + len] {
                    let seq_base =
                        seq.get(seq_pos).copied().context("Sequence index out of bounds")?;
                    let qual = quals.get(seq_pos).copied().context("Quality index out of bounds")?;

                    if seq_base.eq_ignore_ascii_case(&ref_base) && seq_base != b'N' {
                        match_count += 1;
                    } else {
                        // A mismatch always lands in MD; the bisulfite
                        // exemption only spares NM and UQ
                        if !(bisulfite && is_bisulfite_converted(seq_base, ref_base, negative)) {
                            nm += 1;
                            uq += i64::from(qual);
                        }
                        md.push_str(&match_count.to_string());
                        match_count = 0;
                        md.push(ref_base as char);
                    }
                    seq_pos += 1;
                }
                ref_offset += len;
            }
            Kind::Insertion => {
                nm += len as i64;
                seq_pos += len;
            }
            Kind::Deletion => {
                nm += len as i64;
                md.push_str(&match_count.to_string());
                match_count = 0;
                md.push('^');
                for &base in &ref_bases[ref_offset..ref_offset + len] {
                    md.push(base as char);
                }
                ref_offset += len;
            }
            Kind::SoftClip => {
                seq_pos += len;
            }
            Kind::HardClip | Kind::Pad | Kind::Skip => {}
        }
    }

    md.push_str(&match_count.to_string());

    record.data_mut().insert(NM, Value::from(nm.min(i64::from(i32::MAX)) as i32));
    record.data_mut().insert(MD, Value::from(md));
    record.data_mut().insert(UQ, Value::from(uq.min(i64::from(i32::MAX)) as i32));

    Ok(true)
}
