//! Whole-record operations: strand normalization and unmapping.

use anyhow::{Result, bail};
use bstr::ByteSlice;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::data::field::value::Array;
use noodles::sam::alignment::record_buf::{Cigar, QualityScores, Sequence};

use crate::dna::{is_iupac, reverse_complement};
use crate::tags::ReverseSets;

/// Returns true for secondary or supplementary records.
#[must_use]
pub fn is_secondary_or_supplementary(record: &RecordBuf) -> bool {
    let flags = record.flags();
    flags.is_secondary() || flags.is_supplementary()
}

/// Reverse complements a record in place.
///
/// The bases are reverse-complemented and the qualities reversed. String
/// values of tags in `rc_tags` are reverse-complemented; string and array
/// values of tags in `rev_tags` are reversed. When `fast` is false each
/// base is checked to be a valid IUPAC code first, so that a record with
/// arbitrary bytes in its sequence is rejected rather than silently
/// mangled.
pub fn reverse_complement_record(
    record: &mut RecordBuf,
    rc_tags: &ahash::AHashSet<noodles::sam::alignment::record::data::field::Tag>,
    rev_tags: &ahash::AHashSet<noodles::sam::alignment::record::data::field::Tag>,
    fast: bool,
) -> Result<()> {
    if !fast {
        if let Some(&bad) = record.sequence().as_ref().iter().find(|b| !is_iupac(**b)) {
            bail!("Cannot reverse complement record: invalid base 0x{bad:02x} in sequence");
        }
    }

    let seq = reverse_complement(record.sequence().as_ref());
    *record.sequence_mut() = Sequence::from(seq);

    let mut quals: Vec<u8> = record.quality_scores().as_ref().to_vec();
    quals.reverse();
    *record.quality_scores_mut() = QualityScores::from(quals);

    for tag in rc_tags {
        if let Some(Value::String(bases)) = record.data().get(tag) {
            let flipped = reverse_complement(bases.as_ref());
            record.data_mut().insert(*tag, Value::String(flipped.into()));
        }
    }

    for tag in rev_tags {
        if let Some(value) = record.data().get(tag) {
            if let Some(reversed) = reverse_value(value) {
                record.data_mut().insert(*tag, reversed);
            }
        }
    }

    Ok(())
}

/// Reverses a string or array tag value; scalar values are left alone.
fn reverse_value(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) => {
            let mut bytes: Vec<u8> = s.as_bytes().to_vec();
            bytes.reverse();
            Some(Value::String(bytes.into()))
        }
        Value::Array(arr) => {
            let reversed = match arr {
                Array::Int8(values) => {
                    let mut v = values.clone();
                    v.reverse();
                    Value::from(v)
                }
                Array::UInt8(values) => {
                    let mut v = values.clone();
                    v.reverse();
                    Value::from(v)
                }
                Array::Int16(values) => {
                    let mut v = values.clone();
                    v.reverse();
                    Value::from(v)
                }
                Array::UInt16(values) => {
                    let mut v = values.clone();
                    v.reverse();
                    Value::from(v)
                }
                Array::Int32(values) => {
                    let mut v = values.clone();
                    v.reverse();
                    Value::from(v)
                }
                Array::UInt32(values) => {
                    let mut v = values.clone();
                    v.reverse();
                    Value::from(v)
                }
                Array::Float(values) => {
                    let mut v = values.clone();
                    v.reverse();
                    Value::from(v)
                }
            };
            Some(reversed)
        }
        _ => None,
    }
}

/// Strips all alignment information from a record, leaving a valid unmapped
/// read.
///
/// Negative-strand records are first flipped back to sequencer order (bases
/// reverse-complemented, qualities and the per-base tag sets reversed) and
/// the strand flag cleared. The duplicate, secondary, and proper-pair flags
/// are cleared; reference, start, CIGAR, mapping quality, and template
/// length are reset.
pub fn make_unmapped(record: &mut RecordBuf, sets: &ReverseSets) {
    if record.flags().is_reverse_complemented() {
        // Bases of IUPAC-clean aligner output flip safely.
        let _ = reverse_complement_record(record, &sets.reverse_complement, &sets.reverse, true);
        record.flags_mut().set(Flags::REVERSE_COMPLEMENTED, false);
    }

    record.flags_mut().set(Flags::DUPLICATE, false);
    record.flags_mut().set(Flags::SECONDARY, false);
    record.flags_mut().set(Flags::PROPERLY_SEGMENTED, false);
    record.flags_mut().set(Flags::UNMAPPED, true);

    *record.reference_sequence_id_mut() = None;
    *record.alignment_start_mut() = None;
    *record.mapping_quality_mut() = None;
    *record.cigar_mut() = Cigar::default();
    *record.template_length_mut() = 0;
}
