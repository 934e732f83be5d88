//! Tag namespace policy for the merge.
//!
//! The unmapped template owns its reserved tags; the aligner's output may
//! only override them when explicitly retained. A tag is reserved iff its
//! first byte is an ASCII lowercase letter or one of `X`, `Y`, `Z`.

use ahash::AHashSet;
use log::info;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::data::field::Value;

use crate::sam::record_utils::{cigar_ops, cigar_to_string};

/// Program group id.
pub const PROGRAM_GROUP: Tag = Tag::new(b'P', b'G');
/// Original alignment, written when contaminant unmapping preserves the mapping.
pub const ORIGINAL_ALIGNMENT: Tag = Tag::new(b'O', b'A');
/// Free-text comment.
pub const COMMENT: Tag = Tag::new(b'C', b'O');
/// Stashed hard-clipped bases, in sequencer order.
pub const HARD_CLIPPED_BASES: Tag = Tag::new(b'X', b'B');
/// Stashed hard-clipped base qualities, Phred+33, in sequencer order.
pub const HARD_CLIPPED_QUALITIES: Tag = Tag::new(b'X', b'Q');
/// Adapter start position (1-based), marked on the unmapped template.
pub const ADAPTER_START: Tag = Tag::new(b'X', b'T');
/// Mate CIGAR.
pub const MATE_CIGAR: Tag = Tag::new(b'M', b'C');
/// Edit distance.
pub const NM: Tag = Tag::new(b'N', b'M');
/// Mismatching positions string.
pub const MD: Tag = Tag::new(b'M', b'D');
/// Phred likelihood of the segment (sum of mismatch qualities).
pub const UQ: Tag = Tag::new(b'U', b'Q');

/// Comment appended to contaminant records.
pub const CONTAMINATION_COMMENT: &str = "Cross-species contamination";

/// Returns true if the tag belongs to the reserved namespace.
///
/// Reserved tags are carried from the unmapped template and never
/// overridden by the aligner unless explicitly listed in the retain set.
#[must_use]
pub fn is_reserved_tag(tag: Tag) -> bool {
    let first = tag.as_ref()[0];
    first.is_ascii_lowercase() || matches!(first, b'X' | b'Y' | b'Z')
}

/// Which aligner tags may be copied onto the template.
///
/// The remove set wins over the retain set; entries in both are dropped
/// from retain at construction with an info-level log line.
#[derive(Debug, Clone, Default)]
pub struct TagPolicy {
    retain: AHashSet<Tag>,
    remove: AHashSet<Tag>,
}

impl TagPolicy {
    /// Creates a policy from retain and remove sets.
    #[must_use]
    pub fn new(retain: AHashSet<Tag>, remove: AHashSet<Tag>) -> Self {
        let mut retain = retain;
        for tag in &remove {
            if retain.remove(tag) {
                info!(
                    "Overriding retaining the {} tag since 'remove' overrides 'retain'.",
                    String::from_utf8_lossy(tag.as_ref())
                );
            }
        }
        Self { retain, remove }
    }

    /// Should the aligner's value for `tag` be copied onto the template?
    #[must_use]
    pub fn should_copy(&self, tag: Tag) -> bool {
        (!is_reserved_tag(tag) || self.retain.contains(&tag)) && !self.remove.contains(&tag)
    }
}

/// Tag sets that must be reversed or reverse-complemented when a record's
/// bases are flipped onto the opposite strand.
///
/// Defaults are the SAM-defined per-base tags: OQ and U2 are reversed,
/// E2 and SQ are reverse-complemented.
#[derive(Debug, Clone)]
pub struct ReverseSets {
    /// Tags whose values are reversed on strand flip.
    pub reverse: AHashSet<Tag>,
    /// Tags whose values are reverse-complemented on strand flip.
    pub reverse_complement: AHashSet<Tag>,
}

impl Default for ReverseSets {
    fn default() -> Self {
        let reverse = [Tag::new(b'O', b'Q'), Tag::new(b'U', b'2')].into_iter().collect();
        let reverse_complement = [Tag::new(b'E', b'2'), Tag::new(b'S', b'Q')].into_iter().collect();
        Self { reverse, reverse_complement }
    }
}

/// Extracts an integer from any of the SAM integer value types.
#[must_use]
pub fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Int8(v) => Some(i64::from(*v)),
        Value::UInt8(v) => Some(i64::from(*v)),
        Value::Int16(v) => Some(i64::from(*v)),
        Value::UInt16(v) => Some(i64::from(*v)),
        Value::Int32(v) => Some(i64::from(*v)),
        Value::UInt32(v) => Some(i64::from(*v)),
        _ => None,
    }
}

/// Encodes a record's mapping as `contig,start,cigar,mapq,NM;`.
///
/// A missing NM tag is encoded as an empty final field. The contig name is
/// resolved through `contig_name` so the encoding is independent of
/// dictionary order.
#[must_use]
pub fn encode_mapping_information(record: &RecordBuf, contig_name: &str) -> String {
    let start = record.alignment_start().map_or(0, usize::from);
    let cigar = cigar_to_string(&cigar_ops(record));
    let mapq = record.mapping_quality().map_or(0, u8::from);
    let nm = record.data().get(&NM).and_then(int_value).map_or_else(String::new, |v| v.to_string());
    format!("{contig_name},{start},{cigar},{mapq},{nm};")
}

/// Appends a comment to the record's CO tag, `" | "`-separated when a
/// comment already exists.
pub fn append_comment(record: &mut RecordBuf, text: &str) {
    let combined = match record.data().get(&COMMENT) {
        Some(Value::String(existing)) if !existing.is_empty() => {
            format!("{} | {text}", String::from_utf8_lossy(existing.as_ref()))
        }
        _ => text.to_string(),
    };
    record.data_mut().insert(COMMENT, Value::String(combined.into()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam::builder::RecordBuilder;

    fn tag(name: &str) -> Tag {
        let b = name.as_bytes();
        Tag::new(b[0], b[1])
    }

    #[test]
    fn test_is_reserved_tag() {
        for name in ["XT", "XB", "YA", "ZZ", "aa", "xq", "pa"] {
            assert!(is_reserved_tag(tag(name)), "{name} should be reserved");
        }
        for name in ["NM", "MD", "RG", "AS", "MC", "E2", "OQ"] {
            assert!(!is_reserved_tag(tag(name)), "{name} should not be reserved");
        }
    }

    #[test]
    fn test_policy_default_copies_public_tags_only() {
        let policy = TagPolicy::default();
        assert!(policy.should_copy(tag("NM")));
        assert!(policy.should_copy(tag("AS")));
        assert!(!policy.should_copy(tag("XT")));
        assert!(!policy.should_copy(tag("zz")));
    }

    #[test]
    fn test_policy_retain_overrides_reserved() {
        let policy = TagPolicy::new([tag("XS")].into_iter().collect(), AHashSet::new());
        assert!(policy.should_copy(tag("XS")));
        assert!(!policy.should_copy(tag("XT")));
    }

    #[test]
    fn test_policy_remove_wins_over_retain() {
        let policy = TagPolicy::new(
            [tag("XS")].into_iter().collect(),
            [tag("XS"), tag("NM")].into_iter().collect(),
        );
        assert!(!policy.should_copy(tag("XS")));
        assert!(!policy.should_copy(tag("NM")));
    }

    #[test]
    fn test_encode_mapping_information() {
        let record = RecordBuilder::new()
            .name("q")
            .sequence(&"A".repeat(50))
            .reference_sequence_id(0)
            .alignment_start(1000)
            .cigar("50M")
            .mapping_quality(60)
            .tag("NM", 0i32)
            .build();
        assert_eq!(encode_mapping_information(&record, "chr1"), "chr1,1000,50M,60,0;");
    }

    #[test]
    fn test_encode_mapping_information_missing_nm() {
        let record = RecordBuilder::new()
            .name("q")
            .sequence("ACGT")
            .reference_sequence_id(0)
            .alignment_start(7)
            .cigar("4M")
            .mapping_quality(11)
            .build();
        assert_eq!(encode_mapping_information(&record, "chr2"), "chr2,7,4M,11,;");
    }

    #[test]
    fn test_append_comment() {
        let mut record = RecordBuilder::new().name("q").sequence("ACGT").build();
        append_comment(&mut record, CONTAMINATION_COMMENT);
        assert_eq!(
            record.data().get(&COMMENT),
            Some(&Value::String(CONTAMINATION_COMMENT.into()))
        );

        append_comment(&mut record, "second");
        assert_eq!(
            record.data().get(&COMMENT),
            Some(&Value::String(format!("{CONTAMINATION_COMMENT} | second").into()))
        );
    }
}
