//! Transfer of alignment information onto the unmapped template.
//!
//! The unmapped template carries the read's provenance (read group,
//! barcodes, adapter marks, original qualities); the aligner's record
//! carries where the bases landed. [`TransferEngine`] copies the alignment
//! core fields and non-reserved tags onto the template, normalizes strand,
//! re-adds soft clips for bases the aligner never saw, clips overhangs off
//! the reference end, and — when asked — converts contaminant alignments
//! back into unmapped records.

use anyhow::{Context, Result};
use log::warn;
use noodles::sam::Header;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::Cigar;
use noodles::sam::alignment::record_buf::data::field::Value;

use crate::clipper::{
    ClippingMode, add_soft_clips_to_ends_of_cigar, clip_three_prime_end, soft_clip_overhang_end,
    soft_clip_ops_past_reference_end,
};
use crate::errors::MergeError;
use crate::merge::MergeConfig;
use crate::pairs;
use crate::record::{make_unmapped, reverse_complement_record};
use crate::sam::record_utils::{
    cigar_ops, cigar_to_string, maps_no_bases_to_reference, reference_length, try_parse_cigar,
};
use crate::tags::{
    ADAPTER_START, CONTAMINATION_COMMENT, MATE_CIGAR, NM, ORIGINAL_ALIGNMENT, TagPolicy,
    append_comment, encode_mapping_information, int_value,
};

/// What happens to a record whose mapping information is being removed
/// because of cross-species contamination.
///
/// Each strategy carries three facets: whether the reference/start/NM are
/// reset, whether the original mapping is preserved in the `OA` tag, and
/// whether the record is kept valid as an unmapped read (mapping quality
/// and CIGAR cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmappingStrategy {
    /// Leave the mapping on the record; no additional tag.
    #[default]
    DoNotChange,
    /// Leave the mapping on the record even where that leaves an invalid
    /// unmapped record; no additional tag.
    DoNotChangeInvalid,
    /// Leave the mapping on the record and copy it to the `OA` tag.
    CopyToTag,
    /// Move the mapping to the `OA` tag and reset the standard fields.
    MoveToTag,
}

impl UnmappingStrategy {
    /// Whether the reference index, alignment start, and NM tag are reset.
    #[must_use]
    pub const fn resets_mapping_information(self) -> bool {
        matches!(self, Self::MoveToTag)
    }

    /// Whether the original mapping is encoded into the `OA` tag.
    #[must_use]
    pub const fn populates_oa_tag(self) -> bool {
        matches!(self, Self::CopyToTag | Self::MoveToTag)
    }

    /// Whether the record must remain a valid unmapped record (mapping
    /// quality zero, no CIGAR).
    #[must_use]
    pub const fn keeps_valid(self) -> bool {
        !matches!(self, Self::DoNotChangeInvalid)
    }
}

/// Copies alignment information onto unmapped templates.
pub struct TransferEngine<'a> {
    config: &'a MergeConfig,
    tag_policy: &'a TagPolicy,
    merged_header: &'a Header,
    aligned_header: &'a Header,
}

impl<'a> TransferEngine<'a> {
    /// Creates an engine over the merged output header and the aligned
    /// input's header (used to resolve the aligner's reference names).
    #[must_use]
    pub fn new(
        config: &'a MergeConfig,
        tag_policy: &'a TagPolicy,
        merged_header: &'a Header,
        aligned_header: &'a Header,
    ) -> Self {
        Self { config, tag_policy, merged_header, aligned_header }
    }

    /// Copies alignment info from `aligned` onto the unmapped `template`,
    /// clips as appropriate, and optionally unmaps a contaminant.
    ///
    /// A record left with a CIGAR mapping no bases to the reference, or
    /// whose alignment starts past the end of its reference sequence, is
    /// unmapped and the event logged as a warning.
    pub fn transfer_to_fragment(
        &self,
        template: &mut RecordBuf,
        aligned: &RecordBuf,
        unmap_contaminant: bool,
        needs_safe_rc: bool,
    ) -> Result<()> {
        self.set_values_from_alignment(template, aligned, needs_safe_rc)?;
        self.update_cigar_for_trimmed_or_clipped_bases(template, aligned)?;

        let was_mapped = !template.flags().is_unmapped();
        if maps_no_bases_to_reference(&cigar_ops(template)) {
            if was_mapped {
                warn!(
                    "Record contains no unclipped bases; making unmapped: {}",
                    display_name(template)
                );
            }
            make_unmapped(template, &self.config.reverse_sets);
        } else if self.maps_entirely_beyond_reference_end(aligned)? {
            warn!("Record mapped off end of reference; making unmapped: {}", display_name(template));
            make_unmapped(template, &self.config.reverse_sets);
        } else if unmap_contaminant {
            self.unmap_contaminant_read(template, aligned)?;
        }

        Ok(())
    }

    /// Transfers alignment info onto both ends of a pair, then applies
    /// overlap clipping, mate linkage, and proper-pair determination.
    ///
    /// Either aligned side may be absent (no alignment for that end); the
    /// corresponding template is left unmapped and linked to its mate.
    pub fn transfer_to_pair(
        &self,
        first: &mut RecordBuf,
        second: &mut RecordBuf,
        first_aligned: Option<&RecordBuf>,
        second_aligned: Option<&RecordBuf>,
        unmap_contaminant: bool,
        needs_safe_rc: bool,
    ) -> Result<()> {
        if let Some(aligned) = first_aligned {
            self.transfer_to_fragment(first, aligned, unmap_contaminant, needs_safe_rc)?;
        }
        if let Some(aligned) = second_aligned {
            self.transfer_to_fragment(second, aligned, unmap_contaminant, needs_safe_rc)?;
        }

        if self.config.clip_overlapping {
            pairs::clip_for_overlapping_reads(first, second, self.config.hard_clip_overlapping)?;
        }
        pairs::set_mate_info(second, first, self.config.add_mate_cigar);
        if !self.config.keep_aligner_proper_pair {
            pairs::set_proper_pair_flags(second, first, &self.config.expected_orientations);
        }

        Ok(())
    }

    /// Sets the alignment core fields and non-reserved tags on the
    /// template, preserving everything else the template carries.
    fn set_values_from_alignment(
        &self,
        rec: &mut RecordBuf,
        alignment: &RecordBuf,
        needs_safe_rc: bool,
    ) -> Result<()> {
        if !rec.flags().is_unmapped() {
            return Err(MergeError::UnalignedBamContainsMapped { name: display_name(rec) }.into());
        }

        // Copy over non-reserved attributes; the remove set wins.
        for (tag, value) in alignment.data().iter() {
            let bytes: &[u8] = tag.as_ref();
            let tag = Tag::new(bytes[0], bytes[1]);
            if self.tag_policy.should_copy(tag) {
                rec.data_mut().insert(tag, value.clone());
            }
        }

        let aligned_flags = alignment.flags();
        rec.flags_mut().set(Flags::UNMAPPED, aligned_flags.is_unmapped());

        // Resolve the reference by name rather than index, in case the two
        // dictionaries are ordered differently.
        match alignment.reference_sequence_id() {
            Some(aligned_ref_id) => {
                let (name, _) = self
                    .aligned_header
                    .reference_sequences()
                    .get_index(aligned_ref_id)
                    .context("Aligned record reference id not in aligned header")?;
                let key: &[u8] = name.as_ref();
                let merged_id = self
                    .merged_header
                    .reference_sequences()
                    .get_index_of(key)
                    .ok_or_else(|| MergeError::ReferenceNotFound {
                        ref_name: String::from_utf8_lossy(key).into_owned(),
                    })?;
                *rec.reference_sequence_id_mut() = Some(merged_id);
            }
            None => *rec.reference_sequence_id_mut() = None,
        }
        *rec.alignment_start_mut() = alignment.alignment_start();

        rec.flags_mut().set(Flags::REVERSE_COMPLEMENTED, aligned_flags.is_reverse_complemented());
        rec.flags_mut().set(Flags::SECONDARY, aligned_flags.is_secondary());
        rec.flags_mut().set(Flags::SUPPLEMENTARY, aligned_flags.is_supplementary());

        if !aligned_flags.is_unmapped() {
            // Only aligned reads carry a CIGAR and mapping quality; the
            // CIGAR may still change in the clipping steps below.
            *rec.cigar_mut() = Cigar::from(cigar_ops(alignment));
            *rec.mapping_quality_mut() = alignment.mapping_quality();
        }
        if rec.flags().is_segmented() {
            rec.flags_mut().set(Flags::PROPERLY_SEGMENTED, aligned_flags.is_properly_segmented());
            // Mate info and template length are set by the pair fixer.
        }

        // Negative strand: store bases and qualities reference-oriented
        if rec.flags().is_reverse_complemented() {
            let sets = &self.config.reverse_sets;
            reverse_complement_record(rec, &sets.reverse_complement, &sets.reverse, !needs_safe_rc)?;
        }

        Ok(())
    }

    /// Re-adds soft clips for trimmed and unwritten bases, clips reference
    /// overhangs (read and mate CIGAR), and applies adapter clipping.
    fn update_cigar_for_trimmed_or_clipped_bases(
        &self,
        rec: &mut RecordBuf,
        alignment: &RecordBuf,
    ) -> Result<()> {
        let alignment_read_length = alignment.sequence().len();
        let original_read_length = rec.sequence().len();
        let trimmed = if !rec.flags().is_segmented() || rec.flags().is_first_segment() {
            self.config.read1_trim.unwrap_or(0)
        } else {
            self.config.read2_trim.unwrap_or(0)
        };
        let not_written = original_read_length.saturating_sub(alignment_read_length + trimmed);

        self.clip_overhanging_ends(rec)?;

        if !rec.flags().is_unmapped() && (not_written > 0 || trimmed > 0) {
            let ops = add_soft_clips_to_ends_of_cigar(
                &cigar_ops(rec),
                rec.flags().is_reverse_complemented(),
                not_written,
                trimmed,
            );
            *rec.cigar_mut() = Cigar::from(ops);
        }

        // Adapter marked on the template and adapter clipping requested
        if self.config.clip_adapters && !rec.flags().is_unmapped() {
            if let Some(adapter_start) = rec.data().get(&ADAPTER_START).and_then(int_value) {
                if adapter_start > 0 {
                    clip_three_prime_end(rec, adapter_start as usize, ClippingMode::Soft)?;
                }
            }
        }

        Ok(())
    }

    /// Soft-clips the read, and the mate CIGAR when present, where they
    /// hang off the end of their reference sequences.
    fn clip_overhanging_ends(&self, rec: &mut RecordBuf) -> Result<()> {
        if !rec.flags().is_unmapped() {
            if let Some(ref_id) = rec.reference_sequence_id() {
                let ref_len = self.reference_length_of(ref_id)?;
                soft_clip_overhang_end(rec, ref_len);
            }
        }

        if rec.flags().is_mate_unmapped() {
            return Ok(());
        }
        let mate_cigar = match rec.data().get(&MATE_CIGAR) {
            Some(Value::String(s)) => String::from_utf8_lossy(s.as_ref()).into_owned(),
            _ => return Ok(()),
        };
        let (Some(mate_ref), Some(mate_start)) =
            (rec.mate_reference_sequence_id(), rec.mate_alignment_start())
        else {
            return Ok(());
        };
        let Some(mate_ops) = try_parse_cigar(&mate_cigar) else { return Ok(()) };
        if mate_ops.is_empty() {
            return Ok(());
        }
        let mate_end = usize::from(mate_start) + reference_length(&mate_ops).saturating_sub(1);
        let ref_len = self.reference_length_of(mate_ref)?;
        if let Some(new_ops) = soft_clip_ops_past_reference_end(&mate_ops, mate_end, ref_len) {
            rec.data_mut().insert(MATE_CIGAR, Value::String(cigar_to_string(&new_ops).into()));
        }

        Ok(())
    }

    /// True when the alignment's start is past the end of its reference.
    fn maps_entirely_beyond_reference_end(&self, aligned: &RecordBuf) -> Result<bool> {
        if aligned.flags().is_unmapped() {
            return Ok(false);
        }
        let (Some(ref_id), Some(start)) =
            (aligned.reference_sequence_id(), aligned.alignment_start())
        else {
            return Ok(false);
        };
        let (_, map) = self
            .aligned_header
            .reference_sequences()
            .get_index(ref_id)
            .context("Aligned record reference id not in aligned header")?;
        Ok(usize::from(start) > usize::from(map.length()))
    }

    fn reference_length_of(&self, ref_id: usize) -> Result<usize> {
        let (_, map) = self
            .merged_header
            .reference_sequences()
            .get_index(ref_id)
            .context("Record reference id not in merged header")?;
        Ok(usize::from(map.length()))
    }

    /// Applies the configured unmapping strategy to a contaminant record.
    fn unmap_contaminant_read(&self, rec: &mut RecordBuf, aligned: &RecordBuf) -> Result<()> {
        let strategy = self.config.unmapping_strategy;

        if strategy.populates_oa_tag() {
            if let Some(ref_id) = aligned.reference_sequence_id() {
                let (name, _) = self
                    .aligned_header
                    .reference_sequences()
                    .get_index(ref_id)
                    .context("Aligned record reference id not in aligned header")?;
                let contig = String::from_utf8_lossy(name.as_ref());
                let encoded = encode_mapping_information(aligned, &contig);
                rec.data_mut().insert(ORIGINAL_ALIGNMENT, Value::String(encoded.into()));
            }
        }

        if strategy.resets_mapping_information() {
            *rec.reference_sequence_id_mut() = None;
            *rec.alignment_start_mut() = None;
            rec.data_mut().remove(&NM);
        }

        rec.flags_mut().set(Flags::UNMAPPED, true);

        // An unmapped read cannot carry a mapping quality or CIGAR and
        // remain valid.
        if strategy.keeps_valid() {
            *rec.mapping_quality_mut() = None;
            *rec.cigar_mut() = Cigar::default();
        }

        append_comment(rec, CONTAMINATION_COMMENT);
        Ok(())
    }
}

fn display_name(rec: &RecordBuf) -> String {
    rec.name().map_or_else(String::new, |n| String::from_utf8_lossy(n.as_ref()).into_owned())
}
