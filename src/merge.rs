//! The merge driver.
//!
//! One loop pulls from the unmapped stream and the grouped aligned stream,
//! joins them by read name, fans out over hits and supplementary
//! alignments, and pushes finished records to the output sink. Coordinate
//! output is re-sorted externally and gets its NM/MD/UQ tags recomputed on
//! the way to the writer.
//!
//! The order of processing:
//!
//! 1. Pull the next unmapped record (or adjacent pair) and validate pair
//!    invariants.
//! 2. Join against the grouped hits by read name; an aligned name the
//!    unmapped stream has already passed is fatal.
//! 3. Clone the template per hit, transfer the alignment, fix up the pair.
//! 4. Emit: every mapped output, plus at most one unmapped output per read
//!    name (the primary-slotted one).
//! 5. Expand supplementary hits, linked to the opposite end's primary.
//! 6. Drain the sort collection (coordinate order only), recomputing
//!    NM/MD/UQ against the reference.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use ahash::AHashSet;
use anyhow::Result;
use bstr::BString;
use bstr::ByteSlice;
use log::info;
use noodles::sam::Header;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::header::record::value::Map;
use noodles::sam::header::record::value::map::header::tag as header_tag;

use crate::errors::MergeError;
use crate::header::{ProgramRecord, chain_program_record};
use crate::hits::{HitGrouper, HitsForRead, PrimarySelection};
use crate::pairs::set_mate_info_on_supplemental;
use crate::progress::ProgressTracker;
use crate::record::is_secondary_or_supplementary;
use crate::reference::ReferenceSource;
use crate::sam::PairOrientation;
use crate::sam::alignment_tags::fix_nm_md_uq;
use crate::sam::record_utils::compare_read_names;
use crate::sink::{RecordSink, RecordWrite};
use crate::sort::{SortOrder, SortingCollection};
use crate::tags::{PROGRAM_GROUP, ReverseSets, TagPolicy};
use crate::transfer::{TransferEngine, UnmappingStrategy};

/// Default bound on records held in memory by the external sort.
pub const MAX_RECORDS_IN_RAM: usize = 500_000;

/// Configuration for a merge run.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Soft-clip adapter sequence marked in the `XT` tag.
    pub clip_adapters: bool,
    /// Treat C→T (G→A on the negative strand) mismatches as chemistry when
    /// recomputing NM/UQ.
    pub bisulfite: bool,
    /// Emit only reads that have alignment data.
    pub aligned_only: bool,
    /// Reserved tags the aligner may override anyway.
    pub attributes_retain: AHashSet<Tag>,
    /// Tags never copied from the aligner; wins over retain.
    pub attributes_remove: AHashSet<Tag>,
    /// Bases trimmed from the start of read 1 before alignment.
    pub read1_trim: Option<usize>,
    /// Bases trimmed from the start of read 2 before alignment.
    pub read2_trim: Option<usize>,
    /// Pair orientations considered proper.
    pub expected_orientations: Vec<PairOrientation>,
    /// Order of the output stream.
    pub sort_order: SortOrder,
    /// Maintain the mate CIGAR (`MC`) tag on paired records.
    pub add_mate_cigar: bool,
    /// Unmap reads whose hits the contaminant predicate flags.
    pub unmap_contaminants: bool,
    /// What unmapping a contaminant does to its mapping information.
    pub unmapping_strategy: UnmappingStrategy,
    /// Clip pairs whose ends sequence past each other.
    pub clip_overlapping: bool,
    /// Hard-clip (rather than soft-clip) overlap past the mate's unclipped
    /// boundary, stashing removed bases in `XB`/`XQ`.
    pub hard_clip_overlapping: bool,
    /// Emit secondary alignments.
    pub include_secondary: bool,
    /// Keep the aligner's proper-pair flags instead of recomputing them.
    pub keep_aligner_proper_pair: bool,
    /// Write the program record id to each record's `PG` tag.
    pub add_program_tag: bool,
    /// Program record to register in the output header.
    pub program_record: Option<ProgramRecord>,
    /// Bound on records held in memory by the external sort.
    pub max_records_in_ram: usize,
    /// Tag sets reversed / reverse-complemented on strand flips.
    pub reverse_sets: ReverseSets,
    /// Checked between records; when set, the merge stops without writing
    /// partial output.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            clip_adapters: true,
            bisulfite: false,
            aligned_only: false,
            attributes_retain: AHashSet::new(),
            attributes_remove: AHashSet::new(),
            read1_trim: None,
            read2_trim: None,
            expected_orientations: vec![PairOrientation::FR],
            sort_order: SortOrder::Coordinate,
            add_mate_cigar: true,
            unmap_contaminants: false,
            unmapping_strategy: UnmappingStrategy::default(),
            clip_overlapping: true,
            hard_clip_overlapping: false,
            include_secondary: true,
            keep_aligner_proper_pair: false,
            add_program_tag: true,
            program_record: None,
            max_records_in_ram: MAX_RECORDS_IN_RAM,
            reverse_sets: ReverseSets::default(),
            cancel: None,
        }
    }
}

/// Counters from a finished merge.
///
/// The counters are diagnostic: a supplementary hit unmapped by
/// contamination counts as unmapped even though it is never emitted, so
/// the totals need not equal the number of records written.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    /// Records emitted mapped.
    pub aligned: u64,
    /// Records counted unmapped.
    pub unmapped: u64,
    /// Transfers performed under a contaminant verdict.
    pub contaminants: u64,
}

/// Joins the unmapped stream with grouped aligner output.
pub struct AlignmentMerger {
    config: MergeConfig,
    tag_policy: TagPolicy,
    header: Header,
    aligned_header: Header,
    contaminant: Box<dyn Fn(&HitsForRead) -> bool>,
}

impl std::fmt::Debug for AlignmentMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignmentMerger")
            .field("config", &self.config)
            .field("tag_policy", &self.tag_policy)
            .field("header", &self.header)
            .field("aligned_header", &self.aligned_header)
            .finish_non_exhaustive()
    }
}

impl AlignmentMerger {
    /// Creates a merger.
    ///
    /// `merged_header` is the output header (read groups from the unmapped
    /// input plus the merged sequence dictionary); `aligned_header` is the
    /// aligned input's header, used to resolve its reference names. The
    /// configured program record is registered in the output header here;
    /// an id already present fails with
    /// [`MergeError::ProgramRecordCollision`].
    pub fn new(config: MergeConfig, merged_header: Header, aligned_header: Header) -> Result<Self> {
        let tag_policy =
            TagPolicy::new(config.attributes_retain.clone(), config.attributes_remove.clone());

        let mut header = merged_header;
        if let Some(pg) = &config.program_record {
            chain_program_record(&mut header, pg)?;
        }

        Ok(Self {
            config,
            tag_policy,
            header,
            aligned_header,
            contaminant: Box::new(|_| false),
        })
    }

    /// The output header (with the program record registered).
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Sets the predicate deciding, once per read name from the elected
    /// primary, whether the read is cross-species contamination.
    pub fn set_contaminant_predicate(
        &mut self,
        predicate: impl Fn(&HitsForRead) -> bool + 'static,
    ) {
        self.contaminant = Box::new(predicate);
    }

    /// Runs the merge.
    ///
    /// `unaligned` must produce records in original submission order with
    /// paired reads adjacent as first-then-second; `aligned` is the
    /// grouped aligner output; `reference` feeds the NM/MD/UQ
    /// recomputation of the coordinate-sorted post-pass (skipped when
    /// absent or in query-name/unsorted order).
    pub fn merge<U, A, P>(
        &self,
        mut unaligned: U,
        mut aligned: HitGrouper<A, P>,
        writer: &mut dyn RecordWrite,
        mut reference: Option<&mut dyn ReferenceSource>,
    ) -> Result<MergeStats>
    where
        U: Iterator<Item = Result<RecordBuf>>,
        A: Iterator<Item = Result<RecordBuf>>,
        P: PrimarySelection,
    {
        let output_header = self.output_header()?;
        let engine =
            TransferEngine::new(&self.config, &self.tag_policy, &self.header, &self.aligned_header);
        let progress = ProgressTracker::new("Merged records");
        let mut stats = MergeStats::default();

        let mut sink = if self.config.sort_order == SortOrder::Coordinate {
            RecordSink::Sorted(SortingCollection::new(
                output_header.clone(),
                self.config.max_records_in_ram,
            )?)
        } else {
            RecordSink::Direct(&mut *writer)
        };

        let mut next_hits = aligned.next().transpose()?;

        while let Some(result) = unaligned.next() {
            self.check_cancelled()?;
            let mut rec = result?;
            self.maybe_set_pg(&mut rec);

            let second = if rec.flags().is_segmented() {
                Some(self.read_second_of_pair(&mut unaligned, &rec)?)
            } else {
                None
            };

            let rec_name: Vec<u8> = rec.name().map_or_else(Vec::new, |n| n.as_bytes().to_vec());
            let matched = next_hits.as_ref().is_some_and(|h| h.name() == rec_name.as_slice());

            if matched {
                let hits = next_hits.take().unwrap();
                match &second {
                    Some(second) => self.process_paired_hits(
                        &engine,
                        &hits,
                        &rec,
                        second,
                        &mut sink,
                        &output_header,
                        &progress,
                        &mut stats,
                    )?,
                    None => self.process_fragment_hits(
                        &engine,
                        &hits,
                        &rec,
                        &mut sink,
                        &output_header,
                        &progress,
                        &mut stats,
                    )?,
                }
                next_hits = aligned.next().transpose()?;
            } else {
                if let Some(hits) = &next_hits {
                    if compare_read_names(&rec_name, hits.name()) == Ordering::Greater {
                        return Err(MergeError::AlignedAhead {
                            aligned: String::from_utf8_lossy(hits.name()).into_owned(),
                            unaligned: String::from_utf8_lossy(&rec_name).into_owned(),
                        }
                        .into());
                    }
                }
                // No alignment for this read (pair): pass it through as is
                if !self.config.aligned_only {
                    sink.add(&output_header, rec)?;
                    stats.unmapped += 1;
                    progress.log_if_needed(1);
                    if let Some(second) = second {
                        sink.add(&output_header, second)?;
                        stats.unmapped += 1;
                        progress.log_if_needed(1);
                    }
                }
            }
        }

        if let Some(hits) = next_hits {
            return Err(MergeError::UnalignedExhaustedEarly {
                name: String::from_utf8_lossy(hits.name()).into_owned(),
            }
            .into());
        }
        if let Some(result) = aligned.next() {
            let hits = result?;
            return Err(MergeError::UnalignedExhaustedEarly {
                name: String::from_utf8_lossy(hits.name()).into_owned(),
            }
            .into());
        }

        // Coordinate output: drain the sort and recompute reference-driven
        // tags on the way to the writer
        if let Some(drain) = sink.close()? {
            for result in drain {
                self.check_cancelled()?;
                let mut record = result?;
                if !record.flags().is_unmapped() {
                    if let Some(walker) = reference.as_deref_mut() {
                        fix_nm_md_uq(&mut record, walker, self.config.bisulfite)?;
                    }
                }
                writer.write_record(&output_header, &record)?;
            }
        }

        progress.log_final();
        info!(
            "Wrote {} alignment records and {} unmapped reads.",
            stats.aligned,
            if self.config.aligned_only { 0 } else { stats.unmapped }
        );
        if stats.contaminants > 0 {
            info!(
                "{} reads were unmapped due to suspicion of cross-species contamination.",
                stats.contaminants
            );
        }

        Ok(stats)
    }

    /// Reads and validates the second record of a pair.
    fn read_second_of_pair<U>(&self, unaligned: &mut U, first: &RecordBuf) -> Result<RecordBuf>
    where
        U: Iterator<Item = Result<RecordBuf>>,
    {
        let name = display_name(first);

        let Some(result) = unaligned.next() else {
            return Err(MergeError::PairingViolation {
                name,
                reason: "unmapped input ended before the second read of the pair".to_string(),
            }
            .into());
        };
        let mut second = result?;
        self.maybe_set_pg(&mut second);

        if first.name() != second.name() {
            return Err(MergeError::PairingViolation {
                name,
                reason: format!(
                    "second read from pair not found; saw '{}' instead",
                    display_name(&second)
                ),
            }
            .into());
        }
        if !first.flags().is_first_segment() {
            return Err(MergeError::PairingViolation {
                name,
                reason: "first record is not first of pair".to_string(),
            }
            .into());
        }
        if !second.flags().is_segmented() {
            return Err(MergeError::PairingViolation {
                name,
                reason: "second record is not marked as paired".to_string(),
            }
            .into());
        }
        if !second.flags().is_last_segment() {
            return Err(MergeError::PairingViolation {
                name,
                reason: "second record is not second of pair".to_string(),
            }
            .into());
        }

        Ok(second)
    }

    #[expect(clippy::too_many_arguments, reason = "driver fan-out shares loop state")]
    fn process_paired_hits(
        &self,
        engine: &TransferEngine<'_>,
        hits: &HitsForRead,
        rec: &RecordBuf,
        second: &RecordBuf,
        sink: &mut RecordSink<'_>,
        header: &Header,
        progress: &ProgressTracker,
        stats: &mut MergeStats,
    ) -> Result<()> {
        // With multiple hits or supplementals, every output row needs its
        // own copy of the template
        let clone_needed = hits.num_hits() > 1 || hits.has_supplementals();
        let contaminant = self.config.unmap_contaminants && (self.contaminant)(hits);

        let mut r1_primary: Option<RecordBuf> = None;
        let mut r2_primary: Option<RecordBuf> = None;

        for i in 0..hits.num_hits() {
            let first_aligned = hits.first_of_pair(i);
            let second_aligned = hits.second_of_pair(i);
            let is_primary = first_aligned.is_some_and(|r| !is_secondary_or_supplementary(r))
                || second_aligned.is_some_and(|r| !is_secondary_or_supplementary(r));

            let mut first_to_write = rec.clone();
            let mut second_to_write = second.clone();
            engine.transfer_to_pair(
                &mut first_to_write,
                &mut second_to_write,
                first_aligned,
                second_aligned,
                contaminant,
                clone_needed,
            )?;
            if contaminant {
                stats.contaminants +=
                    u64::from(first_aligned.is_some()) + u64::from(second_aligned.is_some());
            }

            // Stash the primaries for linking supplemental alignments
            if is_primary {
                r1_primary = Some(first_to_write.clone());
                r2_primary = Some(second_to_write.clone());
            }

            // Only the primary slot may emit an unmapped output, so a read
            // name never appears unmapped more than once
            for to_write in [first_to_write, second_to_write] {
                let unmapped_out = to_write.flags().is_unmapped();
                if !unmapped_out || is_primary {
                    self.add_if_not_filtered(sink, header, to_write, progress)?;
                    if unmapped_out {
                        stats.unmapped += 1;
                    } else {
                        stats.aligned += 1;
                    }
                }
            }
        }

        for is_read1 in [true, false] {
            let (supplementals, source, mate_primary) = if is_read1 {
                (hits.first_supplementals(), rec, r2_primary.as_ref())
            } else {
                (hits.second_supplementals(), second, r1_primary.as_ref())
            };

            for supplemental in supplementals {
                let mut out = source.clone();
                engine.transfer_to_fragment(&mut out, supplemental, contaminant, clone_needed)?;
                if contaminant {
                    stats.contaminants += 1;
                }
                if let Some(mate) = mate_primary {
                    set_mate_info_on_supplemental(&mut out, mate, self.config.add_mate_cigar);
                }
                // Supplementary reads unmapped by the transfer are dropped
                if out.flags().is_unmapped() {
                    stats.unmapped += 1;
                } else {
                    self.add_if_not_filtered(sink, header, out, progress)?;
                    stats.aligned += 1;
                }
            }
        }

        Ok(())
    }

    #[expect(clippy::too_many_arguments, reason = "driver fan-out shares loop state")]
    fn process_fragment_hits(
        &self,
        engine: &TransferEngine<'_>,
        hits: &HitsForRead,
        rec: &RecordBuf,
        sink: &mut RecordSink<'_>,
        header: &Header,
        progress: &ProgressTracker,
        stats: &mut MergeStats,
    ) -> Result<()> {
        let clone_needed = hits.num_hits() > 1 || hits.has_supplementals();
        let contaminant = self.config.unmap_contaminants && (self.contaminant)(hits);

        for i in 0..hits.num_hits() {
            let Some(aligned) = hits.fragment(i) else { continue };
            let is_primary = !is_secondary_or_supplementary(aligned);

            let mut to_write = rec.clone();
            engine.transfer_to_fragment(&mut to_write, aligned, contaminant, clone_needed)?;
            if contaminant {
                stats.contaminants += 1;
            }

            let unmapped_out = to_write.flags().is_unmapped();
            if !unmapped_out || is_primary {
                self.add_if_not_filtered(sink, header, to_write, progress)?;
            }
            if unmapped_out {
                stats.unmapped += 1;
            } else {
                stats.aligned += 1;
            }
        }

        for supplemental in hits.first_supplementals() {
            let mut out = rec.clone();
            engine.transfer_to_fragment(&mut out, supplemental, contaminant, clone_needed)?;
            if contaminant {
                stats.contaminants += 1;
            }
            if out.flags().is_unmapped() {
                stats.unmapped += 1;
            } else {
                self.add_if_not_filtered(sink, header, out, progress)?;
                stats.aligned += 1;
            }
        }

        Ok(())
    }

    /// Adds a record unless it is a secondary alignment being suppressed.
    fn add_if_not_filtered(
        &self,
        sink: &mut RecordSink<'_>,
        header: &Header,
        record: RecordBuf,
        progress: &ProgressTracker,
    ) -> Result<()> {
        if self.config.include_secondary || !record.flags().is_secondary() {
            sink.add(header, record)?;
            progress.log_if_needed(1);
        }
        Ok(())
    }

    /// Writes the program id to the record's PG tag.
    ///
    /// Applied to every record, mapped or not, so the whole output chains
    /// to a single program record.
    fn maybe_set_pg(&self, record: &mut RecordBuf) {
        if !self.config.add_program_tag {
            return;
        }
        if let Some(pg) = &self.config.program_record {
            record.data_mut().insert(PROGRAM_GROUP, Value::String(pg.id.clone().into()));
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if let Some(flag) = &self.config.cancel {
            if flag.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(MergeError::Cancelled.into());
            }
        }
        Ok(())
    }

    /// Clones the merged header with the SO line set to the output order.
    fn output_header(&self) -> Result<Header> {
        let mut header = self.header.clone();
        let hd = Map::<noodles::sam::header::record::value::map::Header>::builder()
            .insert(header_tag::SORT_ORDER, BString::from(self.config.sort_order.header_so_tag()))
            .build()?;
        *header.header_mut() = Some(hd);
        Ok(header)
    }
}

fn display_name(rec: &RecordBuf) -> String {
    rec.name().map_or_else(String::new, |n| String::from_utf8_lossy(n.as_ref()).into_owned())
}
