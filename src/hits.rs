//! Grouping of the aligned stream into per-read hit sets.
//!
//! The aligner sees each read once but may report several alignments for
//! it: a primary, any number of secondaries, and supplementary fragments of
//! chimeric alignments. [`HitGrouper`] turns the query-name sorted aligned
//! stream into a lazy sequence of [`HitsForRead`], one per read name, with
//! supplementary records routed to per-end side lists.
//!
//! The grouper's input contract is that read names are non-decreasing under
//! [`crate::sam::record_utils::compare_read_names`] (plain byte-wise
//! comparison) — the same comparator the merge driver uses for its
//! ahead-of-stream check. Input violating this fails with
//! [`MergeError::OutOfOrderAligned`].

use anyhow::Result;
use bstr::ByteSlice;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::record::Flags;

use crate::errors::MergeError;
use crate::record::is_secondary_or_supplementary;
use crate::sam::record_utils::compare_read_names;

/// All alignments the aligner produced for one read name.
///
/// Hits are held per end in input order: `first` holds fragment or
/// first-of-pair hits, `second` holds second-of-pair hits, and the hit at
/// index `i` of one end pairs with the hit at index `i` of the other.
/// Supplementary records live in separate per-end lists.
#[derive(Debug, Default)]
pub struct HitsForRead {
    name: Vec<u8>,
    first: Vec<RecordBuf>,
    second: Vec<RecordBuf>,
    first_supplementals: Vec<RecordBuf>,
    second_supplementals: Vec<RecordBuf>,
}

impl HitsForRead {
    /// Creates an empty hit set for a read name.
    #[must_use]
    pub fn new(name: Vec<u8>) -> Self {
        Self { name, ..Self::default() }
    }

    /// The read name shared by every record in this set.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Routes a record into the appropriate slot.
    pub fn push(&mut self, record: RecordBuf) {
        let flags = record.flags();
        let is_first = !flags.is_segmented() || flags.is_first_segment();
        match (flags.is_supplementary(), is_first) {
            (true, true) => self.first_supplementals.push(record),
            (true, false) => self.second_supplementals.push(record),
            (false, true) => self.first.push(record),
            (false, false) => self.second.push(record),
        }
    }

    /// Number of hit slots (the longer of the two per-end lists).
    #[must_use]
    pub fn num_hits(&self) -> usize {
        self.first.len().max(self.second.len())
    }

    /// The fragment or first-of-pair hit at slot `i`, if that end has one.
    #[must_use]
    pub fn first_of_pair(&self, i: usize) -> Option<&RecordBuf> {
        self.first.get(i)
    }

    /// The second-of-pair hit at slot `i`, if that end has one.
    #[must_use]
    pub fn second_of_pair(&self, i: usize) -> Option<&RecordBuf> {
        self.second.get(i)
    }

    /// Alias for [`Self::first_of_pair`] on unpaired templates.
    #[must_use]
    pub fn fragment(&self, i: usize) -> Option<&RecordBuf> {
        self.first.get(i)
    }

    /// Supplementary hits for the fragment or first of pair.
    #[must_use]
    pub fn first_supplementals(&self) -> &[RecordBuf] {
        &self.first_supplementals
    }

    /// Supplementary hits for the second of pair.
    #[must_use]
    pub fn second_supplementals(&self) -> &[RecordBuf] {
        &self.second_supplementals
    }

    /// True when either end has supplementary hits.
    #[must_use]
    pub fn has_supplementals(&self) -> bool {
        !self.first_supplementals.is_empty() || !self.second_supplementals.is_empty()
    }

    /// True when no record at all was routed into this set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first.is_empty()
            && self.second.is_empty()
            && self.first_supplementals.is_empty()
            && self.second_supplementals.is_empty()
    }

    /// Mutable access to the per-end hit lists for selection policies.
    pub fn hits_mut(&mut self) -> (&mut Vec<RecordBuf>, &mut Vec<RecordBuf>) {
        (&mut self.first, &mut self.second)
    }

    /// Moves the primary hit (pair) to slot 0, preserving the input order
    /// of the remaining hits.
    ///
    /// Run after the selection policy so that query-name-ordered output
    /// emits the primary alignment first.
    pub fn move_primary_to_front(&mut self) {
        let primary_idx = (0..self.num_hits()).find(|&i| {
            self.first.get(i).is_some_and(|r| !is_secondary_or_supplementary(r))
                || self.second.get(i).is_some_and(|r| !is_secondary_or_supplementary(r))
        });
        if let Some(idx) = primary_idx {
            if idx > 0 {
                if idx < self.first.len() {
                    let hit = self.first.remove(idx);
                    self.first.insert(0, hit);
                }
                if idx < self.second.len() {
                    let hit = self.second.remove(idx);
                    self.second.insert(0, hit);
                }
            }
        }
    }
}

/// Elects one primary hit per end.
///
/// The real election algorithm lives outside this crate; the merge core
/// only requires that after `select_primary` runs, exactly one hit per end
/// has the secondary flag clear.
pub trait PrimarySelection {
    /// Marks exactly one hit per end as primary, setting the secondary
    /// flag on all others.
    fn select_primary(&self, hits: &mut HitsForRead);
}

/// Trivial selection policy: the first hit of each end wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstHitWins;

impl PrimarySelection for FirstHitWins {
    fn select_primary(&self, hits: &mut HitsForRead) {
        let (first, second) = hits.hits_mut();
        for list in [first, second] {
            for (i, record) in list.iter_mut().enumerate() {
                record.flags_mut().set(Flags::SECONDARY, i != 0);
            }
        }
    }
}

/// Lazy sequence of [`HitsForRead`] over a query-name sorted aligned
/// stream.
///
/// Records failing the optional skip predicate are dropped before
/// grouping; a group whose every record is dropped is skipped silently.
/// The selection policy runs once per surviving group, after which the
/// primary hit is rotated to slot 0.
pub struct HitGrouper<I, P> {
    records: I,
    selection: P,
    skip: Option<Box<dyn Fn(&RecordBuf) -> bool>>,
    lookahead: Option<RecordBuf>,
    last_name: Option<Vec<u8>>,
}

impl<I, P> HitGrouper<I, P>
where
    I: Iterator<Item = Result<RecordBuf>>,
    P: PrimarySelection,
{
    /// Creates a grouper over a query-name sorted record stream.
    pub fn new(records: I, selection: P) -> Self {
        Self { records, selection, skip: None, lookahead: None, last_name: None }
    }

    /// Sets a per-record skip predicate; records for which it returns true
    /// never reach a hit set.
    #[must_use]
    pub fn with_skip_predicate(mut self, predicate: impl Fn(&RecordBuf) -> bool + 'static) -> Self {
        self.skip = Some(Box::new(predicate));
        self
    }

    fn next_record(&mut self) -> Option<Result<RecordBuf>> {
        if let Some(record) = self.lookahead.take() {
            return Some(Ok(record));
        }
        self.records.next()
    }

    /// Builds the next group, or `None` at end of stream. `Ok(group)` may
    /// be empty when every member was skipped.
    fn next_group(&mut self) -> Option<Result<HitsForRead>> {
        let first = match self.next_record()? {
            Ok(record) => record,
            Err(e) => return Some(Err(e)),
        };

        let name: Vec<u8> = first.name().map_or_else(Vec::new, |n| n.as_bytes().to_vec());

        if let Some(last) = &self.last_name {
            if compare_read_names(&name, last) == std::cmp::Ordering::Less {
                return Some(Err(MergeError::OutOfOrderAligned {
                    previous: String::from_utf8_lossy(last).into_owned(),
                    current: String::from_utf8_lossy(&name).into_owned(),
                }
                .into()));
            }
        }
        self.last_name = Some(name.clone());

        let mut group = HitsForRead::new(name);
        let mut pending = Some(first);
        loop {
            let record = match pending.take() {
                Some(record) => record,
                None => match self.records.next() {
                    None => break,
                    Some(Err(e)) => return Some(Err(e)),
                    Some(Ok(record)) => {
                        let rec_name: &[u8] = record.name().map_or(&[], AsRef::as_ref);
                        if rec_name != group.name() {
                            self.lookahead = Some(record);
                            break;
                        }
                        record
                    }
                },
            };

            if self.skip.as_ref().is_none_or(|skip| !skip(&record)) {
                group.push(record);
            }
        }

        Some(Ok(group))
    }
}

impl<I, P> Iterator for HitGrouper<I, P>
where
    I: Iterator<Item = Result<RecordBuf>>,
    P: PrimarySelection,
{
    type Item = Result<HitsForRead>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_group()? {
                Err(e) => return Some(Err(e)),
                Ok(group) if group.is_empty() => {} // fully skipped; drop silently
                Ok(mut group) => {
                    self.selection.select_primary(&mut group);
                    group.move_primary_to_front();
                    return Some(Ok(group));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sam::builder::RecordBuilder;

    fn hit(name: &str, start: usize, secondary: bool, supplementary: bool) -> RecordBuf {
        RecordBuilder::new()
            .name(name)
            .sequence("ACGTACGT")
            .reference_sequence_id(0)
            .alignment_start(start)
            .cigar("8M")
            .secondary(secondary)
            .supplementary(supplementary)
            .build()
    }

    fn grouper(records: Vec<RecordBuf>) -> HitGrouper<std::vec::IntoIter<Result<RecordBuf>>, FirstHitWins> {
        let items: Vec<Result<RecordBuf>> = records.into_iter().map(Ok).collect();
        HitGrouper::new(items.into_iter(), FirstHitWins)
    }

    #[test]
    fn test_single_group() {
        let mut g = grouper(vec![hit("q1", 100, false, false)]);
        let hits = g.next().unwrap().unwrap();
        assert_eq!(hits.name(), b"q1");
        assert_eq!(hits.num_hits(), 1);
        assert!(!hits.has_supplementals());
        assert!(g.next().is_none());
    }

    #[test]
    fn test_groups_split_on_name() {
        let mut g = grouper(vec![
            hit("q1", 100, false, false),
            hit("q1", 200, true, false),
            hit("q2", 300, false, false),
        ]);
        let first = g.next().unwrap().unwrap();
        assert_eq!(first.name(), b"q1");
        assert_eq!(first.num_hits(), 2);
        let second = g.next().unwrap().unwrap();
        assert_eq!(second.name(), b"q2");
        assert!(g.next().is_none());
    }

    #[test]
    fn test_supplementals_routed_to_side_list() {
        let mut g = grouper(vec![
            hit("q1", 100, false, false),
            hit("q1", 500, false, true),
        ]);
        let hits = g.next().unwrap().unwrap();
        assert_eq!(hits.num_hits(), 1);
        assert_eq!(hits.first_supplementals().len(), 1);
        assert!(hits.has_supplementals());
    }

    #[test]
    fn test_out_of_order_fails() {
        let mut g = grouper(vec![hit("q2", 100, false, false), hit("q1", 200, false, false)]);
        let _ = g.next().unwrap().unwrap();
        let err = g.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("not query-name sorted"));
    }

    #[test]
    fn test_skip_predicate_drops_group_silently() {
        let items: Vec<Result<RecordBuf>> = vec![
            Ok(hit("q1", 100, false, false)),
            Ok(hit("q2", 200, false, false)),
        ];
        let mut g = HitGrouper::new(items.into_iter(), FirstHitWins)
            .with_skip_predicate(|r| r.alignment_start().map(usize::from) == Some(100));
        let hits = g.next().unwrap().unwrap();
        assert_eq!(hits.name(), b"q2");
        assert!(g.next().is_none());
    }

    #[test]
    fn test_selection_marks_one_primary_per_end() {
        let mut g = grouper(vec![
            hit("q1", 100, true, false),
            hit("q1", 200, true, false),
            hit("q1", 300, true, false),
        ]);
        let hits = g.next().unwrap().unwrap();
        let primaries = (0..hits.num_hits())
            .filter(|&i| !hits.fragment(i).unwrap().flags().is_secondary())
            .count();
        assert_eq!(primaries, 1);
        // FirstHitWins elects slot 0, which stays at the front
        assert!(!hits.fragment(0).unwrap().flags().is_secondary());
    }

    #[test]
    fn test_primary_rotated_to_front() {
        // Mark the second input hit primary with a custom policy
        struct SecondWins;
        impl PrimarySelection for SecondWins {
            fn select_primary(&self, hits: &mut HitsForRead) {
                let (first, _) = hits.hits_mut();
                for (i, record) in first.iter_mut().enumerate() {
                    record.flags_mut().set(Flags::SECONDARY, i != 1);
                }
            }
        }

        let items: Vec<Result<RecordBuf>> = vec![
            Ok(hit("q1", 100, false, false)),
            Ok(hit("q1", 200, false, false)),
        ];
        let mut g = HitGrouper::new(items.into_iter(), SecondWins);
        let hits = g.next().unwrap().unwrap();
        let front = hits.fragment(0).unwrap();
        assert!(!front.flags().is_secondary());
        assert_eq!(front.alignment_start().map(usize::from), Some(200));
    }

    #[test]
    fn test_paired_hits_by_slot() {
        let r1 = RecordBuilder::new()
            .name("q1")
            .sequence("ACGT")
            .reference_sequence_id(0)
            .alignment_start(100)
            .cigar("4M")
            .first_segment(true)
            .build();
        let r2 = RecordBuilder::new()
            .name("q1")
            .sequence("ACGT")
            .reference_sequence_id(0)
            .alignment_start(200)
            .cigar("4M")
            .first_segment(false)
            .build();
        let mut g = grouper(vec![r1, r2]);
        let hits = g.next().unwrap().unwrap();
        assert_eq!(hits.num_hits(), 1);
        assert!(hits.first_of_pair(0).is_some());
        assert!(hits.second_of_pair(0).is_some());
        assert!(hits.first_of_pair(1).is_none());
    }
}
