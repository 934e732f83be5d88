//! Bounded-memory external sort for coordinate-ordered output.
//!
//! Records accumulate in an in-memory buffer; when the buffer reaches
//! `max_records_in_ram` it is sorted by coordinate and spilled to a
//! temporary BAM file. On finalize the spills are k-way merged with a
//! binary heap into a single sorted stream. Temporary files live in a
//! [`TempDir`] and are removed when the drain is dropped, on success and
//! failure alike.

use anyhow::{Context, Result};
use log::debug;
use noodles::bam;
use noodles::sam::Header;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::io::Write as AlignmentWrite;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Buffer size for reading spill files during merge.
const MERGE_BUFFER_SIZE: usize = 64 * 1024;

/// Requested order of the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Reference index ascending with unmapped last, then position.
    #[default]
    Coordinate,
    /// The query-name grouping order of the unmapped input.
    QueryName,
    /// Whatever order the merge produces.
    Unsorted,
}

impl SortOrder {
    /// The SAM header SO value for this order.
    #[must_use]
    pub fn header_so_tag(&self) -> &'static str {
        match self {
            Self::Coordinate => "coordinate",
            Self::QueryName => "queryname",
            Self::Unsorted => "unsorted",
        }
    }
}

/// Coordinate sort key: reference index ascending with unmapped records
/// last, ties broken by alignment start, strand, then the raw flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CoordinateKey {
    reference_sequence_id: u32,
    alignment_start: u32,
    reverse: bool,
    flag_bits: u16,
}

impl CoordinateKey {
    /// Extracts the key from a record.
    #[must_use]
    pub fn from_record(record: &RecordBuf) -> Self {
        let reference_sequence_id = if record.flags().is_unmapped() {
            u32::MAX
        } else {
            record.reference_sequence_id().map_or(u32::MAX, |id| id as u32)
        };
        Self {
            reference_sequence_id,
            alignment_start: record.alignment_start().map_or(0, |p| usize::from(p) as u32),
            reverse: record.flags().is_reverse_complemented(),
            flag_bits: record.flags().bits(),
        }
    }
}

/// An external sorting collection of BAM records.
///
/// `add` until done, then [`SortingCollection::done_adding`] transitions
/// to read-only and yields a sorted drain.
pub struct SortingCollection {
    header: Header,
    max_records_in_ram: usize,
    buffer: Vec<(CoordinateKey, RecordBuf)>,
    spill_files: Vec<PathBuf>,
    temp_dir: TempDir,
}

impl SortingCollection {
    /// Creates a collection spilling to a fresh temporary directory when
    /// more than `max_records_in_ram` records accumulate.
    pub fn new(header: Header, max_records_in_ram: usize) -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create spill directory")?;
        Ok(Self {
            header,
            max_records_in_ram: max_records_in_ram.max(1),
            buffer: Vec::new(),
            spill_files: Vec::new(),
            temp_dir,
        })
    }

    /// Adds a record, spilling the buffer to disk when full.
    pub fn add(&mut self, record: RecordBuf) -> Result<()> {
        let key = CoordinateKey::from_record(&record);
        self.buffer.push((key, record));
        if self.buffer.len() >= self.max_records_in_ram {
            self.spill()?;
        }
        Ok(())
    }

    /// Sorts the in-memory buffer and writes it to a spill file.
    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));

        let path = self.temp_dir.path().join(format!("spill_{:04}.bam", self.spill_files.len()));
        let mut writer = bam::io::Writer::new(File::create(&path).context("Failed to create spill file")?);
        writer.write_header(&self.header)?;
        for (_, record) in &self.buffer {
            writer.write_alignment_record(&self.header, record)?;
        }
        writer.try_finish()?;

        debug!("Spilled {} records to {}", self.buffer.len(), path.display());
        self.spill_files.push(path);
        self.buffer.clear();
        Ok(())
    }

    /// Finishes adding and returns the sorted drain.
    ///
    /// When nothing was spilled the buffer is sorted in memory; otherwise
    /// the remainder is spilled and the spill files are merged.
    pub fn done_adding(mut self) -> Result<SortedDrain> {
        if self.spill_files.is_empty() {
            self.buffer.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
            let records: Vec<RecordBuf> = self.buffer.drain(..).map(|(_, r)| r).collect();
            return Ok(SortedDrain::InMemory {
                records: records.into_iter(),
                _temp_dir: self.temp_dir,
            });
        }

        self.spill()?;

        let mut readers = self
            .spill_files
            .iter()
            .map(|path| SpillReader::open(path))
            .collect::<Result<Vec<_>>>()?;

        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (idx, reader) in readers.iter_mut().enumerate() {
            if let Some(record) = reader.next_record(&self.header)? {
                heap.push(Reverse(HeapEntry { key: CoordinateKey::from_record(&record), record, spill_idx: idx }));
            }
        }

        Ok(SortedDrain::Merge {
            header: self.header,
            readers,
            heap,
            _temp_dir: self.temp_dir,
        })
    }
}

/// A sorted stream of records from a finished [`SortingCollection`].
///
/// Holds the spill directory alive; dropping the drain removes the
/// temporary files.
pub enum SortedDrain {
    /// Everything fit in memory.
    InMemory {
        records: std::vec::IntoIter<RecordBuf>,
        _temp_dir: TempDir,
    },
    /// K-way merge over spill files.
    Merge {
        header: Header,
        readers: Vec<SpillReader>,
        heap: BinaryHeap<Reverse<HeapEntry>>,
        _temp_dir: TempDir,
    },
}

impl Iterator for SortedDrain {
    type Item = Result<RecordBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::InMemory { records, .. } => records.next().map(Ok),
            Self::Merge { header, readers, heap, .. } => {
                let Reverse(entry) = heap.pop()?;
                match readers[entry.spill_idx].next_record(header) {
                    Ok(Some(record)) => {
                        heap.push(Reverse(HeapEntry {
                            key: CoordinateKey::from_record(&record),
                            record,
                            spill_idx: entry.spill_idx,
                        }));
                        Some(Ok(entry.record))
                    }
                    Ok(None) => Some(Ok(entry.record)),
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }
}

/// Reader over one spill file.
pub struct SpillReader {
    reader: bam::io::Reader<noodles::bgzf::Reader<BufReader<File>>>,
}

impl SpillReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).context("Failed to open spill file")?;
        let buf_reader = BufReader::with_capacity(MERGE_BUFFER_SIZE, file);
        let mut reader = bam::io::Reader::new(buf_reader);
        reader.read_header()?;
        Ok(Self { reader })
    }

    fn next_record(&mut self, header: &Header) -> Result<Option<RecordBuf>> {
        let mut record = RecordBuf::default();
        match self.reader.read_record_buf(header, &mut record) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(record)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Entry in the merge heap: ordered by key, ties by spill index so the
/// merge is stable across chunks.
pub struct HeapEntry {
    key: CoordinateKey,
    record: RecordBuf,
    spill_idx: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.spill_idx == other.spill_idx
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then(self.spill_idx.cmp(&other.spill_idx))
    }
}
