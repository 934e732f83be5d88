//! Reference sequence access for the tag-recomputation pass.
//!
//! The coordinate-sorted post-pass touches contigs in dictionary order, so
//! the walker only ever needs one contig in memory and only ever moves
//! forward. Backwards access is a contract violation and fails with
//! [`MergeError::NonMonotoneReference`].

use anyhow::{Context, Result, bail};
use log::debug;
use noodles::fasta;
use std::io::BufRead;
use std::path::Path;

use crate::errors::MergeError;

/// Provider of reference bases by reference sequence index.
///
/// Access must be monotone: once a sequence index has been served, earlier
/// indices may no longer be requested (the current index may be repeated).
pub trait ReferenceSource {
    /// Returns the bases of the reference sequence at `reference_sequence_id`.
    fn get(&mut self, reference_sequence_id: usize) -> Result<&[u8]>;
}

/// Streaming FASTA walker holding one contig at a time.
///
/// Contigs are matched to indices by file order, which must agree with the
/// output header's sequence dictionary.
pub struct FastaWalker {
    reader: fasta::io::Reader<Box<dyn BufRead>>,
    current_index: Option<usize>,
    current_name: String,
    current_bases: Vec<u8>,
}

impl FastaWalker {
    /// Opens a FASTA file (optionally gzipped) for walking.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = fasta::io::reader::Builder
            .build_from_path(path)
            .with_context(|| format!("Failed to open reference FASTA: {}", path.display()))?;
        Ok(Self {
            reader,
            current_index: None,
            current_name: String::new(),
            current_bases: Vec::new(),
        })
    }
}

impl ReferenceSource for FastaWalker {
    fn get(&mut self, reference_sequence_id: usize) -> Result<&[u8]> {
        if self.current_index == Some(reference_sequence_id) {
            return Ok(&self.current_bases);
        }
        if let Some(current) = self.current_index {
            if reference_sequence_id < current {
                return Err(MergeError::NonMonotoneReference {
                    current,
                    requested: reference_sequence_id,
                }
                .into());
            }
        }

        loop {
            let Some(result) = self.reader.records().next() else {
                bail!(
                    "Reference FASTA ended before sequence index {reference_sequence_id} (last contig: '{}')",
                    self.current_name
                );
            };
            let record = result.context("Failed to read reference FASTA record")?;

            let next_index = self.current_index.map_or(0, |i| i + 1);
            self.current_index = Some(next_index);
            self.current_name = String::from_utf8_lossy(record.name().as_ref()).into_owned();
            self.current_bases = record.sequence().as_ref().to_vec();
            debug!(
                "Reference walker advanced to contig '{}' (index {next_index}, {} bp)",
                self.current_name,
                self.current_bases.len()
            );

            if next_index == reference_sequence_id {
                break;
            }
        }

        Ok(&self.current_bases)
    }
}

/// In-memory reference, useful for tests and small genomes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReference {
    sequences: Vec<Vec<u8>>,
}

impl InMemoryReference {
    /// Creates a reference from contigs in dictionary order.
    #[must_use]
    pub fn new(sequences: Vec<Vec<u8>>) -> Self {
        Self { sequences }
    }
}

impl ReferenceSource for InMemoryReference {
    fn get(&mut self, reference_sequence_id: usize) -> Result<&[u8]> {
        self.sequences
            .get(reference_sequence_id)
            .map(Vec::as_slice)
            .with_context(|| format!("No reference sequence at index {reference_sequence_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fasta_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, ">chr1").unwrap();
        writeln!(file, "ACGTACGT").unwrap();
        writeln!(file, ">chr2").unwrap();
        writeln!(file, "TTTTGGGG").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_walker_serves_contigs_in_order() {
        let file = fasta_file();
        let mut walker = FastaWalker::from_path(file.path()).unwrap();
        assert_eq!(walker.get(0).unwrap(), b"ACGTACGT");
        // Repeating the current index is fine
        assert_eq!(walker.get(0).unwrap(), b"ACGTACGT");
        assert_eq!(walker.get(1).unwrap(), b"TTTTGGGG");
    }

    #[test]
    fn test_walker_can_skip_forward() {
        let file = fasta_file();
        let mut walker = FastaWalker::from_path(file.path()).unwrap();
        assert_eq!(walker.get(1).unwrap(), b"TTTTGGGG");
    }

    #[test]
    fn test_walker_rejects_backwards_access() {
        let file = fasta_file();
        let mut walker = FastaWalker::from_path(file.path()).unwrap();
        walker.get(1).unwrap();
        let err = walker.get(0).unwrap_err();
        assert!(err.to_string().contains("monotonically increasing"));
    }

    #[test]
    fn test_walker_fails_past_last_contig() {
        let file = fasta_file();
        let mut walker = FastaWalker::from_path(file.path()).unwrap();
        assert!(walker.get(5).is_err());
    }

    #[test]
    fn test_in_memory_reference() {
        let mut reference = InMemoryReference::new(vec![b"ACGT".to_vec()]);
        assert_eq!(reference.get(0).unwrap(), b"ACGT");
        assert!(reference.get(1).is_err());
    }
}
