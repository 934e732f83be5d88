//! Output sink: a single add/close surface over either a direct writer or
//! an external sorting collection.
//!
//! Query-name and unsorted output go straight to the writer; coordinate
//! output is buffered through a [`SortingCollection`] and drained sorted
//! after the merge loop finishes.

use anyhow::Result;
use noodles::sam::Header;
use noodles::sam::alignment::RecordBuf;
use noodles::sam::alignment::io::Write as AlignmentWrite;

use crate::sort::{SortedDrain, SortingCollection};

/// Destination for finished records.
///
/// The merge core stays decoupled from any concrete codec; anything that
/// can take a header and a record can be an output. [`AlignmentWriter`]
/// adapts the noodles SAM/BAM writers.
pub trait RecordWrite {
    /// Writes one record.
    fn write_record(&mut self, header: &Header, record: &RecordBuf) -> Result<()>;
}

/// Adapter over any noodles alignment writer.
pub struct AlignmentWriter<W>(W);

impl<W> AlignmentWriter<W> {
    /// Wraps a noodles alignment writer.
    pub fn new(inner: W) -> Self {
        Self(inner)
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.0
    }
}

impl<W: AlignmentWrite> RecordWrite for AlignmentWriter<W> {
    fn write_record(&mut self, header: &Header, record: &RecordBuf) -> Result<()> {
        self.0.write_alignment_record(header, record)?;
        Ok(())
    }
}

/// Unified add/close interface over the two output paths.
pub enum RecordSink<'a> {
    /// Records go straight to the writer in arrival order.
    Direct(&'a mut dyn RecordWrite),
    /// Records accumulate in an external sorting collection.
    Sorted(SortingCollection),
}

impl RecordSink<'_> {
    /// Adds a record to the sink.
    pub fn add(&mut self, header: &Header, record: RecordBuf) -> Result<()> {
        match self {
            Self::Direct(writer) => writer.write_record(header, &record),
            Self::Sorted(collection) => collection.add(record),
        }
    }

    /// Closes the sink. The sorting variant transitions to read-only and
    /// yields its records in coordinate order for the post-pass; the
    /// direct variant yields nothing.
    pub fn close(self) -> Result<Option<SortedDrain>> {
        match self {
            Self::Direct(_) => Ok(None),
            Self::Sorted(collection) => Ok(Some(collection.done_adding()?)),
        }
    }
}
