//! Custom error types for the alignment merge.

use thiserror::Error;

/// Result type alias for merge operations
pub type Result<T> = std::result::Result<T, MergeError>;

/// Fatal error conditions detected during the merge.
///
/// Every variant here aborts the merge: resources are released and no
/// partial output is produced. Conditions that are recovered locally
/// (a CIGAR mapping no bases to the reference, an alignment entirely past
/// the end of its reference) are not errors; the affected record is
/// unmapped and the event logged as a warning.
#[derive(Error, Debug)]
pub enum MergeError {
    /// The unmapped input contained a record with the unmapped flag clear
    #[error(
        "Unmapped input contains a mapped read: '{name}'. Revert the file before using it as the unmapped input."
    )]
    UnalignedBamContainsMapped {
        /// The offending read name
        name: String,
    },

    /// Paired records did not arrive as first-of-pair followed by second-of-pair
    #[error("Pairing violation in unmapped input for read '{name}': {reason}")]
    PairingViolation {
        /// The read name at which the violation was detected
        name: String,
        /// Explanation of the violation
        reason: String,
    },

    /// The aligned stream contains a read name not present in the unmapped stream
    #[error("Aligned record iterator ('{aligned}') is behind the unmapped reads ('{unaligned}')")]
    AlignedAhead {
        /// Read name at the head of the aligned stream
        aligned: String,
        /// Read name at the head of the unmapped stream
        unaligned: String,
    },

    /// The unmapped stream ended while aligned records remained
    #[error("Reads remaining on the aligned iterator after the unmapped input was exhausted: '{name}'")]
    UnalignedExhaustedEarly {
        /// The first leftover aligned read name
        name: String,
    },

    /// The program record id is already present in the unmapped input's header
    #[error("Program record id '{id}' already in use in the unmapped input")]
    ProgramRecordCollision {
        /// The colliding @PG id
        id: String,
    },

    /// The aligned stream is not sorted by query name
    #[error("Aligned input is not query-name sorted: saw '{current}' after '{previous}'")]
    OutOfOrderAligned {
        /// The previously observed read name
        previous: String,
        /// The out-of-order read name
        current: String,
    },

    /// A record already carries the tags used to stash hard-clipped bases
    #[error(
        "Record '{name}' already contains tags for restoring hard-clipped bases; clipping it again would permanently erase information"
    )]
    HardClipTagCollision {
        /// The offending read name
        name: String,
    },

    /// A reference sequence named by an alignment is absent from the output dictionary
    #[error("Reference sequence '{ref_name}' not found in header")]
    ReferenceNotFound {
        /// The reference sequence name
        ref_name: String,
    },

    /// The reference walker was asked to move backwards
    #[error(
        "Reference walker only supports monotonically increasing access: asked for sequence index {requested} after {current}"
    )]
    NonMonotoneReference {
        /// The index of the contig currently loaded
        current: usize,
        /// The requested, smaller index
        requested: usize,
    },

    /// The merge was cancelled between records
    #[error("Merge cancelled")]
    Cancelled,
}
