//! SAM/BAM record-level utilities.

pub mod alignment_tags;
pub mod builder;
pub mod record_utils;

pub use record_utils::PairOrientation;
