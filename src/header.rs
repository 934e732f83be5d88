//! @PG (program) record handling for the merged header.
//!
//! The merge registers the caller-supplied program record in the output
//! header, chained to the previous program via the PP field, and refuses
//! an id that is already in use in the unmapped input.

use anyhow::Result;
use bstr::BString;
use noodles::sam::Header;
use noodles::sam::header::record::value::Map;
use noodles::sam::header::record::value::map::Program;
use noodles::sam::header::record::value::map::program::tag;
use std::collections::HashSet;

use crate::errors::MergeError;

/// A program record to register in the merged header and chain via the
/// `PG` tag on emitted records.
#[derive(Debug, Clone, Default)]
pub struct ProgramRecord {
    /// The @PG id (also the value written to each record's PG tag).
    pub id: String,
    /// Program name (PN).
    pub program_name: Option<String>,
    /// Program version (VN).
    pub version: Option<String>,
    /// Command line (CL).
    pub command_line: Option<String>,
}

impl ProgramRecord {
    /// Creates a program record with just an id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }
}

/// Get the ID of the last program in the @PG chain (for PP chaining).
///
/// Finds the program that is not referenced by any other program's PP tag,
/// i.e., the leaf of the chain.
#[must_use]
pub fn get_last_program_id(header: &Header) -> Option<String> {
    let programs = header.programs();
    let program_map = programs.as_ref();

    if program_map.is_empty() {
        return None;
    }

    let mut referenced: HashSet<&[u8]> = HashSet::new();
    for (_id, pg) in program_map {
        if let Some(pp) = pg.other_fields().get(&tag::PREVIOUS_PROGRAM_ID) {
            referenced.insert(pp.as_ref());
        }
    }

    for (id, _pg) in program_map {
        if !referenced.contains(id.as_slice()) {
            return Some(String::from_utf8_lossy(id).to_string());
        }
    }

    // Fallback for headers with a PP cycle
    program_map.keys().next().map(|id| String::from_utf8_lossy(id).to_string())
}

/// Registers `pg` in the header, chaining PP to the current chain leaf.
///
/// # Errors
///
/// Fails with [`MergeError::ProgramRecordCollision`] when the id is
/// already present.
pub fn chain_program_record(header: &mut Header, pg: &ProgramRecord) -> Result<()> {
    if header.programs().as_ref().contains_key(pg.id.as_bytes()) {
        return Err(MergeError::ProgramRecordCollision { id: pg.id.clone() }.into());
    }

    let previous_program = get_last_program_id(header);

    let mut builder = Map::<Program>::builder();
    if let Some(name) = &pg.program_name {
        builder = builder.insert(tag::NAME, name.as_str());
    }
    if let Some(version) = &pg.version {
        builder = builder.insert(tag::VERSION, version.as_str());
    }
    if let Some(command_line) = &pg.command_line {
        builder = builder.insert(tag::COMMAND_LINE, command_line.as_str());
    }
    if let Some(pp) = &previous_program {
        builder = builder.insert(tag::PREVIOUS_PROGRAM_ID, pp.as_str());
    }
    let record = builder.build()?;

    header.programs_mut().add(BString::from(pg.id.clone()), record)?;
    Ok(())
}
