//! Record extraction and mapping derivation.
//!
//! Recovers the companion list from the source literal array, flags
//! specialty collisions in encounter order, and assigns each duplicate a
//! unique replacement from a deterministically shuffled candidate pool.

use std::collections::HashSet;

use csr_core::{CandidatePool, CompanionRecord, MappingEntry, UnassignedDuplicate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use thiserror::Error;

pub const CRATE_NAME: &str = "csr-extract";

/// Declaration marker of the companion literal array in the source file.
pub const DEFAULT_ARRAY_MARKER: &str = "INITIAL_COMPANIONS";

/// Start-of-element marker; one record per line is assumed inside the array.
const ELEMENT_START: &str = "{ id:";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("source array `{marker}` not found in document")]
    ArrayNotFound { marker: String },
    #[error("source array `{marker}` has no closing `];`")]
    ArrayUnterminated { marker: String },
    #[error("record element is missing a `{field}` field: {line}")]
    MissingField { field: &'static str, line: String },
}

/// Recovers the ordered companion list from raw source text.
///
/// The array body is isolated between the `marker ... = [` opening and the
/// `];` closing; each line carrying an element start marker yields one
/// record via three independent field searches. Missing markers or a
/// missing field on an element line are fatal for the run.
pub fn extract_records(
    source: &str,
    marker: &str,
) -> Result<Vec<CompanionRecord>, ExtractError> {
    let marker_at = source
        .find(marker)
        .ok_or_else(|| ExtractError::ArrayNotFound {
            marker: marker.to_string(),
        })?;
    let open = source[marker_at..]
        .find("= [")
        .map(|i| marker_at + i + 3)
        .ok_or_else(|| ExtractError::ArrayNotFound {
            marker: marker.to_string(),
        })?;
    let close = source[open..]
        .find("];")
        .map(|i| open + i)
        .ok_or_else(|| ExtractError::ArrayUnterminated {
            marker: marker.to_string(),
        })?;
    let body = &source[open..close];

    let id_re = Regex::new(r"id:\s*'([^']+)'").expect("static regex");
    let name_re = Regex::new(r"name:\s*'([^']+)'").expect("static regex");
    let specialty_re = Regex::new(r"specialty:\s*'([^']+)'").expect("static regex");

    let mut records = Vec::new();
    for line in body.lines() {
        if !line.contains(ELEMENT_START) {
            continue;
        }
        let id = capture_field(&id_re, line, "id")?;
        let name = capture_field(&name_re, line, "name")?;
        let specialty = capture_field(&specialty_re, line, "specialty")?;
        records.push(CompanionRecord {
            id,
            name,
            specialty,
        });
    }
    Ok(records)
}

fn capture_field(
    re: &Regex,
    line: &str,
    field: &'static str,
) -> Result<String, ExtractError> {
    re.captures(line)
        .map(|c| c[1].to_string())
        .ok_or_else(|| ExtractError::MissingField {
            field,
            line: line.trim().to_string(),
        })
}

/// Flags every record whose specialty was already used by an earlier record.
///
/// Comparison is exact byte equality, deliberately case-sensitive: two
/// specialties differing only in case are distinct, not collisions. The
/// first holder of a specialty is never flagged; output preserves encounter
/// order, which drives allocation order downstream.
pub fn find_duplicates(records: &[CompanionRecord]) -> Vec<CompanionRecord> {
    let mut seen: HashSet<&str> = HashSet::new();
    records
        .iter()
        .filter(|record| !seen.insert(record.specialty.as_str()))
        .cloned()
        .collect()
}

/// Result of assigning pool values to duplicates. Duplicates beyond the
/// pool's size land in `unassigned` rather than being dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub mapping: Vec<MappingEntry>,
    pub unassigned: Vec<UnassignedDuplicate>,
}

/// Assigns each duplicate a replacement from the pool, shuffled with a
/// seeded RNG so the same seed yields the same permutation on every run.
pub fn allocate(
    duplicates: &[CompanionRecord],
    pool: &CandidatePool,
    seed: u64,
) -> Allocation {
    let mut shuffled = pool.specialties.clone();
    let mut rng = StdRng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);

    let mut mapping = Vec::new();
    let mut unassigned = Vec::new();
    for (i, duplicate) in duplicates.iter().enumerate() {
        match shuffled.get(i) {
            Some(new_specialty) => mapping.push(MappingEntry {
                id: duplicate.id.clone(),
                name: duplicate.name.clone(),
                old_specialty: duplicate.specialty.clone(),
                new_specialty: new_specialty.clone(),
            }),
            None => unassigned.push(UnassignedDuplicate::from(duplicate)),
        }
    }
    Allocation {
        mapping,
        unassigned,
    }
}
