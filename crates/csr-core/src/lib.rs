//! Core domain model for the companion specialty reconciler.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "csr-core";

/// One catalogue entry as recovered from the source literal array.
///
/// Identity is `id`: unique and immutable. `name` and `specialty` are
/// mutable display attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionRecord {
    pub id: String,
    pub name: String,
    pub specialty: String,
}

/// Declared intent to move one record from `old_specialty` to
/// `new_specialty`. `old_specialty` is byte-for-byte the quoted literal
/// currently present in the source text; scoped patching depends on that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub id: String,
    pub name: String,
    pub old_specialty: String,
    pub new_specialty: String,
}

/// Ordered set of distinct replacement specialty values available for
/// remediation, consumed in a deterministically shuffled order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePool {
    pub specialties: Vec<String>,
}

impl CandidatePool {
    pub fn new(specialties: Vec<String>) -> Self {
        Self { specialties }
    }

    pub fn len(&self) -> usize {
        self.specialties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specialties.is_empty()
    }
}

/// A duplicate that could not receive a mapping because the candidate pool
/// ran out. Reported, never dropped silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedDuplicate {
    pub id: String,
    pub name: String,
    pub specialty: String,
}

impl From<&CompanionRecord> for UnassignedDuplicate {
    fn from(record: &CompanionRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            specialty: record.specialty.clone(),
        }
    }
}

/// Outcome of one scoped patch attempt against one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PatchOutcome {
    /// Exactly one value site matched and was replaced.
    Applied,
    /// The old value is gone but the block already carries the new value;
    /// a repeat application, not a failure.
    AlreadyApplied,
    /// Nothing to replace. `id_found = false` means the record block itself
    /// is absent from the document, which violates the mapping invariant.
    Miss { id_found: bool },
    /// More than one value site matched inside the record block. The
    /// document is left untouched; exactly one substitution was intended.
    Ambiguous { matches: usize },
}

impl PatchOutcome {
    /// Number of substitutions actually performed.
    pub fn substitutions(&self) -> usize {
        match self {
            PatchOutcome::Applied => 1,
            _ => 0,
        }
    }

    /// True for outcomes that need attention in the run report.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            PatchOutcome::Miss { .. } | PatchOutcome::Ambiguous { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applied_counts_one_substitution() {
        assert_eq!(PatchOutcome::Applied.substitutions(), 1);
        assert_eq!(PatchOutcome::AlreadyApplied.substitutions(), 0);
        assert_eq!(PatchOutcome::Miss { id_found: true }.substitutions(), 0);
        assert_eq!(PatchOutcome::Ambiguous { matches: 2 }.substitutions(), 0);
    }

    #[test]
    fn misses_and_ambiguities_need_attention() {
        assert!(PatchOutcome::Miss { id_found: false }.needs_attention());
        assert!(PatchOutcome::Ambiguous { matches: 3 }.needs_attention());
        assert!(!PatchOutcome::Applied.needs_attention());
        assert!(!PatchOutcome::AlreadyApplied.needs_attention());
    }
}
