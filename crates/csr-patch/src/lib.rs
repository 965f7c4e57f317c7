//! Scoped patching of the two local document syntaxes.
//!
//! A document is modelled as a sequence of record blocks, one per row or
//! element line. A mapping entry is applied by locating the block owning the
//! entry's id and replacing the old specialty value only inside that block's
//! span, so a specialty string shared by several records is never touched in
//! the wrong one.

use std::ops::Range;

use csr_core::{MappingEntry, PatchOutcome};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "csr-patch";

/// The two textual syntaxes a mapping entry is propagated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSyntax {
    /// Row tuples: `('<id>', ..., '<specialty>', ...)`. The id is the first
    /// quoted literal in the row; field order beyond that is not assumed.
    SeedSql,
    /// Object-literal elements: `{ id: '<id>', ..., specialty: '<v>', ... }`.
    SourceArray,
}

/// One record block located in the document: its id and the byte span of
/// the row or element that holds it.
#[derive(Debug, Clone)]
struct RecordBlock {
    id: String,
    span: Range<usize>,
}

/// In-memory patcher for one document. All entries are applied against the
/// buffer; the caller writes the final text back in a single disk write.
#[derive(Debug)]
pub struct DocumentPatcher {
    syntax: DocumentSyntax,
    text: String,
    id_re: Regex,
    specialty_re: Regex,
}

impl DocumentPatcher {
    pub fn new(syntax: DocumentSyntax, text: String) -> Self {
        Self {
            syntax,
            text,
            id_re: Regex::new(r"id:\s*'([^']+)'").expect("static regex"),
            specialty_re: Regex::new(r"specialty:\s*'([^']+)'").expect("static regex"),
        }
    }

    pub fn syntax(&self) -> DocumentSyntax {
        self.syntax
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Applies one mapping entry, performing at most one substitution.
    ///
    /// Zero matching value sites are disambiguated with a presence check for
    /// the new value: a block that already carries it reports
    /// `AlreadyApplied` instead of a miss. More than one matching site
    /// leaves the document untouched and reports the ambiguity.
    pub fn apply(&mut self, entry: &MappingEntry) -> PatchOutcome {
        let blocks = self.blocks();
        let owned: Vec<&RecordBlock> =
            blocks.iter().filter(|b| b.id == entry.id).collect();
        if owned.is_empty() {
            return PatchOutcome::Miss { id_found: false };
        }

        let mut sites: Vec<Range<usize>> = Vec::new();
        let mut new_value_present = false;
        for block in &owned {
            let block_text = &self.text[block.span.clone()];
            for local in self.candidate_sites(block_text, &entry.old_specialty) {
                sites.push(block.span.start + local.start..block.span.start + local.end);
            }
            if !self
                .candidate_sites(block_text, &entry.new_specialty)
                .is_empty()
            {
                new_value_present = true;
            }
        }

        match sites.len() {
            0 if new_value_present => PatchOutcome::AlreadyApplied,
            0 => PatchOutcome::Miss { id_found: true },
            1 => {
                let site = sites.remove(0);
                self.text.replace_range(site, &entry.new_specialty);
                PatchOutcome::Applied
            }
            matches => PatchOutcome::Ambiguous { matches },
        }
    }

    fn blocks(&self) -> Vec<RecordBlock> {
        match self.syntax {
            DocumentSyntax::SeedSql => seed_sql_blocks(&self.text),
            DocumentSyntax::SourceArray => source_array_blocks(&self.text, &self.id_re),
        }
    }

    /// Value sites inside one block whose content equals `value`, as local
    /// byte ranges excluding the quote delimiters.
    fn candidate_sites(&self, block_text: &str, value: &str) -> Vec<Range<usize>> {
        match self.syntax {
            DocumentSyntax::SeedSql => quoted_literals(block_text)
                .into_iter()
                .skip(1) // first literal is the id anchor
                .filter(|(_, v)| *v == value)
                .map(|(range, _)| range)
                .collect(),
            DocumentSyntax::SourceArray => self
                .specialty_re
                .captures_iter(block_text)
                .filter_map(|c| {
                    let m = c.get(1)?;
                    (m.as_str() == value).then(|| m.range())
                })
                .collect(),
        }
    }
}

/// One block per row: any line containing a `('` tuple opener. The row's id
/// is its first quoted literal.
fn seed_sql_blocks(text: &str) -> Vec<RecordBlock> {
    let mut blocks = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let content_len = line.trim_end_matches('\n').trim_end_matches('\r').len();
        if let Some(open) = line[..content_len].find("('") {
            let slice = &line[open..content_len];
            if let Some((_, id)) = quoted_literals(slice).into_iter().next() {
                blocks.push(RecordBlock {
                    id: id.to_string(),
                    span: offset + open..offset + content_len,
                });
            }
        }
        offset += line.len();
    }
    blocks
}

/// One block per element line: any line containing a `{ id:` element start.
fn source_array_blocks(text: &str, id_re: &Regex) -> Vec<RecordBlock> {
    let mut blocks = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let content_len = line.trim_end_matches('\n').trim_end_matches('\r').len();
        if line[..content_len].contains("{ id:") {
            if let Some(c) = id_re.captures(&line[..content_len]) {
                blocks.push(RecordBlock {
                    id: c[1].to_string(),
                    span: offset..offset + content_len,
                });
            }
        }
        offset += line.len();
    }
    blocks
}

/// Quoted literals in one row, in order, as (inner range, inner text).
/// Handles the doubled-quote escape (`''`) inside a literal.
fn quoted_literals(block: &str) -> Vec<(Range<usize>, &str)> {
    let bytes = block.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\'' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut j = start;
        let mut end = None;
        while j < bytes.len() {
            if bytes[j] == b'\'' {
                if bytes.get(j + 1) == Some(&b'\'') {
                    j += 2;
                    continue;
                }
                end = Some(j);
                break;
            }
            j += 1;
        }
        match end {
            Some(end) => {
                out.push((start..end, &block[start..end]));
                i = end + 1;
            }
            // unterminated literal: stop scanning this row
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, old: &str, new: &str) -> MappingEntry {
        MappingEntry {
            id: id.to_string(),
            name: "Test".to_string(),
            old_specialty: old.to_string(),
            new_specialty: new.to_string(),
        }
    }

    const SEED_SQL: &str = "\
INSERT INTO companions (id, name, gender, specialty, status) VALUES
('c1', 'Ruby', 'Female', 'Grief', 'AVAILABLE'),
('c2', 'Kai', 'Male', 'Anxiety', 'AVAILABLE'),
('c3', 'Mira', 'Female', 'Grief', 'AVAILABLE');
";

    const SOURCE_ARRAY: &str = "\
export const INITIAL_COMPANIONS: Companion[] = [
  { id: 'c1', name: 'Ruby', specialty: 'Grief', rating: 4.9 },
  { id: 'c2', name: 'Kai', specialty: 'Anxiety', rating: 4.7 },
  { id: 'c3', name: 'Mira', specialty: 'Grief', rating: 4.8 },
];
";

    #[test]
    fn patches_only_the_block_owning_the_id_in_seed_sql() {
        let mut patcher =
            DocumentPatcher::new(DocumentSyntax::SeedSql, SEED_SQL.to_string());
        let outcome = patcher.apply(&entry("c3", "Grief", "Trauma"));
        assert_eq!(outcome, PatchOutcome::Applied);

        let text = patcher.into_text();
        assert!(text.contains("('c1', 'Ruby', 'Female', 'Grief', 'AVAILABLE')"));
        assert!(text.contains("('c3', 'Mira', 'Female', 'Trauma', 'AVAILABLE')"));
        assert!(text.contains("'Anxiety'"));
    }

    #[test]
    fn patches_only_the_element_owning_the_id_in_source_array() {
        let mut patcher =
            DocumentPatcher::new(DocumentSyntax::SourceArray, SOURCE_ARRAY.to_string());
        let outcome = patcher.apply(&entry("c3", "Grief", "Trauma"));
        assert_eq!(outcome, PatchOutcome::Applied);

        let text = patcher.into_text();
        assert!(text.contains("{ id: 'c1', name: 'Ruby', specialty: 'Grief'"));
        assert!(text.contains("{ id: 'c3', name: 'Mira', specialty: 'Trauma'"));
    }

    #[test]
    fn second_application_is_a_reported_noop() {
        let mut patcher =
            DocumentPatcher::new(DocumentSyntax::SeedSql, SEED_SQL.to_string());
        let mapping = entry("c3", "Grief", "Trauma");
        assert_eq!(patcher.apply(&mapping), PatchOutcome::Applied);
        assert_eq!(patcher.apply(&mapping), PatchOutcome::AlreadyApplied);
    }

    #[test]
    fn absent_record_block_is_a_loud_miss() {
        let mut patcher =
            DocumentPatcher::new(DocumentSyntax::SeedSql, SEED_SQL.to_string());
        let outcome = patcher.apply(&entry("c99", "Grief", "Trauma"));
        assert_eq!(outcome, PatchOutcome::Miss { id_found: false });
    }

    #[test]
    fn stale_old_value_is_a_miss_with_the_block_found() {
        let mut patcher =
            DocumentPatcher::new(DocumentSyntax::SourceArray, SOURCE_ARRAY.to_string());
        let outcome = patcher.apply(&entry("c3", "Burnout", "Trauma"));
        assert_eq!(outcome, PatchOutcome::Miss { id_found: true });
    }

    #[test]
    fn ambiguous_match_leaves_the_document_untouched() {
        let sql = "('c7', 'Echo', 'Grief', 'Grief', 'AVAILABLE')\n";
        let mut patcher = DocumentPatcher::new(DocumentSyntax::SeedSql, sql.to_string());
        let outcome = patcher.apply(&entry("c7", "Grief", "Trauma"));
        assert_eq!(outcome, PatchOutcome::Ambiguous { matches: 2 });
        assert_eq!(patcher.text(), sql);
    }

    #[test]
    fn non_matching_literals_in_the_row_are_untouched() {
        let sql = "('c4', 'Hope', 'Female', 'Grief', 'AVAILABLE')\n";
        let mut patcher = DocumentPatcher::new(DocumentSyntax::SeedSql, sql.to_string());
        assert_eq!(
            patcher.apply(&entry("c4", "Grief", "Trauma")),
            PatchOutcome::Applied
        );
        assert!(patcher.text().contains("'Hope'"));
        assert!(patcher.text().contains("'Trauma'"));
    }

    #[test]
    fn doubled_quote_escapes_do_not_break_row_scanning() {
        let sql = "('c5', 'O''Brien', 'Male', 'Grief', 'AVAILABLE')\n";
        let mut patcher = DocumentPatcher::new(DocumentSyntax::SeedSql, sql.to_string());
        assert_eq!(
            patcher.apply(&entry("c5", "Grief", "Trauma")),
            PatchOutcome::Applied
        );
        assert!(patcher.text().contains("'O''Brien'"));
        assert!(patcher.text().contains("'Trauma'"));
    }

    #[test]
    fn shared_specialty_text_in_another_record_is_untouched() {
        let mut sql_patcher =
            DocumentPatcher::new(DocumentSyntax::SeedSql, SEED_SQL.to_string());
        let mut src_patcher =
            DocumentPatcher::new(DocumentSyntax::SourceArray, SOURCE_ARRAY.to_string());
        let mapping = entry("c1", "Grief", "Trauma");

        assert_eq!(sql_patcher.apply(&mapping), PatchOutcome::Applied);
        assert_eq!(src_patcher.apply(&mapping), PatchOutcome::Applied);

        assert!(sql_patcher.text().contains("('c3', 'Mira', 'Female', 'Grief'"));
        assert!(src_patcher
            .text()
            .contains("{ id: 'c3', name: 'Mira', specialty: 'Grief'"));
    }

    #[test]
    fn multiple_entries_accumulate_in_one_buffer() {
        let mut patcher =
            DocumentPatcher::new(DocumentSyntax::SourceArray, SOURCE_ARRAY.to_string());
        assert_eq!(
            patcher.apply(&entry("c3", "Grief", "Trauma")),
            PatchOutcome::Applied
        );
        assert_eq!(
            patcher.apply(&entry("c2", "Anxiety", "Burnout")),
            PatchOutcome::Applied
        );
        let text = patcher.into_text();
        assert!(text.contains("specialty: 'Trauma'"));
        assert!(text.contains("specialty: 'Burnout'"));
        assert!(text.contains("{ id: 'c1', name: 'Ruby', specialty: 'Grief'"));
    }
}
