// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The notes document: a Markdown file with a canonical section layout plus
//! a sentinel `# NEW NOTES (unconsolidated)` section for facts awaiting
//! consolidation.

use regex::Regex;

/// Canonical top-level sections, in order.
pub const SECTIONS: [&str; 7] = [
    "SYNOPSIS",
    "USER",
    "LANGUAGES AND TECHNOLOGIES",
    "CONVENTIONS",
    "LAYOUT",
    "APPLICATIONS & COMPONENTS",
    "NOTES",
];

/// Heading of the sentinel section holding unconsolidated facts.
pub const NEW_NOTES_HEADING: &str = "# NEW NOTES (unconsolidated)";

/// An empty notes document with every canonical section present.
pub fn empty_document() -> String {
    let mut doc = String::new();
    for section in SECTIONS {
        doc.push_str("# ");
        doc.push_str(section);
        doc.push_str("\n\n");
    }
    doc
}

/// Matcher for the sentinel heading: case-insensitive, anchored at line
/// start, tolerating trailing whitespace.
fn new_notes_heading_re() -> Regex {
    Regex::new(r"(?im)^#\s*new notes \(unconsolidated\)\s*$").expect("static regex")
}

/// Collapse every `# NEW NOTES (unconsolidated)` section into one
/// deduplicated block at the end of the document.
///
/// Bullets are normalised to `- <text>` (leading list markers and
/// whitespace stripped); first-occurrence order is preserved and later
/// bullets whose lowercased text already appeared are dropped.  A document
/// with no sentinel sections is returned unchanged.
pub fn collapse_unconsolidated_sections(doc: &str) -> String {
    let (body, bullets) = extract_unconsolidated(doc);
    if bullets.is_empty() && new_notes_heading_re().find(doc).is_none() {
        return doc.to_string();
    }
    append_unconsolidated(&body, &bullets)
}

/// Remove every sentinel section, returning the remaining document and the
/// deduplicated bullets in first-occurrence order.
pub fn extract_unconsolidated(doc: &str) -> (String, Vec<String>) {
    let heading = new_notes_heading_re();
    let mut body: Vec<&str> = Vec::new();
    let mut bullets: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut in_block = false;

    for line in doc.lines() {
        if heading.is_match(line) {
            in_block = true;
            continue;
        }
        if in_block && line.starts_with('#') {
            in_block = false;
        }
        if in_block {
            if let Some(bullet) = normalise_bullet(line) {
                let key = bullet.to_lowercase();
                if !seen.contains(&key) {
                    seen.push(key);
                    bullets.push(bullet);
                }
            }
        } else {
            body.push(line);
        }
    }

    // Trim trailing blank lines left behind by removed sections.
    let mut body = body.join("\n");
    while body.ends_with('\n') {
        body.pop();
    }
    (body, bullets)
}

/// Append one sentinel section containing `bullets` to `body`.
pub fn append_unconsolidated(body: &str, bullets: &[String]) -> String {
    let mut out = String::from(body);
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(NEW_NOTES_HEADING);
    out.push('\n');
    for bullet in bullets {
        out.push_str("- ");
        out.push_str(bullet);
        out.push('\n');
    }
    out
}

/// Strip leading list markers and whitespace; `None` for blank lines.
fn normalise_bullet(line: &str) -> Option<String> {
    let text = line
        .trim_start()
        .trim_start_matches(['-', '*', '+'])
        .trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Merge additional facts into the document's single sentinel section.
pub fn merge_new_facts(doc: &str, facts: &[String]) -> String {
    let (body, mut bullets) = extract_unconsolidated(doc);
    let mut seen: Vec<String> = bullets.iter().map(|b| b.to_lowercase()).collect();
    for fact in facts {
        let Some(bullet) = normalise_bullet(fact) else {
            continue;
        };
        let key = bullet.to_lowercase();
        if !seen.contains(&key) {
            seen.push(key);
            bullets.push(bullet);
        }
    }
    if bullets.is_empty() {
        return doc.to_string();
    }
    append_unconsolidated(&body, &bullets)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_lists_all_sections_in_order() {
        let doc = empty_document();
        let mut last = 0;
        for section in SECTIONS {
            let pos = doc.find(&format!("# {section}")).expect("section present");
            assert!(pos >= last, "{section} out of order");
            last = pos;
        }
    }

    #[test]
    fn collapse_merges_three_sections_preserving_first_occurrence_order() {
        let doc = "\
# SYNOPSIS
a research tool

# NEW NOTES (unconsolidated)
- A
- b

# NEW NOTES (unconsolidated)
- a
- C

# NEW NOTES (unconsolidated)
- A
";
        let collapsed = collapse_unconsolidated_sections(doc);
        let count = collapsed.matches("# NEW NOTES (unconsolidated)").count();
        assert_eq!(count, 1);
        let block = collapsed
            .split("# NEW NOTES (unconsolidated)")
            .nth(1)
            .unwrap();
        let bullets: Vec<&str> = block.lines().filter(|l| l.starts_with("- ")).collect();
        assert_eq!(bullets, vec!["- A", "- b", "- C"]);
    }

    #[test]
    fn collapse_dedup_is_case_insensitive() {
        let doc = "# NEW NOTES (unconsolidated)\n- Uses Tokio\n- uses tokio\n- USES TOKIO\n";
        let collapsed = collapse_unconsolidated_sections(doc);
        let bullets: Vec<&str> = collapsed.lines().filter(|l| l.starts_with("- ")).collect();
        assert_eq!(bullets, vec!["- Uses Tokio"]);
    }

    #[test]
    fn collapse_heading_match_is_case_insensitive_and_line_anchored() {
        let doc = "\
# new notes (unconsolidated)
- lower heading

mentions # NEW NOTES (unconsolidated) mid-line are not headings
";
        let collapsed = collapse_unconsolidated_sections(doc);
        assert_eq!(
            collapsed.matches("# NEW NOTES (unconsolidated)").count(),
            // One real section plus the mid-line mention in the body text.
            2
        );
        assert!(collapsed.contains("- lower heading"));
        assert!(collapsed.contains("mentions # NEW NOTES"));
    }

    #[test]
    fn collapse_without_sentinel_sections_is_identity() {
        let doc = "# SYNOPSIS\nstuff\n\n# NOTES\nmore stuff\n";
        assert_eq!(collapse_unconsolidated_sections(doc), doc);
    }

    #[test]
    fn collapse_normalises_mixed_list_markers() {
        let doc = "# NEW NOTES (unconsolidated)\n* star bullet\n  + plus bullet\nbare line\n";
        let collapsed = collapse_unconsolidated_sections(doc);
        let bullets: Vec<&str> = collapsed.lines().filter(|l| l.starts_with("- ")).collect();
        assert_eq!(
            bullets,
            vec!["- star bullet", "- plus bullet", "- bare line"]
        );
    }

    #[test]
    fn collapse_keeps_other_sections_intact() {
        let doc = "\
# SYNOPSIS
a tool

# NEW NOTES (unconsolidated)
- x

# NOTES
long-standing fact
";
        let collapsed = collapse_unconsolidated_sections(doc);
        assert!(collapsed.contains("# SYNOPSIS\na tool"));
        assert!(collapsed.contains("# NOTES\nlong-standing fact"));
        // The sentinel section lands at the end.
        assert!(collapsed.trim_end().ends_with("- x"));
    }

    #[test]
    fn merge_appends_only_novel_facts() {
        let doc = "# NOTES\n\n# NEW NOTES (unconsolidated)\n- known fact\n";
        let merged = merge_new_facts(doc, &["Known Fact".into(), "new fact".into()]);
        let bullets: Vec<&str> = merged.lines().filter(|l| l.starts_with("- ")).collect();
        assert_eq!(bullets, vec!["- known fact", "- new fact"]);
    }

    #[test]
    fn merge_into_document_without_sentinel_creates_one() {
        let doc = "# NOTES\nexisting\n";
        let merged = merge_new_facts(doc, &["a fact".into()]);
        assert_eq!(merged.matches(NEW_NOTES_HEADING).count(), 1);
        assert!(merged.contains("- a fact"));
    }

    #[test]
    fn merge_with_no_facts_is_identity() {
        let doc = "# NOTES\nexisting\n";
        assert_eq!(merge_new_facts(doc, &[]), doc);
    }
}
