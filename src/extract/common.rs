//! Shared helpers for regex-based definition extraction (C5): brace/indent
//! end-line approximation, noise filtering, and truncation.

use crate::models::DefinitionKind;

pub const MAX_DEFINITIONS_PER_FILE: usize = 500;
pub const MAX_END_LINE_SCAN: usize = 100;

const CONTROL_FLOW_KEYWORDS: &[&str] = &[
    "if", "else", "for", "while", "switch", "match", "case", "do", "try", "catch", "finally",
    "return", "break", "continue", "yield", "await", "async", "new", "delete", "throw",
];

pub fn is_noise_name(name: &str) -> bool {
    if name.len() < 2 || name.len() > 100 {
        return true;
    }
    CONTROL_FLOW_KEYWORDS.contains(&name)
}

/// A raw extracted definition before ids are assigned; `start_line` is
/// 1-based, the line of the header.
#[derive(Debug, Clone)]
pub struct RawDefinition {
    pub name: String,
    pub kind: DefinitionKind,
    pub start_line: u32,
    pub end_line: u32,
    pub signature: String,
    pub exported: bool,
}

/// Approximate the end line of a brace-delimited body starting at
/// `header_line_idx` (0-based index into `lines`) by counting braces,
/// capped at `MAX_END_LINE_SCAN` lines past the start.
pub fn brace_scan_end_line(lines: &[&str], header_line_idx: usize) -> u32 {
    let mut depth = 0i32;
    let mut seen_open = false;
    let limit = (header_line_idx + MAX_END_LINE_SCAN).min(lines.len().saturating_sub(1));

    for (offset, line) in lines[header_line_idx..=limit.max(header_line_idx)].iter().enumerate() {
        for ch in line.chars() {
            match ch {
                '{' => {
                    depth += 1;
                    seen_open = true;
                }
                '}' => {
                    depth -= 1;
                    if seen_open && depth <= 0 {
                        return (header_line_idx + offset + 1) as u32;
                    }
                }
                _ => {}
            }
        }
    }
    (header_line_idx + 1 + (limit - header_line_idx)) as u32
}

/// Approximate the end line of an indentation-delimited body (Python-style):
/// the next non-blank line with indentation <= the header's indentation ends
/// the block, capped at `MAX_END_LINE_SCAN`.
pub fn indent_scan_end_line(lines: &[&str], header_line_idx: usize) -> u32 {
    let header_indent = lines[header_line_idx]
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .count();
    let limit = (header_line_idx + MAX_END_LINE_SCAN).min(lines.len().saturating_sub(1));

    for (idx, line) in lines.iter().enumerate().skip(header_line_idx + 1) {
        if idx > limit {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let indent = line.chars().take_while(|c| *c == ' ' || *c == '\t').count();
        if indent <= header_indent {
            return idx as u32; // line before this one, 1-based is idx (0-based idx-1 +1)
        }
    }
    (limit + 1) as u32
}

/// Truncate to `MAX_DEFINITIONS_PER_FILE`, logging the drop event (not an error).
pub fn truncate_definitions(mut defs: Vec<RawDefinition>, file_label: &str) -> Vec<RawDefinition> {
    if defs.len() > MAX_DEFINITIONS_PER_FILE {
        tracing::warn!(
            "{}: truncating {} definitions to {}",
            file_label,
            defs.len(),
            MAX_DEFINITIONS_PER_FILE
        );
        defs.truncate(MAX_DEFINITIONS_PER_FILE);
    }
    defs
}
