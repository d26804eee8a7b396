//! Regex-based Rust definition extraction. Structurally named after the
//! reference daemon's `languages/rust.rs`, but regex-driven instead of
//! tree-sitter-driven per §4.5.

use super::common::{brace_scan_end_line, is_noise_name, truncate_definitions, RawDefinition};
use crate::models::DefinitionKind;
use once_cell::sync::Lazy;
use regex::Regex;

static FN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});
static STRUCT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(pub(?:\([^)]*\))?\s+)?struct\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static ENUM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(pub(?:\([^)]*\))?\s+)?enum\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static TRAIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(pub(?:\([^)]*\))?\s+)?trait\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static IMPL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*impl(?:<[^>]*>)?\s+(?:([A-Za-z_][A-Za-z0-9_:]*)\s+for\s+)?([A-Za-z_][A-Za-z0-9_:]*)")
        .unwrap()
});
static MACRO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*macro_rules!\s*([A-Za-z_][A-Za-z0-9_]*)").unwrap());

pub fn extract(content: &str, file_label: &str) -> Vec<RawDefinition> {
    let lines: Vec<&str> = content.lines().collect();
    let mut defs = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = FN_RE.captures(line) {
            push_brace_def(
                &mut defs,
                &lines,
                idx,
                caps.get(2).unwrap().as_str(),
                DefinitionKind::Function,
                caps.get(1).is_some(),
                line,
            );
        } else if let Some(caps) = STRUCT_RE.captures(line) {
            push_brace_def(
                &mut defs,
                &lines,
                idx,
                caps.get(2).unwrap().as_str(),
                DefinitionKind::Struct,
                caps.get(1).is_some(),
                line,
            );
        } else if let Some(caps) = ENUM_RE.captures(line) {
            push_brace_def(
                &mut defs,
                &lines,
                idx,
                caps.get(2).unwrap().as_str(),
                DefinitionKind::Enum,
                caps.get(1).is_some(),
                line,
            );
        } else if let Some(caps) = TRAIT_RE.captures(line) {
            push_brace_def(
                &mut defs,
                &lines,
                idx,
                caps.get(2).unwrap().as_str(),
                DefinitionKind::Trait,
                caps.get(1).is_some(),
                line,
            );
        } else if let Some(caps) = IMPL_RE.captures(line) {
            let name = caps.get(2).unwrap().as_str();
            push_brace_def(&mut defs, &lines, idx, name, DefinitionKind::Impl, false, line);
        } else if let Some(caps) = MACRO_RE.captures(line) {
            push_brace_def(
                &mut defs,
                &lines,
                idx,
                caps.get(1).unwrap().as_str(),
                DefinitionKind::Macro,
                false,
                line,
            );
        }
    }

    truncate_definitions(defs, file_label)
}

fn push_brace_def(
    defs: &mut Vec<RawDefinition>,
    lines: &[&str],
    idx: usize,
    name: &str,
    kind: DefinitionKind,
    exported: bool,
    header_line: &str,
) {
    if is_noise_name(name) {
        return;
    }
    let end_line = brace_scan_end_line(lines, idx);
    defs.push(RawDefinition {
        name: name.to_string(),
        kind,
        start_line: (idx + 1) as u32,
        end_line,
        signature: header_line.trim().to_string(),
        exported,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_pub_fn_and_struct() {
        let src = "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n\nstruct Point {\n    x: i32,\n}\n";
        let defs = extract(src, "test.rs");
        assert!(defs.iter().any(|d| d.name == "add" && d.exported));
        assert!(defs.iter().any(|d| d.name == "Point" && !d.exported));
    }

    #[test]
    fn rejects_keyword_names() {
        assert!(is_noise_name("if"));
        assert!(!is_noise_name("add"));
    }
}
