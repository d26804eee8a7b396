//! Regex-based TypeScript/JavaScript/JSX definition extraction.

use super::common::{brace_scan_end_line, is_noise_name, truncate_definitions, RawDefinition};
use crate::models::DefinitionKind;
use once_cell::sync::Lazy;
use regex::Regex;

static FN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(export\s+)?(default\s+)?(async\s+)?function\s*\*?\s+([A-Za-z_$][A-Za-z0-9_$]*)")
        .unwrap()
});
static ARROW_CONST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(export\s+)?const\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*(?::[^=]+)?=\s*(?:async\s*)?\(?[^=]*=>").unwrap()
});
static CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(export\s+)?(default\s+)?(abstract\s+)?class\s+([A-Za-z_$][A-Za-z0-9_$]*)").unwrap());
static INTERFACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(export\s+)?interface\s+([A-Za-z_$][A-Za-z0-9_$]*)").unwrap());
static TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(export\s+)?type\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*=").unwrap());
static METHOD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(public\s+|private\s+|protected\s+|static\s+|async\s+)*([A-Za-z_$][A-Za-z0-9_$]*)\s*\([^)]*\)\s*(:\s*[^{]+)?\{").unwrap()
});

pub fn extract(content: &str, file_label: &str) -> Vec<RawDefinition> {
    let lines: Vec<&str> = content.lines().collect();
    let mut defs = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = FN_RE.captures(line) {
            push(&mut defs, &lines, idx, caps.get(4).unwrap().as_str(), DefinitionKind::Function, caps.get(1).is_some(), line);
        } else if let Some(caps) = ARROW_CONST_RE.captures(line) {
            push(&mut defs, &lines, idx, caps.get(2).unwrap().as_str(), DefinitionKind::Function, caps.get(1).is_some(), line);
        } else if let Some(caps) = CLASS_RE.captures(line) {
            push(&mut defs, &lines, idx, caps.get(4).unwrap().as_str(), DefinitionKind::Class, caps.get(1).is_some(), line);
        } else if let Some(caps) = INTERFACE_RE.captures(line) {
            push(&mut defs, &lines, idx, caps.get(2).unwrap().as_str(), DefinitionKind::Interface, caps.get(1).is_some(), line);
        } else if let Some(caps) = TYPE_RE.captures(line) {
            push(&mut defs, &lines, idx, caps.get(2).unwrap().as_str(), DefinitionKind::Type, caps.get(1).is_some(), line);
        } else if let Some(caps) = METHOD_RE.captures(line) {
            // Only count as a method if nested (indented) — otherwise it's
            // already covered by FN_RE/ARROW_CONST_RE at top level.
            if line.starts_with(' ') || line.starts_with('\t') {
                push(&mut defs, &lines, idx, caps.get(2).unwrap().as_str(), DefinitionKind::Method, false, line);
            }
        }
    }

    truncate_definitions(defs, file_label)
}

fn push(
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
    fn extracts_exported_function_and_interface() {
        let src = "export function greet(name: string) {\n  return name;\n}\n\nexport interface User {\n  id: string;\n}\n";
        let defs = extract(src, "test.ts");
        assert!(defs.iter().any(|d| d.name == "greet" && d.exported));
        assert!(defs.iter().any(|d| d.name == "User" && d.kind == DefinitionKind::Interface));
    }
}
