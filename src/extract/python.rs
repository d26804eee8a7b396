//! Regex-based Python definition extraction (indentation-delimited bodies).

use super::common::{indent_scan_end_line, is_noise_name, truncate_definitions, RawDefinition};
use crate::models::DefinitionKind;
use once_cell::sync::Lazy;
use regex::Regex;

static DEF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)(async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap());
static CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)class\s+([A-Za-z_][A-Za-z0-9_]*)\s*[:\(]").unwrap());

pub fn extract(content: &str, file_label: &str) -> Vec<RawDefinition> {
    let lines: Vec<&str> = content.lines().collect();
    let mut defs = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = DEF_RE.captures(line) {
            let name = caps.get(3).unwrap().as_str();
            let indented = !caps.get(1).unwrap().as_str().is_empty();
            push(
                &mut defs,
                &lines,
                idx,
                name,
                if indented { DefinitionKind::Method } else { DefinitionKind::Function },
                !name.starts_with('_'),
                line,
            );
        } else if let Some(caps) = CLASS_RE.captures(line) {
            let name = caps.get(2).unwrap().as_str();
            push(&mut defs, &lines, idx, name, DefinitionKind::Class, !name.starts_with('_'), line);
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
    let end_line = indent_scan_end_line(lines, idx);
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
    fn extracts_function_and_method() {
        let src = "def top_level():\n    return 1\n\n\nclass Greeter:\n    def greet(self):\n        return 'hi'\n";
        let defs = extract(src, "test.py");
        assert!(defs.iter().any(|d| d.name == "top_level" && d.kind == DefinitionKind::Function));
        assert!(defs.iter().any(|d| d.name == "Greeter" && d.kind == DefinitionKind::Class));
        assert!(defs.iter().any(|d| d.name == "greet" && d.kind == DefinitionKind::Method));
    }
}
