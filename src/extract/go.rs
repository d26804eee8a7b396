//! Regex-based Go definition extraction, including receiver-qualified methods.

use super::common::{brace_scan_end_line, is_noise_name, truncate_definitions, RawDefinition};
use crate::models::DefinitionKind;
use once_cell::sync::Lazy;
use regex::Regex;

static FUNC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*func\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap());
static METHOD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*func\s*\(\s*\w+\s+\*?([A-Za-z_][A-Za-z0-9_]*)\s*\)\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap()
});
static TYPE_STRUCT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*type\s+([A-Za-z_][A-Za-z0-9_]*)\s+struct\b").unwrap());
static TYPE_INTERFACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*type\s+([A-Za-z_][A-Za-z0-9_]*)\s+interface\b").unwrap());

pub fn extract(content: &str, file_label: &str) -> Vec<RawDefinition> {
    let lines: Vec<&str> = content.lines().collect();
    let mut defs = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = METHOD_RE.captures(line) {
            let name = caps.get(2).unwrap().as_str();
            push(&mut defs, &lines, idx, name, DefinitionKind::Method, is_exported(name), line);
        } else if let Some(caps) = FUNC_RE.captures(line) {
            let name = caps.get(1).unwrap().as_str();
            push(&mut defs, &lines, idx, name, DefinitionKind::Function, is_exported(name), line);
        } else if let Some(caps) = TYPE_STRUCT_RE.captures(line) {
            let name = caps.get(1).unwrap().as_str();
            push(&mut defs, &lines, idx, name, DefinitionKind::Struct, is_exported(name), line);
        } else if let Some(caps) = TYPE_INTERFACE_RE.captures(line) {
            let name = caps.get(1).unwrap().as_str();
            push(&mut defs, &lines, idx, name, DefinitionKind::Interface, is_exported(name), line);
        }
    }

    truncate_definitions(defs, file_label)
}

fn is_exported(name: &str) -> bool {
    name.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
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
    fn extracts_receiver_methods() {
        let src = "func (s *Server) Start() error {\n    return nil\n}\n";
        let defs = extract(src, "test.go");
        assert!(defs.iter().any(|d| d.name == "Start" && d.kind == DefinitionKind::Method && d.exported));
    }
}
