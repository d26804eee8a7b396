//! Regex-based extraction for the remaining language families named in §4.5:
//! Java/Kotlin/Scala, C/C++, Ruby, PHP, Swift. These share enough surface
//! syntax (brace- or `end`-delimited bodies, a `class`/`struct`/`fun`/`def`
//! keyword family) that one profile-driven extractor covers them, rather than
//! one bespoke file per language.

use super::common::{brace_scan_end_line, is_noise_name, truncate_definitions, RawDefinition};
use crate::models::DefinitionKind;
use once_cell::sync::Lazy;
use regex::Regex;

static JAVA_METHOD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(public|private|protected)?\s*(static\s+)?(final\s+)?[\w<>\[\],\s]+\s+([A-Za-z_][A-Za-z0-9_]*)\s*\([^;]*\)\s*\{?\s*$").unwrap()
});
static JAVA_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(public\s+|private\s+)?(final\s+|abstract\s+)?(class|interface|enum|record)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});
static RUBY_DEF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*def\s+(self\.)?([A-Za-z_][A-Za-z0-9_?!=]*)").unwrap());
static RUBY_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(class|module)\s+([A-Za-z_][A-Za-z0-9_:]*)").unwrap());
static C_FN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\w\*\s]+\s+([A-Za-z_][A-Za-z0-9_]*)\s*\([^;{]*\)\s*\{?\s*$").unwrap()
});
static SWIFT_FUNC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(public\s+|private\s+|internal\s+)?func\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static SWIFT_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(public\s+|private\s+)?(class|struct|protocol|enum)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});
static PHP_FN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(public\s+|private\s+|protected\s+|static\s+)*function\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static PHP_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(abstract\s+)?class\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Extension-driven dispatch: Java/Kotlin/Scala and C/C++ and Swift and PHP
/// all use brace bodies, so they share `brace_scan_end_line`; Ruby uses
/// `end`-delimited bodies, approximated the same way the brace scanner
/// approximates braces but counting `end` keywords as closers.
pub fn extract(content: &str, file_label: &str, extension: &str) -> Vec<RawDefinition> {
    let lines: Vec<&str> = content.lines().collect();
    let mut defs = Vec::new();

    match extension {
        "rb" => {
            for (idx, line) in lines.iter().enumerate() {
                if let Some(caps) = RUBY_DEF_RE.captures(line) {
                    push(&mut defs, &lines, idx, caps.get(2).unwrap().as_str(), DefinitionKind::Method, true, line, ruby_end_scan(&lines, idx));
                } else if let Some(caps) = RUBY_CLASS_RE.captures(line) {
                    push(&mut defs, &lines, idx, caps.get(2).unwrap().as_str(), DefinitionKind::Class, true, line, ruby_end_scan(&lines, idx));
                }
            }
        }
        "php" => {
            for (idx, line) in lines.iter().enumerate() {
                if let Some(caps) = PHP_FN_RE.captures(line) {
                    push(&mut defs, &lines, idx, caps.get(2).unwrap().as_str(), DefinitionKind::Function, true, line, brace_scan_end_line(&lines, idx));
                } else if let Some(caps) = PHP_CLASS_RE.captures(line) {
                    push(&mut defs, &lines, idx, caps.get(2).unwrap().as_str(), DefinitionKind::Class, true, line, brace_scan_end_line(&lines, idx));
                }
            }
        }
        "swift" => {
            for (idx, line) in lines.iter().enumerate() {
                if let Some(caps) = SWIFT_FUNC_RE.captures(line) {
                    push(&mut defs, &lines, idx, caps.get(2).unwrap().as_str(), DefinitionKind::Function, caps.get(1).map(|m| m.as_str() == "public ").unwrap_or(false), line, brace_scan_end_line(&lines, idx));
                } else if let Some(caps) = SWIFT_TYPE_RE.captures(line) {
                    let kind = match caps.get(2).unwrap().as_str() {
                        "struct" => DefinitionKind::Struct,
                        "protocol" => DefinitionKind::Interface,
                        "enum" => DefinitionKind::Enum,
                        _ => DefinitionKind::Class,
                    };
                    push(&mut defs, &lines, idx, caps.get(3).unwrap().as_str(), kind, true, line, brace_scan_end_line(&lines, idx));
                }
            }
        }
        "java" | "kt" | "scala" => {
            for (idx, line) in lines.iter().enumerate() {
                if let Some(caps) = JAVA_TYPE_RE.captures(line) {
                    let kind = match caps.get(3).unwrap().as_str() {
                        "interface" => DefinitionKind::Interface,
                        "enum" => DefinitionKind::Enum,
                        _ => DefinitionKind::Class,
                    };
                    push(&mut defs, &lines, idx, caps.get(4).unwrap().as_str(), kind, caps.get(1).is_some(), line, brace_scan_end_line(&lines, idx));
                } else if let Some(caps) = JAVA_METHOD_RE.captures(line) {
                    let name = caps.get(4).unwrap().as_str();
                    if !is_control_statement(line) {
                        push(&mut defs, &lines, idx, name, DefinitionKind::Method, caps.get(1).map(|m| m.as_str() == "public").unwrap_or(false), line, brace_scan_end_line(&lines, idx));
                    }
                }
            }
        }
        _ => {
            // C/C++ and anything else with a C-like function-definition shape.
            for (idx, line) in lines.iter().enumerate() {
                if let Some(caps) = C_FN_RE.captures(line) {
                    let name = caps.get(1).unwrap().as_str();
                    if !is_control_statement(line) {
                        push(&mut defs, &lines, idx, name, DefinitionKind::Function, true, line, brace_scan_end_line(&lines, idx));
                    }
                }
            }
        }
    }

    truncate_definitions(defs, file_label)
}

fn is_control_statement(line: &str) -> bool {
    let trimmed = line.trim_start();
    ["if ", "for ", "while ", "switch ", "catch ", "return "]
        .iter()
        .any(|kw| trimmed.starts_with(kw))
}

fn ruby_end_scan(lines: &[&str], header_line_idx: usize) -> u32 {
    let mut depth = 0i32;
    let limit = (header_line_idx + super::common::MAX_END_LINE_SCAN).min(lines.len().saturating_sub(1));
    for (offset, line) in lines[header_line_idx..=limit.max(header_line_idx)].iter().enumerate() {
        let t = line.trim();
        if offset > 0 && (t.starts_with("def ") || t.starts_with("class ") || t.starts_with("module ") || t.starts_with("do") || t.starts_with("if ")) {
            depth += 1;
        }
        if t == "end" {
            if depth == 0 {
                return (header_line_idx + offset + 1) as u32;
            }
            depth -= 1;
        }
    }
    (limit + 1) as u32
}

#[allow(clippy::too_many_arguments)]
fn push(
    defs: &mut Vec<RawDefinition>,
    _lines: &[&str],
    idx: usize,
    name: &str,
    kind: DefinitionKind,
    exported: bool,
    header_line: &str,
    end_line: u32,
) {
    if is_noise_name(name) {
        return;
    }
    defs.push(RawDefinition {
        name: name.to_string(),
        kind,
        start_line: (idx + 1) as u32,
        end_line,
        signature: header_line.trim().to_string(),
        exported,
    });
}
