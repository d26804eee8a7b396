//! C5 — Source Scanner & Extractor.
//!
//! The scanner reuses the reference daemon's `ignore::WalkBuilder`-based
//! directory walk (`indexer/watcher.rs`'s `scan_directory`/`build_gitignore`)
//! verbatim in shape, since "respect exclusions" is exactly what that
//! function already does. The extractor trades the reference daemon's
//! tree-sitter grammars for the regex-based rules §4.5 mandates, keeping the
//! module-per-language layout (`rust`, `typescript`, `python`, `go`, and one
//! `generic` profile covering the remaining families).

pub mod common;
pub mod generic;
pub mod go;
pub mod python;
pub mod rust;
pub mod typescript;

pub use common::RawDefinition;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

pub const MAX_WALK_DEPTH: usize = 15;

const IGNORED_DIR_NAMES: &[&str] = &[
    ".git", ".hg", ".svn", "node_modules", "target", "dist", "build", "out",
    ".venv", "venv", "__pycache__", ".cache", "vendor", ".idea", ".vscode",
];

/// Known language extensions (§4.5): TS/JS/JSX, Python, Go, Rust, Java/Kotlin/
/// Scala, C/C++ and headers, Ruby, PHP, Swift, HTML.
pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" => "typescript",
        "py" | "pyi" => "python",
        "go" => "go",
        "rs" => "rust",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "scala" => "scala",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "html" | "htm" => "html",
        _ => return None,
    })
}

fn build_gitignore(root: &Path, extra_ignores: &[String]) -> Gitignore {
    let gitignore_path = root.join(".gitignore");
    let mut builder = GitignoreBuilder::new(root);
    for name in IGNORED_DIR_NAMES {
        let _ = builder.add_line(None, name);
    }
    for pattern in extra_ignores {
        let _ = builder.add_line(None, pattern);
    }
    if gitignore_path.exists() {
        let _ = builder.add(&gitignore_path);
    }
    builder.build().unwrap_or_else(|_| Gitignore::empty())
}

/// First 8 KiB contains a NUL byte -> classified as binary and excluded.
pub fn is_binary(content: &[u8]) -> bool {
    let probe = &content[..content.len().min(8192)];
    probe.contains(&0)
}

fn should_index(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(language_for_extension)
        .is_some()
}

/// Recursive walk of `root`, bounded depth, skipping ignored directories,
/// filtering to known-language extensions.
pub fn scan_directory(root: &Path, extra_ignores: &[String]) -> Vec<PathBuf> {
    let gitignore = build_gitignore(root, extra_ignores);
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .max_depth(Some(MAX_WALK_DEPTH))
        .threads(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));

    let mut files = Vec::new();
    for entry in builder.build().flatten() {
        let path = entry.path().to_path_buf();
        if !path.is_file() || !should_index(&path) {
            continue;
        }
        if gitignore.matched(&path, false).is_ignore() {
            continue;
        }
        files.push(path);
    }
    files
}

/// Extract definitions for `content`, dispatching by the language named for
/// `extension` (as returned by `language_for_extension`).
pub fn extract_definitions(content: &str, language: &str, extension: &str, file_label: &str) -> Vec<RawDefinition> {
    match language {
        "rust" => rust::extract(content, file_label),
        "typescript" => typescript::extract(content, file_label),
        "python" => python::extract(content, file_label),
        "go" => go::extract(content, file_label),
        "html" => Vec::new(),
        _ => generic::extract(content, file_label, extension),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_detection_by_nul_byte() {
        assert!(is_binary(&[0u8, 1, 2, 3]));
        assert!(!is_binary(b"fn main() {}"));
    }

    #[test]
    fn language_map_covers_named_families() {
        assert_eq!(language_for_extension("rs"), Some("rust"));
        assert_eq!(language_for_extension("tsx"), Some("typescript"));
        assert_eq!(language_for_extension("unknownext"), None);
    }
}
