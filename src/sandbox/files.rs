//! Generated file set: path validation, truncation, language detection.
//!
//! Every path is validated exactly once, with a single normalization
//! rule, before anything is written. Traversal attempts and absolute
//! paths are security rejections: the offending file is dropped with a
//! logged reason and never retried.

use serde::{Deserialize, Serialize};

/// Ceiling on a single generated file's content, in bytes. Oversized
/// content is truncated with an explicit marker rather than rejected, so
/// partial diagnostics remain possible downstream.
pub const MAX_CONTENT_BYTES: usize = 512 * 1024;

/// Marker appended to truncated content.
pub const TRUNCATION_MARKER: &str = "\n/* [taskpilot: content truncated at size ceiling] */\n";

/// What to do with a generated file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for FileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileAction::Create => write!(f, "create"),
            FileAction::Modify => write!(f, "modify"),
            FileAction::Delete => write!(f, "delete"),
        }
    }
}

/// Language detected from a file's extension. Drives base image
/// selection for the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    TypeScript,
    JavaScript,
    Python,
    Rust,
    Go,
    Other,
}

impl Language {
    /// Detects the language from a path's extension.
    pub fn from_path(path: &str) -> Self {
        match path.rsplit('.').next().unwrap_or("") {
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "py" | "pyi" => Language::Python,
            "rs" => Language::Rust,
            "go" => Language::Go,
            _ => Language::Other,
        }
    }

    /// Default base image for validating code in this language.
    pub fn base_image(&self) -> &'static str {
        match self {
            Language::TypeScript | Language::JavaScript => "node:20-bookworm-slim",
            Language::Python => "python:3.11-slim",
            Language::Rust => "rust:1.79-slim",
            Language::Go => "golang:1.22-bookworm",
            Language::Other => "debian:bookworm-slim",
        }
    }
}

/// A single file produced by the generation phase.
///
/// Consumed, never mutated, by the sandbox and the publish phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedFile {
    /// Repository-relative path, validated by `validate_files`.
    pub path: String,
    /// File content. Empty for deletes.
    #[serde(default)]
    pub content: String,
    /// What to do with the file.
    pub action: FileAction,
    /// Detected language.
    pub language: Language,
}

impl GeneratedFile {
    /// Creates a file with the language detected from its path.
    pub fn new(path: impl Into<String>, content: impl Into<String>, action: FileAction) -> Self {
        let path = path.into();
        let language = Language::from_path(&path);
        Self {
            path,
            content: content.into(),
            action,
            language,
        }
    }
}

/// A file dropped during validation, with the reason it was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedFile {
    pub path: String,
    pub reason: String,
}

/// Outcome of validating a generated file set.
#[derive(Debug, Clone, Default)]
pub struct ValidatedFileSet {
    /// Files that passed validation, content already truncated if needed.
    pub accepted: Vec<GeneratedFile>,
    /// Files dropped with their rejection reasons.
    pub rejected: Vec<RejectedFile>,
}

/// Validates a path against the repository root.
///
/// Rejects absolute paths, drive prefixes, `..` segments, and empty
/// paths; strips redundant `./` segments. Returns the normalized path.
pub fn validate_path(path: &str) -> Result<String, String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("empty path".to_string());
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err("absolute path".to_string());
    }
    // Windows drive prefix (C:\...) or other scheme-like prefixes.
    if trimmed.len() >= 2 && trimmed.as_bytes()[1] == b':' {
        return Err("absolute path".to_string());
    }
    if trimmed.contains('\0') {
        return Err("path contains NUL byte".to_string());
    }

    let mut normalized: Vec<&str> = Vec::new();
    for segment in trimmed.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err("path traversal".to_string()),
            other => normalized.push(other),
        }
    }

    if normalized.is_empty() {
        return Err("empty path".to_string());
    }

    Ok(normalized.join("/"))
}

/// Truncates content exceeding the ceiling, appending an explicit marker.
///
/// Cuts on a character boundary at or below the ceiling.
pub fn truncate_content(content: &str, max_bytes: usize) -> (String, bool) {
    if content.len() <= max_bytes {
        return (content.to_string(), false);
    }

    let mut cut = max_bytes;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut truncated = content[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    (truncated, true)
}

/// Validates a generated file set, dropping unsafe entries.
///
/// Each surviving file has its path normalized exactly once and its
/// content capped at [`MAX_CONTENT_BYTES`].
pub fn validate_files(files: Vec<GeneratedFile>) -> ValidatedFileSet {
    let mut result = ValidatedFileSet::default();

    for file in files {
        match validate_path(&file.path) {
            Ok(normalized) => {
                let (content, truncated) = truncate_content(&file.content, MAX_CONTENT_BYTES);
                if truncated {
                    tracing::warn!(path = %normalized, "generated file content truncated at size ceiling");
                }
                result.accepted.push(GeneratedFile {
                    path: normalized,
                    content,
                    action: file.action,
                    language: file.language,
                });
            }
            Err(reason) => {
                tracing::warn!(path = %file.path, %reason, "rejected generated file");
                result.rejected.push(RejectedFile {
                    path: file.path,
                    reason,
                });
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path_accepts_relative() {
        assert_eq!(validate_path("src/a.ts").unwrap(), "src/a.ts");
        assert_eq!(validate_path("./src/./a.ts").unwrap(), "src/a.ts");
        assert_eq!(validate_path("src//nested///file.py").unwrap(), "src/nested/file.py");
    }

    #[test]
    fn test_validate_path_rejects_traversal() {
        assert!(validate_path("../etc/passwd").is_err());
        assert!(validate_path("src/../../etc/passwd").is_err());
        assert!(validate_path("src/..").is_err());
    }

    #[test]
    fn test_validate_path_rejects_absolute() {
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("\\windows\\system32").is_err());
        assert!(validate_path("C:\\repo\\file.ts").is_err());
    }

    #[test]
    fn test_validate_path_rejects_empty_and_nul() {
        assert!(validate_path("").is_err());
        assert!(validate_path("   ").is_err());
        assert!(validate_path("./.").is_err());
        assert!(validate_path("src/a\0.ts").is_err());
    }

    #[test]
    fn test_truncate_content_under_limit() {
        let (content, truncated) = truncate_content("short", 100);
        assert_eq!(content, "short");
        assert!(!truncated);
    }

    #[test]
    fn test_truncate_content_over_limit() {
        let long = "x".repeat(200);
        let (content, truncated) = truncate_content(&long, 100);
        assert!(truncated);
        assert!(content.starts_with(&"x".repeat(100)));
        assert!(content.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        // Multi-byte char straddling the cut point must not split.
        let content = format!("{}é", "a".repeat(99));
        let (truncated, was) = truncate_content(&content, 100);
        assert!(was);
        assert!(truncated.starts_with(&"a".repeat(99)));
    }

    #[test]
    fn test_validate_files_partial_set() {
        // Two valid files and one traversal attempt: exactly two
        // accepted, one rejection logged.
        let files = vec![
            GeneratedFile::new("src/a.ts", "export const a = 1;", FileAction::Create),
            GeneratedFile::new("../etc/passwd", "root::0:0", FileAction::Create),
            GeneratedFile::new("src/b.ts", "export const b = 2;", FileAction::Create),
        ];

        let result = validate_files(files);
        assert_eq!(result.accepted.len(), 2);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].path, "../etc/passwd");
        assert_eq!(result.rejected[0].reason, "path traversal");
    }

    #[test]
    fn test_language_detection() {
        assert_eq!(Language::from_path("src/a.ts"), Language::TypeScript);
        assert_eq!(Language::from_path("src/a.tsx"), Language::TypeScript);
        assert_eq!(Language::from_path("lib/util.js"), Language::JavaScript);
        assert_eq!(Language::from_path("app/main.py"), Language::Python);
        assert_eq!(Language::from_path("src/lib.rs"), Language::Rust);
        assert_eq!(Language::from_path("cmd/main.go"), Language::Go);
        assert_eq!(Language::from_path("README.md"), Language::Other);
    }

    #[test]
    fn test_base_image_mapping() {
        assert_eq!(Language::TypeScript.base_image(), "node:20-bookworm-slim");
        assert_eq!(Language::Python.base_image(), "python:3.11-slim");
    }

    #[test]
    fn test_file_action_display() {
        assert_eq!(FileAction::Create.to_string(), "create");
        assert_eq!(FileAction::Modify.to_string(), "modify");
        assert_eq!(FileAction::Delete.to_string(), "delete");
    }
}
