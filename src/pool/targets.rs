//! File-target extraction from free-text task descriptions.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

// A path-like token: has a directory separator or ends in a file extension
// that starts with a letter (so "3.5" is not a file).
static EXTENSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-./]*[\w\-]\.[A-Za-z][A-Za-z0-9]{0,7}$").unwrap());

static PATH_CHARS_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w\-./]+$").unwrap());

const TRIM_CHARS: &[char] = &[
    '`', '"', '\'', '(', ')', '[', ']', '{', '}', '<', '>', ',', ';', ':', '!', '?',
];

/// Paths named in `description`, normalised (no leading `./`, no trailing
/// punctuation). URLs and bare numbers are ignored.
pub fn extract_file_targets(description: &str) -> BTreeSet<String> {
    description
        .split_whitespace()
        .filter(|tok| !tok.contains("://"))
        .filter_map(|tok| {
            let tok = tok.trim_matches(TRIM_CHARS).trim_end_matches('.');
            let tok = tok.trim_start_matches("./");
            if tok.is_empty() || !PATH_CHARS_REGEX.is_match(tok) {
                return None;
            }
            let has_dir = tok.contains('/') && tok.chars().any(|c| c.is_alphanumeric());
            (has_dir || EXTENSION_REGEX.is_match(tok)).then(|| tok.trim_end_matches('/').to_string())
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Declared targets plus extracted ones, deduplicated and sorted.
pub fn all_targets(description: &str, declared: &[String]) -> Vec<String> {
    let mut targets = extract_file_targets(description);
    targets.extend(
        declared
            .iter()
            .map(|t| t.trim().trim_start_matches("./").to_string())
            .filter(|t| !t.is_empty()),
    );
    targets.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(s: &str) -> Vec<String> {
        extract_file_targets(s).into_iter().collect()
    }

    #[test]
    fn test_extracts_paths_and_filenames() {
        assert_eq!(
            extract("Refactor src/auth/login.rs and update Cargo.toml."),
            vec!["Cargo.toml", "src/auth/login.rs"]
        );
    }

    #[test]
    fn test_strips_quotes_and_leading_dot_slash() {
        assert_eq!(extract("Edit `./lib/util.py`, then (docs/)"), vec!["docs", "lib/util.py"]);
    }

    #[test]
    fn test_ignores_numbers_urls_and_prose() {
        assert!(extract("Bump to 3.5 per https://example.com/a.html").is_empty());
        assert!(extract("Improve the error messages").is_empty());
    }

    #[test]
    fn test_all_targets_merges_declared() {
        let targets = all_targets("touch src/a.rs", &["./src/b.rs".to_string(), "src/a.rs".to_string()]);
        assert_eq!(targets, vec!["src/a.rs", "src/b.rs"]);
    }
}
