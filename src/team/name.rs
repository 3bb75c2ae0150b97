//! Team name validation.
//!
//! Team names become directory names under `.convoy/teams`, `.convoy/tasks`
//! and `.convoy/signals`, so they are checked before any filesystem access.

use crate::errors::TeamError;

pub const MAX_TEAM_NAME_LEN: usize = 64;

/// Accept only `[A-Za-z0-9_-]{1,64}` with no `..`.
pub fn validate_team_name(name: &str) -> Result<(), TeamError> {
    let invalid = |reason: &str| TeamError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_TEAM_NAME_LEN {
        return Err(invalid(&format!(
            "name is longer than {} characters",
            MAX_TEAM_NAME_LEN
        )));
    }
    if name.contains("..") {
        return Err(invalid("name contains '..'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(invalid(&format!("character {:?} is not allowed", c)));
    }
    Ok(())
}

/// Team name for a phase of a run: `<pipeline>-<phase>-<run prefix>`,
/// sanitised and truncated to a valid name.
pub fn team_name_for(pipeline: &str, phase: &str, run_id: &str) -> String {
    let short_run: String = run_id.chars().filter(|c| *c != '-').take(8).collect();
    let raw = format!("{}-{}-{}", pipeline, phase, short_run);
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.len() > MAX_TEAM_NAME_LEN {
        // Keep the run suffix, which makes the name unique.
        let suffix_len = short_run.len() + 1;
        let head: String = name.chars().take(MAX_TEAM_NAME_LEN - suffix_len).collect();
        name = format!("{}-{}", head, short_run);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["impl", "build-review-1a2b3c4d", "A_b-9", &"x".repeat(64)] {
            assert!(validate_team_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in [
            "",
            "../etc",
            "a..b",
            "a/b",
            "a b",
            "tëam",
            "name;rm",
            &"x".repeat(65),
        ] {
            assert!(
                matches!(validate_team_name(name), Err(TeamError::InvalidName { .. })),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_team_name_for_is_always_valid() {
        let name = team_name_for("build", "implement", "0b9c8f1e-aaaa-bbbb");
        assert_eq!(name, "build-implement-0b9c8f1e");

        let long = team_name_for(&"p".repeat(50), "phase.with.dots", "12345678-9");
        assert!(validate_team_name(&long).is_ok());
        assert!(long.ends_with("-12345678"));
    }
}
