//! Parsing and validation of staging tags and commit messages (§3 invariants 1-2, §8).

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Primary path: recover the PR number from a trailing `(#N)` on the first line of a
    /// commit message (§9, second Open Question: commit-message parsing is primary).
    static ref TRAILING_PR_NUMBER: Regex =
        Regex::new(r"\(#(?P<number>\d+)\)\s*$").unwrap();

    /// Fallback path: the tag-name convention `tags/M-staged-PR<N>` (also accepts a bare
    /// `M-staged-PR<N>` with no `tags/` prefix, since callers sometimes pass either form).
    static ref STAGING_TAG: Regex =
        Regex::new(r"^(?:tags/)?M-staged-PR(?P<number>\d+)$").unwrap();
}

pub fn staging_tag_name(number: i64) -> String {
    format!("M-staged-PR{}", number)
}

pub fn qualified_staging_tag_name(number: i64) -> String {
    format!("tags/{}", staging_tag_name(number))
}

/// `parseStagingTag(stagingTagName(n)) == n` for all valid `n` (§8 round-trip property).
pub fn parse_staging_tag(name: &str) -> Option<i64> {
    STAGING_TAG
        .captures(name)
        .and_then(|c| c.name("number"))
        .and_then(|m| m.as_str().parse().ok())
}

/// Recover a PR number from the first line of a commit message, e.g.
/// `"Title (#123)\n\nbody"` -> `Some(123)`. Returns `None` when the first line carries no
/// trailing `(#N)` (§8).
pub fn parse_pr_number_from_message(message: &str) -> Option<i64> {
    let first_line = message.lines().next().unwrap_or("");
    TRAILING_PR_NUMBER
        .captures(first_line)
        .and_then(|c| c.name("number"))
        .and_then(|m| m.as_str().parse().ok())
}

/// `"<PR title> (#<number>)\n\n<PR body>"` (§3, StagingCommit).
pub fn format_staging_message(title: &str, number: i64, body: &str) -> String {
    let title = title.trim();
    if body.trim().is_empty() {
        format!("{} (#{})", title, number)
    } else {
        format!("{} (#{})\n\n{}", title, number, body)
    }
}

const MAX_LINE_LEN: usize = 72;

/// Validate that every line of a prospective commit message is at most 72 characters,
/// normalizing CRLF to LF first (§8). `title_line` should already have the trailing
/// `(#N)` appended, per the precondition in §4.3.
pub fn validate_commit_message(title_line: &str, body: &str) -> Result<(), String> {
    validate_line(title_line, 0)?;
    let normalized = body.replace("\r\n", "\n");
    for (idx, line) in normalized.lines().enumerate() {
        validate_line(line, idx + 1)?;
    }
    Ok(())
}

fn validate_line(line: &str, index: usize) -> Result<(), String> {
    let normalized = line.replace("\r\n", "\n");
    let len = normalized.chars().count();
    if len > MAX_LINE_LEN {
        return Err(format!(
            "line {} is {} characters, exceeds the {}-character limit",
            index, len, MAX_LINE_LEN
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_tag_round_trips() {
        for n in [1_i64, 42, 123456] {
            assert_eq!(parse_staging_tag(&staging_tag_name(n)), Some(n));
            assert_eq!(parse_staging_tag(&qualified_staging_tag_name(n)), Some(n));
        }
    }

    #[test]
    fn parses_pr_number_from_first_line() {
        assert_eq!(
            parse_pr_number_from_message("Title (#123)\n\nbody"),
            Some(123)
        );
        assert_eq!(parse_pr_number_from_message("Title\n\nbody"), None);
        assert_eq!(parse_pr_number_from_message(""), None);
    }

    #[test]
    fn line_length_boundary() {
        let exactly_72 = "a".repeat(72);
        let over_72 = "a".repeat(73);
        assert!(validate_commit_message(&exactly_72, "").is_ok());
        assert!(validate_commit_message(&over_72, "").is_err());
        assert!(validate_commit_message("short title", "").is_ok());
    }

    #[test]
    fn empty_body_is_valid() {
        assert!(validate_commit_message("Fix foo (#10)", "").is_ok());
    }

    #[test]
    fn crlf_normalized_before_length_check() {
        let line = "a".repeat(72);
        let body = format!("{}\r\n{}", line, line);
        assert!(validate_commit_message("title (#1)", &body).is_ok());
    }
}
