//! Bot-owned labels (§6.3) and the transitions between them (§4.3).
//!
//! Labels are mutually exclusive by category (invariant 5 in the data model): at most one
//! "progress" label is present at a time, and `M-merged` is terminal (invariant 4).

pub const WAITING_STAGING_CHECKS: &str = "M-waiting-staging-checks";
pub const PASSED_STAGING_CHECKS: &str = "M-passed-staging-checks";
pub const FAILED_STAGING_CHECKS: &str = "M-failed-staging-checks";
pub const FAILED_STAGING_OTHER: &str = "M-failed-staging-other";
pub const ABANDONED_STAGING_CHECKS: &str = "M-abandoned-staging-checks";
pub const FAILED_OTHER: &str = "M-failed-other";
pub const FAILED_DESCRIPTION: &str = "M-failed-description";
pub const MERGED: &str = "M-merged";

/// Human-maintained, per Open Question in §9: these two are the only labels a human ever
/// sets; the bot only reads them.
pub const CLEARED_FOR_MERGE: &str = "M-cleared-for-merge";
pub const IGNORED_BY_MERGE_BOTS: &str = "M-ignored-by-merge-bots";

/// All labels the bot itself ever adds or removes, i.e. every "progress" label that a
/// transition might need to clear before applying a new one.
const PROGRESS_LABELS: &[&str] = &[
    WAITING_STAGING_CHECKS,
    PASSED_STAGING_CHECKS,
    FAILED_STAGING_CHECKS,
    FAILED_STAGING_OTHER,
    ABANDONED_STAGING_CHECKS,
    FAILED_OTHER,
    FAILED_DESCRIPTION,
];

/// The reason a merge attempt was abandoned, used to pick which label(s) to apply on
/// cleanup (§4.3 "Cleanup on failure").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    FailedChecks,
    FailedOther,
    FailedDescription,
    /// The staging tag was stale or the PR was closed/diverged: remove progress labels
    /// without recording a failure.
    CleanStaged,
}

/// Labels to add and remove for a given transition. The caller is responsible for diffing
/// this against the PR's current label set so that applying the same transition twice is a
/// no-op (label idempotence, §8).
pub struct LabelTransition {
    pub add: Vec<&'static str>,
    pub remove: Vec<&'static str>,
}

pub fn on_waiting() -> LabelTransition {
    LabelTransition {
        add: vec![WAITING_STAGING_CHECKS],
        remove: PROGRESS_LABELS
            .iter()
            .copied()
            .filter(|l| *l != WAITING_STAGING_CHECKS)
            .collect(),
    }
}

pub fn on_passed() -> LabelTransition {
    LabelTransition {
        add: vec![PASSED_STAGING_CHECKS],
        remove: PROGRESS_LABELS
            .iter()
            .copied()
            .filter(|l| *l != PASSED_STAGING_CHECKS)
            .collect(),
    }
}

pub fn on_merged() -> LabelTransition {
    let mut remove = PROGRESS_LABELS.to_vec();
    remove.push(CLEARED_FOR_MERGE);
    LabelTransition {
        add: vec![MERGED],
        remove,
    }
}

pub fn on_failure(kind: FailureKind) -> LabelTransition {
    match kind {
        FailureKind::FailedChecks => LabelTransition {
            add: vec![FAILED_STAGING_CHECKS],
            remove: PROGRESS_LABELS
                .iter()
                .copied()
                .filter(|l| *l != FAILED_STAGING_CHECKS)
                .collect(),
        },
        FailureKind::FailedOther => LabelTransition {
            add: vec![FAILED_OTHER],
            remove: PROGRESS_LABELS
                .iter()
                .copied()
                .filter(|l| *l != FAILED_OTHER)
                .collect(),
        },
        FailureKind::FailedDescription => LabelTransition {
            add: vec![FAILED_DESCRIPTION],
            remove: PROGRESS_LABELS
                .iter()
                .copied()
                .filter(|l| *l != FAILED_DESCRIPTION)
                .collect(),
        },
        FailureKind::CleanStaged => LabelTransition {
            add: vec![],
            remove: PROGRESS_LABELS.to_vec(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_is_terminal_clears_all_progress_labels() {
        let t = on_merged();
        assert_eq!(t.add, vec![MERGED]);
        assert_eq!(t.remove.len(), PROGRESS_LABELS.len() + 1);
        assert!(t.remove.contains(&CLEARED_FOR_MERGE));
    }

    #[test]
    fn transitions_never_remove_the_label_they_add() {
        for t in [
            on_waiting(),
            on_passed(),
            on_failure(FailureKind::FailedChecks),
            on_failure(FailureKind::FailedOther),
            on_failure(FailureKind::FailedDescription),
        ] {
            for added in &t.add {
                assert!(!t.remove.contains(added));
            }
        }
    }
}
