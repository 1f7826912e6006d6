//! Pure voting decision (§4.2). Nothing in this module touches the forge.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::forge::{Review, ReviewState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    Blocked { description: String },
    Pending { description: String, delay_ms: u64 },
    Ready { description: String },
}

impl Approval {
    /// `None` = blocked, `Some(0)` = ready now, `Some(n)` = wait `n` ms (§3).
    pub fn delay_ms(&self) -> Option<u64> {
        match self {
            Approval::Blocked { .. } => None,
            Approval::Pending { delay_ms, .. } => Some(*delay_ms),
            Approval::Ready { .. } => Some(0),
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Approval::Blocked { .. })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Approval::Ready { .. })
    }

    pub fn description(&self) -> &str {
        match self {
            Approval::Blocked { description } => description,
            Approval::Pending { description, .. } => description,
            Approval::Ready { description } => description,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VotingConfig {
    pub necessary_approvals: usize,
    pub sufficient_approvals: usize,
    pub voting_delay_min: Duration,
    pub voting_delay_max: Duration,
}

/// Deterministic decision algorithm, §4.2 steps 1-9. `reviews` must be in chronological
/// (ascending submit-time) order, as the forge delivers them.
pub fn decide(
    core_developers: &HashSet<String>,
    requested_reviewers: &[String],
    author_login: &str,
    created_at: DateTime<Utc>,
    reviews: &[Review],
    now: DateTime<Utc>,
    config: &VotingConfig,
) -> Approval {
    // Step 1: a requested reviewer who is a core developer blocks outright.
    if requested_reviewers
        .iter()
        .any(|r| core_developers.contains(r))
    {
        return Approval::Blocked {
            description: "waiting for requested reviews".to_string(),
        };
    }

    // Step 2: latest approved/changes-requested vote per core developer, in submission
    // order; `other` states never change the running vote.
    let mut latest: HashMap<&str, ReviewState> = HashMap::new();
    for review in reviews {
        if !core_developers.contains(&review.reviewer_login) {
            continue;
        }
        match review.state {
            ReviewState::Approved | ReviewState::ChangesRequested => {
                latest.insert(review.reviewer_login.as_str(), review.state);
            }
            ReviewState::Other => {}
        }
    }
    if core_developers.contains(author_login) {
        latest
            .entry(author_login)
            .or_insert(ReviewState::Approved);
    }

    // Step 3: any outstanding change request blocks.
    if latest
        .values()
        .any(|s| *s == ReviewState::ChangesRequested)
    {
        return Approval::Blocked {
            description: "blocked (see change requests)".to_string(),
        };
    }

    let approvals = latest
        .values()
        .filter(|s| **s == ReviewState::Approved)
        .count();
    let age = (now - created_at)
        .to_std()
        .unwrap_or_else(|_| Duration::from_secs(0));

    // Step 5: not enough votes at all.
    if approvals < config.necessary_approvals {
        return Approval::Blocked {
            description: "waiting for more votes".to_string(),
        };
    }

    // Step 6: fast track objection window hasn't elapsed yet.
    if age < config.voting_delay_min {
        return Approval::Pending {
            description: "waiting for fast track objections".to_string(),
            delay_ms: (config.voting_delay_min - age).as_millis() as u64,
        };
    }

    // Step 7: fast track.
    if approvals >= config.sufficient_approvals {
        return Approval::Ready {
            description: "approved".to_string(),
        };
    }

    // Step 8: slow burner timeout.
    if age >= config.voting_delay_max {
        return Approval::Ready {
            description: "approved (on slow burner)".to_string(),
        };
    }

    // Step 9: still waiting.
    Approval::Pending {
        description: "waiting for more votes or a slow burner timeout".to_string(),
        delay_ms: (config.voting_delay_max - age).as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VotingConfig {
        VotingConfig {
            necessary_approvals: 1,
            sufficient_approvals: 2,
            voting_delay_min: Duration::from_secs(60 * 60 * 24), // 1 day
            voting_delay_max: Duration::from_secs(60 * 60 * 24 * 10), // 10 days
        }
    }

    fn review(login: &str, state: ReviewState, at: DateTime<Utc>) -> Review {
        Review {
            reviewer_login: login.to_string(),
            submitted_at: at,
            state,
        }
    }

    fn core_devs(logins: &[&str]) -> HashSet<String> {
        logins.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn requested_core_reviewer_blocks() {
        let created_at = Utc::now() - chrono::Duration::days(5);
        let approval = decide(
            &core_devs(&["alice", "bob"]),
            &["bob".to_string()],
            "carol",
            created_at,
            &[],
            Utc::now(),
            &config(),
        );
        assert_eq!(
            approval,
            Approval::Blocked {
                description: "waiting for requested reviews".to_string()
            }
        );
    }

    #[test]
    fn changes_requested_blocks_even_with_enough_approvals() {
        let created_at = Utc::now() - chrono::Duration::days(20);
        let reviews = vec![
            review("alice", ReviewState::Approved, created_at + chrono::Duration::hours(1)),
            review(
                "bob",
                ReviewState::ChangesRequested,
                created_at + chrono::Duration::hours(2),
            ),
        ];
        let approval = decide(
            &core_devs(&["alice", "bob"]),
            &[],
            "carol",
            created_at,
            &reviews,
            Utc::now(),
            &config(),
        );
        assert_eq!(
            approval,
            Approval::Blocked {
                description: "blocked (see change requests)".to_string()
            }
        );
    }

    #[test]
    fn later_review_overrides_earlier_one_from_same_reviewer() {
        let created_at = Utc::now() - chrono::Duration::days(20);
        let reviews = vec![
            review(
                "alice",
                ReviewState::ChangesRequested,
                created_at + chrono::Duration::hours(1),
            ),
            review("alice", ReviewState::Approved, created_at + chrono::Duration::hours(2)),
            review("bob", ReviewState::Approved, created_at + chrono::Duration::hours(3)),
        ];
        let approval = decide(
            &core_devs(&["alice", "bob"]),
            &[],
            "carol",
            created_at,
            &reviews,
            Utc::now(),
            &config(),
        );
        assert!(approval.is_ready());
    }

    #[test]
    fn fast_track_happy_path() {
        let created_at = Utc::now() - chrono::Duration::hours(49);
        let reviews = vec![
            review("alice", ReviewState::Approved, created_at + chrono::Duration::hours(1)),
            review("bob", ReviewState::Approved, created_at + chrono::Duration::hours(2)),
        ];
        let approval = decide(
            &core_devs(&["alice", "bob"]),
            &[],
            "carol",
            created_at,
            &reviews,
            Utc::now(),
            &config(),
        );
        assert_eq!(
            approval,
            Approval::Ready {
                description: "approved".to_string()
            }
        );
    }

    #[test]
    fn slow_burner() {
        let created_at = Utc::now() - chrono::Duration::days(9);
        let reviews = vec![review(
            "alice",
            ReviewState::Approved,
            created_at + chrono::Duration::hours(1),
        )];
        let approval = decide(
            &core_devs(&["alice", "bob"]),
            &[],
            "carol",
            created_at,
            &reviews,
            Utc::now(),
            &config(),
        );
        match approval {
            Approval::Pending { delay_ms, .. } => {
                // ~1 day left until the slow-burner timeout.
                assert!(delay_ms > 0 && delay_ms <= Duration::from_secs(60 * 60 * 24 + 60).as_millis() as u64);
            }
            other => panic!("expected Pending, got {:?}", other),
        }
    }

    #[test]
    fn slow_burner_timeout_reached() {
        let created_at = Utc::now() - chrono::Duration::days(11);
        let reviews = vec![review(
            "alice",
            ReviewState::Approved,
            created_at + chrono::Duration::hours(1),
        )];
        let approval = decide(
            &core_devs(&["alice", "bob"]),
            &[],
            "carol",
            created_at,
            &reviews,
            Utc::now(),
            &config(),
        );
        assert_eq!(
            approval,
            Approval::Ready {
                description: "approved (on slow burner)".to_string()
            }
        );
    }

    #[test]
    fn core_developer_author_counts_as_approval() {
        let created_at = Utc::now() - chrono::Duration::hours(49);
        let reviews = vec![review("bob", ReviewState::Approved, created_at + chrono::Duration::hours(1))];
        let approval = decide(
            &core_devs(&["alice", "bob"]),
            &[],
            "alice",
            created_at,
            &reviews,
            Utc::now(),
            &config(),
        );
        assert!(approval.is_ready());
    }

    #[test]
    fn voting_monotonicity_adding_approval_never_blocks() {
        let created_at = Utc::now() - chrono::Duration::hours(49);
        let before = decide(
            &core_devs(&["alice", "bob", "carol"]),
            &[],
            "dave",
            created_at,
            &[],
            Utc::now(),
            &config(),
        );
        let reviews = vec![review(
            "alice",
            ReviewState::Approved,
            created_at + chrono::Duration::hours(1),
        )];
        let after = decide(
            &core_devs(&["alice", "bob", "carol"]),
            &[],
            "dave",
            created_at,
            &reviews,
            Utc::now(),
            &config(),
        );
        assert!(before.is_blocked() || matches!(before, Approval::Pending { .. }));
        assert!(!after.is_blocked());
    }
}
