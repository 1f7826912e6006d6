//! One pass over all open PRs (§4.4): discovers the currently-staged PR, orders PRs,
//! applies the "unchanged since last scan" optimization, dispatches each to
//! [`crate::merge_context`], aggregates a next-wakeup delay.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::bot_identity::BotIdentityCache;
use crate::commit_message;
use crate::config::Config;
use crate::forge::{ForgeClient, PullRequest};
use crate::identity::PrIdentity;
use crate::labels;
use crate::merge_context::{self, StageOutcome};
use crate::Result;

/// One hour, per §8 `isStillUnchanged`: tolerates same-timestamp sub-second edits.
const UNCHANGED_GRACE: chrono::Duration = chrono::Duration::hours(1);

/// Snapshot retained between scans for the change-detection optimization (§3 PrScanResult).
#[derive(Debug, Clone, Default)]
pub struct PrScanResult {
    pub scan_started_at: Option<DateTime<Utc>>,
    pub awake_prs: HashMap<i64, (DateTime<Utc>, bool)>,
    pub min_delay_ms: Option<u64>,
    pub delayed_pr_number: Option<i64>,
}

impl PrScanResult {
    /// §8: true iff the PR was awake last scan, has the same `updatedAt`, has no
    /// `cleared-for-merge` label now, and enough time has passed since `updatedAt`.
    pub fn is_still_unchanged(&self, pr: &PullRequest, now: DateTime<Utc>) -> bool {
        if pr.has_label(labels::CLEARED_FOR_MERGE) {
            return false;
        }
        match self.awake_prs.get(&pr.number) {
            Some((updated_at, _)) => {
                *updated_at == pr.updated_at && now - pr.updated_at > UNCHANGED_GRACE
            }
            None => false,
        }
    }
}

pub struct ScanOutcome {
    pub result: PrScanResult,
    pub staged_this_scan: bool,
    pub errors: Vec<String>,
}

/// Resolves the incoming `prIds` into concrete PR numbers, or `None` if any identifier
/// fails to resolve (§4.4 step 5: failure disables the optimization entirely for this scan).
async fn resolve_updated_numbers<C: ForgeClient + ?Sized>(
    client: &C,
    pr_ids: &[PrIdentity],
    open_prs: &[PullRequest],
    staged_head_sha: Option<&str>,
    staged_pr_number: Option<i64>,
) -> Result<Option<HashSet<i64>>> {
    let mut numbers = HashSet::new();
    for id in pr_ids {
        let resolved = match id {
            PrIdentity::PrNum(n) => Some(*n),
            PrIdentity::Sha { sha, commit_message: msg } => {
                if Some(sha.as_str()) == staged_head_sha {
                    staged_pr_number
                } else {
                    match client.get_commit(sha).await {
                        Ok(commit) => commit_message::parse_pr_number_from_message(&commit.message),
                        Err(_) => msg
                            .as_deref()
                            .and_then(commit_message::parse_pr_number_from_message),
                    }
                }
            }
            PrIdentity::Branch { branch, commit_message: msg } => {
                let found = open_prs.iter().find(|pr| pr.head_branch == *branch);
                match found {
                    Some(pr) => Some(pr.number),
                    None => msg
                        .as_deref()
                        .and_then(commit_message::parse_pr_number_from_message),
                }
            }
        };
        match resolved {
            Some(n) => {
                numbers.insert(n);
            }
            None => return Ok(None),
        }
    }
    Ok(Some(numbers))
}

/// §4.4: a full scan pass. `last_scan` is `None` on the very first scan (forces a full scan,
/// no optimization).
pub async fn execute<C: ForgeClient + ?Sized>(
    client: &C,
    config: &Config,
    bot_identity: &BotIdentityCache,
    last_scan: Option<&PrScanResult>,
    pr_ids: Option<&[PrIdentity]>,
) -> ScanOutcome {
    let now = Utc::now();
    let mut errors = Vec::new();

    let staged_head = match client.get_ref(&format!("heads/{}", config.staging_branch)).await {
        Ok(sha) => Some(sha),
        Err(e) if e.is_not_found() => None,
        Err(e) => {
            errors.push(format!("reading staging branch head: {}", e));
            None
        }
    };
    let staged_pr_number = match &staged_head {
        Some(sha) => match client.get_commit(sha).await {
            Ok(commit) => commit_message::parse_pr_number_from_message(&commit.message),
            Err(e) => {
                errors.push(format!("reading staging branch head commit: {}", e));
                None
            }
        },
        None => None,
    };

    let open_prs = match client.list_open_prs().await {
        Ok(prs) => prs,
        Err(e) => {
            return ScanOutcome {
                result: PrScanResult {
                    scan_started_at: Some(now),
                    ..Default::default()
                },
                staged_this_scan: false,
                errors: vec![format!("listing open PRs: {}", e)],
            };
        }
    };

    let mut ordered: Vec<&PullRequest> = open_prs.iter().collect();
    ordered.sort_by(|a, b| {
        let cleared_a = config.guarded_run && a.has_label(labels::CLEARED_FOR_MERGE);
        let cleared_b = config.guarded_run && b.has_label(labels::CLEARED_FOR_MERGE);
        let current_a = Some(a.number) == staged_pr_number;
        let current_b = Some(b.number) == staged_pr_number;
        cleared_b
            .cmp(&cleared_a)
            .then(current_b.cmp(&current_a))
            .then(a.number.cmp(&b.number))
    });

    let updated_numbers = match pr_ids {
        Some(ids) => resolve_updated_numbers(
            client,
            ids,
            &open_prs,
            staged_head.as_deref(),
            staged_pr_number,
        )
        .await
        .unwrap_or(None),
        None => None,
    };
    let optimization_enabled = last_scan.is_some() && updated_numbers.is_some();

    // Seeded with whichever PR the staging branch already pointed to; `merge_context::process`
    // consults and updates this before ever calling `stage()`, so a second eligible PR examined
    // later in this same loop is turned away instead of racing the first onto the shared
    // staging branch (§4.4 step 7, §8 first testable property).
    let staging_slot = merge_context::StagingSlot::new(staged_pr_number);

    let mut awake_prs = HashMap::new();
    let mut min_delay_ms: Option<u64> = None;
    let mut delayed_pr_number: Option<i64> = None;
    let mut staged_this_scan = false;

    for pr in ordered {
        if pr.has_label(labels::IGNORED_BY_MERGE_BOTS) {
            continue;
        }
        if optimization_enabled {
            let is_updated = updated_numbers
                .as_ref()
                .map(|set| set.contains(&pr.number))
                .unwrap_or(true);
            if !is_updated {
                if let Some(last) = last_scan {
                    if last.is_still_unchanged(pr, now) {
                        continue;
                    }
                }
            }
        }

        match merge_context::process(
            client,
            config,
            bot_identity,
            pr.number,
            &config.core_developers,
            now,
            &staging_slot,
        )
        .await
        {
            Ok(outcome) => {
                if outcome == StageOutcome::Staged {
                    // `staging_slot` is the real guard (checked before `stage()` ever runs);
                    // this is a belt-and-braces check of its own bookkeeping, logged rather
                    // than asserted so a bug here degrades to an error instead of panicking
                    // the scan task and wedging the scheduler (§5, §7).
                    if staged_this_scan {
                        log::error!(
                            "PR #{} staged despite another PR already staged this scan; \
                             staging guard bookkeeping is inconsistent",
                            pr.number
                        );
                    }
                    staged_this_scan = true;
                }
                if let StageOutcome::Delayed(delay) = outcome {
                    awake_prs.insert(pr.number, (pr.updated_at, true));
                    if min_delay_ms.map(|m| delay < m).unwrap_or(true) {
                        min_delay_ms = Some(delay);
                        delayed_pr_number = Some(pr.number);
                    }
                } else {
                    awake_prs.insert(pr.number, (pr.updated_at, false));
                }
            }
            Err(e) => {
                log::error!("processing PR #{}: {}", pr.number, e);
                errors.push(format!("PR #{}: {}", pr.number, e));
            }
        }
    }

    ScanOutcome {
        result: PrScanResult {
            scan_started_at: Some(now),
            awake_prs,
            min_delay_ms,
            delayed_pr_number,
        },
        staged_this_scan,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::PrState;

    fn pr(number: i64, updated_at: DateTime<Utc>) -> PullRequest {
        PullRequest {
            number,
            state: PrState::Open,
            title: "t".to_string(),
            body: String::new(),
            author_login: "a".to_string(),
            base_branch: "master".to_string(),
            head_branch: format!("pr-{}", number),
            head_sha: "sha".to_string(),
            html_url: String::new(),
            mergeable: Some(true),
            labels: vec![],
            requested_reviewers: vec![],
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn unchanged_requires_elapsed_grace_period() {
        let now = Utc::now();
        let updated_at = now - chrono::Duration::minutes(30);
        let mut result = PrScanResult::default();
        result.awake_prs.insert(1, (updated_at, false));
        let p = pr(1, updated_at);
        assert!(!result.is_still_unchanged(&p, now));
    }

    #[test]
    fn unchanged_after_grace_period() {
        let now = Utc::now();
        let updated_at = now - chrono::Duration::hours(2);
        let mut result = PrScanResult::default();
        result.awake_prs.insert(1, (updated_at, false));
        let p = pr(1, updated_at);
        assert!(result.is_still_unchanged(&p, now));
    }

    #[test]
    fn changed_updated_at_is_not_unchanged() {
        let now = Utc::now();
        let old = now - chrono::Duration::hours(2);
        let mut result = PrScanResult::default();
        result.awake_prs.insert(1, (old, false));
        let p = pr(1, now - chrono::Duration::minutes(1));
        assert!(!result.is_still_unchanged(&p, now));
    }

    #[test]
    fn cleared_for_merge_always_considered_changed() {
        let now = Utc::now();
        let updated_at = now - chrono::Duration::hours(2);
        let mut result = PrScanResult::default();
        result.awake_prs.insert(1, (updated_at, false));
        let mut p = pr(1, updated_at);
        p.labels.push(labels::CLEARED_FOR_MERGE.to_string());
        assert!(!result.is_still_unchanged(&p, now));
    }
}
