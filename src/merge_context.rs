//! Per-PR state machine (§4.3): precondition check, staging-commit creation, postcondition
//! re-check, fast-forward, cleanup, label transitions. This is the only module that mutates
//! forge state on behalf of a single PR; [`crate::scan`] drives it one PR at a time.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::approval::{self, Approval, VotingConfig};
use crate::bot_identity::BotIdentityCache;
use crate::commit_message;
use crate::config::Config;
use crate::error::Error;
use crate::forge::{CheckState, CheckStatus, ForgeClient, PrState, PullRequest};
use crate::labels::{self, FailureKind};
use crate::Result;

/// Outcome of examining a single PR in one scan pass (§4.3 state diagram collapsed to a
/// single return value, since the diagram's states map 1:1 onto what happened this pass).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Preconditions failed or voting is Blocked; stays in Brewing.
    NotEligible(String),
    /// Voting is Pending; re-examine after this many milliseconds.
    Delayed(u64),
    /// A staging commit was created and the PR moved into Waiting.
    Staged,
    /// Already staged, required checks have not all reported yet.
    WaitingOnChecks,
    /// Already staged, required checks reported a failure.
    FailedChecks(String),
    /// The staging tag was deleted and the PR returns to Brewing next scan.
    Aborted(String),
    /// The base branch was fast-forwarded and the PR closed.
    Merged,
    /// A mutating step was skipped because of a dry-run mode.
    Skipped(String),
}

fn qualified_head(branch: &str) -> String {
    format!("heads/{}", branch)
}

fn pull_merge_ref(number: i64) -> String {
    format!("pull/{}/merge", number)
}

/// Enforces "at most one PR is staged at any time" (§3 invariant 1, §4.4 step 7, §8 first
/// testable property) *before* a second PR's [`stage`] ever runs, rather than noticing the
/// violation only after the fact. Seeded by [`crate::scan`] with whichever PR number the
/// staging branch already pointed to when the scan began, and updated in place the instant a
/// PR claims it, so a second independently-eligible PR examined later in the *same* scan is
/// turned away too.
pub struct StagingSlot(parking_lot::Mutex<Option<i64>>);

impl StagingSlot {
    pub fn new(initially_staged: Option<i64>) -> Self {
        StagingSlot(parking_lot::Mutex::new(initially_staged))
    }

    fn occupied_by_other(&self, number: i64) -> bool {
        matches!(*self.0.lock(), Some(n) if n != number)
    }

    fn claim(&self, number: i64) {
        *self.0.lock() = Some(number);
    }
}

/// Examine and, if eligible, advance a single PR. `core_developers` and `now` are passed in
/// rather than read from ambient state so the function stays pure apart from its forge calls.
///
/// The PR is re-fetched here with `awaitMergeable = true` rather than trusting whatever
/// [`crate::scan`] saw in its `listOpenPRs` pass (§3: "Freshly read from the forge on every
/// examination — never cached across state transitions"); this is also the only place the
/// `mergeable` flag's own polling-to-resolve behavior (§4.1) gets exercised.
pub async fn process<C: ForgeClient + ?Sized>(
    client: &C,
    config: &Config,
    bot_identity: &BotIdentityCache,
    number: i64,
    core_developers: &HashSet<String>,
    now: DateTime<Utc>,
    staging_slot: &StagingSlot,
) -> Result<StageOutcome> {
    let pr = &client.get_pr(number, true).await?;
    if pr.has_label(labels::MERGED) {
        return Ok(StageOutcome::NotEligible("already merged".to_string()));
    }

    let tag_ref = commit_message::qualified_staging_tag_name(pr.number);
    match client.get_ref(&tag_ref).await {
        Ok(tag_sha) => {
            process_waiting(client, config, pr, core_developers, now, &tag_ref, &tag_sha).await
        }
        Err(e) if e.is_not_found() => {
            process_brewing(
                client,
                config,
                bot_identity,
                pr,
                core_developers,
                now,
                staging_slot,
            )
            .await
        }
        Err(e) => Err(e),
    }
}

/// The reason a pre/postcondition check failed, carrying enough information to pick a
/// failure label when it's being evaluated as a postcondition.
enum CheckFailure {
    NotOpen,
    Wip,
    NotMergeable,
    HeadStatusNotSuccess,
    MessageTooLong(String),
    ApprovalBlocked(String),
}

impl CheckFailure {
    fn description(&self) -> String {
        match self {
            CheckFailure::NotOpen => "PR is no longer open".to_string(),
            CheckFailure::Wip => "title is marked WIP".to_string(),
            CheckFailure::NotMergeable => "PR is not mergeable".to_string(),
            CheckFailure::HeadStatusNotSuccess => {
                "combined status on PR head is not success".to_string()
            }
            CheckFailure::MessageTooLong(reason) => reason.clone(),
            CheckFailure::ApprovalBlocked(reason) => reason.clone(),
        }
    }

    /// Which labeler a postcondition failure of this kind maps to (§4.3 "Cleanup on
    /// failure"). Description-shaped problems get `failed-description`; anything that
    /// means the world moved on while staged is a clean, silent abort instead.
    fn failure_kind(&self) -> FailureKind {
        match self {
            CheckFailure::Wip | CheckFailure::MessageTooLong(_) => FailureKind::FailedDescription,
            CheckFailure::HeadStatusNotSuccess => FailureKind::FailedOther,
            CheckFailure::NotOpen | CheckFailure::NotMergeable | CheckFailure::ApprovalBlocked(_) => {
                FailureKind::CleanStaged
            }
        }
    }
}

/// Shared precondition/postcondition checks (§4.3). `with_message_check` is false for
/// postconditions, which skip commit-message validation (it cannot regress once staged).
async fn check_conditions<C: ForgeClient + ?Sized>(
    client: &C,
    pr: &PullRequest,
    core_developers: &HashSet<String>,
    now: DateTime<Utc>,
    config: &Config,
    with_message_check: bool,
) -> Result<std::result::Result<(), CheckFailure>> {
    if pr.state != PrState::Open {
        return Ok(Err(CheckFailure::NotOpen));
    }
    if pr.title.starts_with("WIP:") {
        return Ok(Err(CheckFailure::Wip));
    }
    if pr.mergeable != Some(true) {
        return Ok(Err(CheckFailure::NotMergeable));
    }
    let head_status = client.get_combined_status(&pr.head_sha).await?;
    if head_status.state != CheckState::Success {
        return Ok(Err(CheckFailure::HeadStatusNotSuccess));
    }
    if with_message_check {
        let title_line = format!("{} (#{})", pr.title.trim(), pr.number);
        if let Err(reason) = commit_message::validate_commit_message(&title_line, &pr.body) {
            return Ok(Err(CheckFailure::MessageTooLong(reason)));
        }
    }

    let reviews = client.get_reviews(pr.number).await?;
    let voting = VotingConfig {
        necessary_approvals: config.necessary_approvals,
        sufficient_approvals: config.sufficient_approvals,
        voting_delay_min: config.voting_delay_min,
        voting_delay_max: config.voting_delay_max,
    };
    let approval = approval::decide(
        core_developers,
        &pr.requested_reviewers,
        &pr.author_login,
        pr.created_at,
        &reviews,
        now,
        &voting,
    );
    if approval.is_blocked() {
        return Ok(Err(CheckFailure::ApprovalBlocked(
            approval.description().to_string(),
        )));
    }

    Ok(Ok(()))
}

async fn compute_approval<C: ForgeClient + ?Sized>(
    client: &C,
    pr: &PullRequest,
    core_developers: &HashSet<String>,
    now: DateTime<Utc>,
    config: &Config,
) -> Result<Approval> {
    let reviews = client.get_reviews(pr.number).await?;
    let voting = VotingConfig {
        necessary_approvals: config.necessary_approvals,
        sufficient_approvals: config.sufficient_approvals,
        voting_delay_min: config.voting_delay_min,
        voting_delay_max: config.voting_delay_max,
    };
    Ok(approval::decide(
        core_developers,
        &pr.requested_reviewers,
        &pr.author_login,
        pr.created_at,
        &reviews,
        now,
        &voting,
    ))
}

async fn process_brewing<C: ForgeClient + ?Sized>(
    client: &C,
    config: &Config,
    bot_identity: &BotIdentityCache,
    pr: &PullRequest,
    core_developers: &HashSet<String>,
    now: DateTime<Utc>,
    staging_slot: &StagingSlot,
) -> Result<StageOutcome> {
    match check_conditions(client, pr, core_developers, now, config, true).await? {
        Err(failure) => return Ok(StageOutcome::NotEligible(failure.description())),
        Ok(()) => {}
    }

    let approval = compute_approval(client, pr, core_developers, now, config).await?;
    publish_approval_status(client, config, &pr.head_sha, &approval).await?;

    let delay = match approval.delay_ms() {
        None => return Ok(StageOutcome::NotEligible(approval.description().to_string())),
        Some(d) => d,
    };
    if delay > 0 {
        return Ok(StageOutcome::Delayed(delay));
    }

    // §3 invariant 1 / §4.4 step 7: a different PR already owns the staging branch. Stay in
    // Brewing rather than stage over it; this PR gets re-examined next scan.
    if staging_slot.occupied_by_other(pr.number) {
        return Ok(StageOutcome::NotEligible(
            "staging branch is occupied by another PR".to_string(),
        ));
    }

    if config.dry_run {
        log::info!("dry run: would start staging PR #{}", pr.number);
        return Ok(StageOutcome::Skipped("dry run: staging skipped".to_string()));
    }

    let outcome = stage(client, config, bot_identity, pr, &approval).await?;
    if outcome == StageOutcome::Staged {
        staging_slot.claim(pr.number);
    }
    Ok(outcome)
}

/// §4.2: "it creates/updates a status with context 'PR approval' on both the PR head commit
/// and (once it exists) the staging commit; it avoids duplicate writes when the existing
/// status matches." A no-op when `approval_url` isn't configured.
async fn publish_approval_status<C: ForgeClient + ?Sized>(
    client: &C,
    config: &Config,
    sha: &str,
    approval: &Approval,
) -> Result<()> {
    let target_url = match &config.approval_url {
        Some(url) => url,
        None => return Ok(()),
    };
    let state = if approval.is_ready() {
        CheckState::Success
    } else {
        CheckState::Pending
    };
    let existing = client.get_combined_status(sha).await?;
    let already_published = existing.statuses.iter().any(|s| {
        s.context == "PR approval"
            && s.state == state
            && s.description.as_deref() == Some(approval.description())
    });
    if already_published {
        return Ok(());
    }
    client
        .create_status(
            sha,
            state,
            Some(target_url.as_str()),
            Some(approval.description()),
            "PR approval",
        )
        .await
}

async fn stage<C: ForgeClient + ?Sized>(
    client: &C,
    config: &Config,
    bot_identity: &BotIdentityCache,
    pr: &PullRequest,
    approval: &Approval,
) -> Result<StageOutcome> {
    let base_sha = client.get_ref(&qualified_head(&pr.base_branch)).await?;
    let merge_sha = client.get_ref(&pull_merge_ref(pr.number)).await?;
    let merge_commit = client.get_commit(&merge_sha).await?;
    let committer = bot_identity.get(client, &config.github_login).await?;

    let message = commit_message::format_staging_message(&pr.title, pr.number, &pr.body);
    let staging_sha = client
        .create_commit(
            &merge_commit.tree,
            &message,
            &[base_sha],
            &merge_commit.author,
            &committer,
        )
        .await?;

    let tag_ref = commit_message::qualified_staging_tag_name(pr.number);
    client.create_ref(&tag_ref, &staging_sha).await?;
    client
        .update_ref(&qualified_head(&config.staging_branch), &staging_sha, true)
        .await?;

    publish_approval_status(client, config, &staging_sha, approval).await?;

    apply_labels(client, config, pr.number, &pr.labels, &labels::on_waiting()).await?;

    log::info!("staged PR #{} as {}", pr.number, staging_sha);
    Ok(StageOutcome::Staged)
}

async fn process_waiting<C: ForgeClient + ?Sized>(
    client: &C,
    config: &Config,
    pr: &PullRequest,
    core_developers: &HashSet<String>,
    now: DateTime<Utc>,
    tag_ref: &str,
    tag_sha: &str,
) -> Result<StageOutcome> {
    if pr.state != PrState::Open {
        return abort(client, config, pr, tag_ref, FailureKind::CleanStaged, "PR closed").await;
    }

    let merge_sha = client.get_ref(&pull_merge_ref(pr.number)).await?;
    let tag_commit = client.get_commit(tag_sha).await?;
    let merge_commit = client.get_commit(&merge_sha).await?;
    if tag_commit.tree != merge_commit.tree {
        return abort(
            client,
            config,
            pr,
            tag_ref,
            FailureKind::CleanStaged,
            "staging tag is stale",
        )
        .await;
    }

    let required_contexts = client
        .get_required_status_contexts(&pr.base_branch)
        .await?;
    let k = config.staging_checks.unwrap_or(required_contexts.len());
    let combined = client.get_combined_status(tag_sha).await?;
    let check_state = required_check_state(&combined.statuses, &required_contexts, k);

    match check_state {
        CheckState::Pending => Ok(StageOutcome::WaitingOnChecks),
        CheckState::Failure | CheckState::Error => {
            if pr.has_label(labels::FAILED_STAGING_CHECKS) {
                // Second consecutive scan seeing the same failure: the first scan already
                // told the user via the label, so this time clean up and let it restart.
                abort(
                    client,
                    config,
                    pr,
                    tag_ref,
                    FailureKind::CleanStaged,
                    "required checks still failing; restarting",
                )
                .await
            } else {
                apply_labels(
                    client,
                    config,
                    pr.number,
                    &pr.labels,
                    &labels::on_failure(FailureKind::FailedChecks),
                )
                .await?;
                Ok(StageOutcome::FailedChecks(
                    "required checks failed".to_string(),
                ))
            }
        }
        CheckState::Success => {
            apply_labels(client, config, pr.number, &pr.labels, &labels::on_passed()).await?;
            advance(client, config, pr, core_developers, now, tag_ref, tag_sha).await
        }
    }
}

async fn advance<C: ForgeClient + ?Sized>(
    client: &C,
    config: &Config,
    pr: &PullRequest,
    core_developers: &HashSet<String>,
    now: DateTime<Utc>,
    tag_ref: &str,
    tag_sha: &str,
) -> Result<StageOutcome> {
    let approval = compute_approval(client, pr, core_developers, now, config).await?;
    publish_approval_status(client, config, tag_sha, &approval).await?;

    match check_conditions(client, pr, core_developers, now, config, false).await? {
        Err(failure) => {
            let kind = failure.failure_kind();
            return abort(client, config, pr, tag_ref, kind, &failure.description()).await;
        }
        Ok(()) => {}
    }

    if !advancing_allowed(config, pr) {
        log::info!(
            "advancing PR #{} skipped: run mode forbids base-branch mutation",
            pr.number
        );
        return Ok(StageOutcome::Skipped(
            "advancing blocked by run mode".to_string(),
        ));
    }

    let base_ref = qualified_head(&pr.base_branch);
    match client.update_ref(&base_ref, tag_sha, false).await {
        Ok(()) => {
            apply_labels(client, config, pr.number, &pr.labels, &labels::on_merged()).await?;
            client.close_pr(pr.number).await?;
            client.delete_ref(tag_ref).await?;
            log::info!("merged PR #{} at {}", pr.number, tag_sha);
            Ok(StageOutcome::Merged)
        }
        Err(e) if e.is_unprocessable() => {
            let cmp = client.compare_commits(&base_ref, tag_sha).await?;
            if cmp == crate::forge::CompareResult::Diverged {
                abort(
                    client,
                    config,
                    pr,
                    tag_ref,
                    FailureKind::CleanStaged,
                    "base branch diverged during staging",
                )
                .await
            } else {
                Err(e)
            }
        }
        Err(e) => Err(e),
    }
}

async fn abort<C: ForgeClient + ?Sized>(
    client: &C,
    config: &Config,
    pr: &PullRequest,
    tag_ref: &str,
    kind: FailureKind,
    reason: &str,
) -> Result<StageOutcome> {
    if config.dry_run {
        log::info!("dry run: would abort PR #{} ({})", pr.number, reason);
        return Ok(StageOutcome::Skipped(format!("dry run: {}", reason)));
    }
    client.delete_ref(tag_ref).await?;
    apply_labels(client, config, pr.number, &pr.labels, &labels::on_failure(kind)).await?;
    log::info!("aborted PR #{}: {}", pr.number, reason);
    Ok(StageOutcome::Aborted(reason.to_string()))
}

/// `dryRun` > `stagedRun` > `guardedRun` (§4.3). Only this decision point gates base-branch
/// mutation; everything else (staging branch, tags, labels) remains mutable under
/// `stagedRun`/`guardedRun`.
fn advancing_allowed(config: &Config, pr: &PullRequest) -> bool {
    if config.dry_run || config.staged_run {
        return false;
    }
    if config.guarded_run {
        return pr.has_label(labels::CLEARED_FOR_MERGE);
    }
    true
}

/// Diffs `transition` against `current` labels so applying it twice is a no-op (§8 label
/// idempotence), then issues the minimal set of add/remove calls. Skipped entirely in dry
/// run.
async fn apply_labels<C: ForgeClient + ?Sized>(
    client: &C,
    config: &Config,
    number: i64,
    current: &[String],
    transition: &labels::LabelTransition,
) -> Result<()> {
    let to_add: Vec<String> = transition
        .add
        .iter()
        .filter(|l| !current.iter().any(|c| c == *l))
        .map(|s| s.to_string())
        .collect();
    let to_remove: Vec<&str> = transition
        .remove
        .iter()
        .filter(|l| current.iter().any(|c| c == *l))
        .copied()
        .collect();

    if to_add.is_empty() && to_remove.is_empty() {
        return Ok(());
    }
    if config.dry_run {
        log::info!(
            "dry run: PR #{} labels add={:?} remove={:?}",
            number,
            to_add,
            to_remove
        );
        return Ok(());
    }
    if !to_add.is_empty() {
        client.add_labels(number, &to_add).await?;
    }
    for label in to_remove {
        client.remove_label(number, label).await?;
    }
    Ok(())
}

/// §4.3 "Required-check counting": contexts are matched by prefix so sharded checks (e.g.
/// `Jenkins(build test) #17`) still satisfy a declared `Jenkins(build test)` requirement.
fn required_check_state(statuses: &[CheckStatus], required_contexts: &[String], k: usize) -> CheckState {
    if k == 0 {
        return CheckState::Success;
    }
    let matching: Vec<&CheckStatus> = statuses
        .iter()
        .filter(|s| required_contexts.iter().any(|rc| s.context.starts_with(rc.as_str())))
        .collect();

    if matching.iter().any(|s| s.state == CheckState::Pending) {
        return CheckState::Pending;
    }
    if matching.len() < k {
        return CheckState::Pending;
    }
    if matching.iter().all(|s| s.state == CheckState::Success) {
        CheckState::Success
    } else {
        CheckState::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::{CombinedStatus, Commit, CompareResult, Review, Signature};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn status(context: &str, state: CheckState) -> CheckStatus {
        CheckStatus {
            context: context.to_string(),
            state,
            description: None,
            target_url: None,
        }
    }

    fn status_with(
        context: &str,
        state: CheckState,
        description: Option<&str>,
        target_url: Option<&str>,
    ) -> CheckStatus {
        CheckStatus {
            context: context.to_string(),
            state,
            description: description.map(str::to_string),
            target_url: target_url.map(str::to_string),
        }
    }

    #[test]
    fn required_check_state_waits_for_missing_checks() {
        let required = vec!["ci/build".to_string()];
        assert_eq!(required_check_state(&[], &required, 1), CheckState::Pending);
    }

    #[test]
    fn required_check_state_matches_by_prefix() {
        let required = vec!["Jenkins(build test)".to_string()];
        let statuses = vec![status("Jenkins(build test) #17", CheckState::Success)];
        assert_eq!(
            required_check_state(&statuses, &required, 1),
            CheckState::Success
        );
    }

    #[test]
    fn required_check_state_pending_beats_failure() {
        let required = vec!["a".to_string(), "b".to_string()];
        let statuses = vec![
            status("a-1", CheckState::Failure),
            status("b-1", CheckState::Pending),
        ];
        assert_eq!(
            required_check_state(&statuses, &required, 2),
            CheckState::Pending
        );
    }

    #[test]
    fn required_check_state_failure_when_enough_completed_but_not_all_success() {
        let required = vec!["a".to_string(), "b".to_string()];
        let statuses = vec![
            status("a-1", CheckState::Success),
            status("b-1", CheckState::Failure),
        ];
        assert_eq!(
            required_check_state(&statuses, &required, 2),
            CheckState::Failure
        );
    }

    #[test]
    fn required_check_state_no_required_contexts_passes() {
        assert_eq!(required_check_state(&[], &[], 0), CheckState::Success);
    }

    /// Minimal in-memory forge double (§ SPEC_FULL E): enough state to drive a single PR
    /// through staging without ever touching the network.
    struct FakeForge {
        prs: Mutex<HashMap<i64, PullRequest>>,
        refs: Mutex<HashMap<String, String>>,
        commits: Mutex<HashMap<String, Commit>>,
        labels: Mutex<HashMap<i64, Vec<String>>>,
        reviews: Mutex<HashMap<i64, Vec<Review>>>,
        combined: Mutex<HashMap<String, CombinedStatus>>,
        required_contexts: Vec<String>,
        closed: Mutex<Vec<i64>>,
        status_writes: Mutex<Vec<String>>,
    }

    impl FakeForge {
        fn new() -> Self {
            FakeForge {
                prs: Mutex::new(HashMap::new()),
                refs: Mutex::new(HashMap::new()),
                commits: Mutex::new(HashMap::new()),
                labels: Mutex::new(HashMap::new()),
                reviews: Mutex::new(HashMap::new()),
                combined: Mutex::new(HashMap::new()),
                required_contexts: vec![],
                closed: Mutex::new(Vec::new()),
                status_writes: Mutex::new(Vec::new()),
            }
        }

        fn with_pr(self, pr: PullRequest) -> Self {
            self.labels.lock().insert(pr.number, pr.labels.clone());
            self.prs.lock().insert(pr.number, pr);
            self
        }
    }

    fn sig(name: &str) -> Signature {
        Signature {
            name: name.to_string(),
            email: format!("{}@example.com", name),
        }
    }

    #[async_trait]
    impl ForgeClient for FakeForge {
        async fn list_open_prs(&self) -> Result<Vec<PullRequest>> {
            Ok(vec![])
        }
        async fn get_pr(&self, number: i64, _await_mergeable: bool) -> Result<PullRequest> {
            let mut pr = self
                .prs
                .lock()
                .get(&number)
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    what: format!("PR #{}", number),
                })?;
            if let Some(labels) = self.labels.lock().get(&number) {
                pr.labels = labels.clone();
            }
            Ok(pr)
        }
        async fn get_reviews(&self, number: i64) -> Result<Vec<Review>> {
            Ok(self.reviews.lock().get(&number).cloned().unwrap_or_default())
        }
        async fn get_combined_status(&self, git_ref: &str) -> Result<CombinedStatus> {
            Ok(self
                .combined
                .lock()
                .get(git_ref)
                .cloned()
                .unwrap_or(CombinedStatus {
                    state: CheckState::Success,
                    statuses: vec![],
                }))
        }
        async fn get_required_status_contexts(&self, _branch: &str) -> Result<Vec<String>> {
            Ok(self.required_contexts.clone())
        }
        async fn get_commit(&self, sha: &str) -> Result<Commit> {
            self.commits
                .lock()
                .get(sha)
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    what: sha.to_string(),
                })
        }
        async fn get_ref(&self, qualified_name: &str) -> Result<String> {
            self.refs
                .lock()
                .get(qualified_name)
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    what: qualified_name.to_string(),
                })
        }
        async fn create_commit(
            &self,
            tree: &str,
            message: &str,
            parents: &[String],
            author: &Signature,
            committer: &Signature,
        ) -> Result<String> {
            let sha = format!("commit-{}", self.commits.lock().len() + 1);
            self.commits.lock().insert(
                sha.clone(),
                Commit {
                    sha: sha.clone(),
                    tree: tree.to_string(),
                    author: author.clone(),
                    committer: committer.clone(),
                    message: message.to_string(),
                },
            );
            let _ = parents;
            Ok(sha)
        }
        async fn create_ref(&self, qualified_name: &str, sha: &str) -> Result<()> {
            self.refs
                .lock()
                .insert(qualified_name.to_string(), sha.to_string());
            Ok(())
        }
        async fn update_ref(&self, qualified_name: &str, sha: &str, _force: bool) -> Result<()> {
            self.refs
                .lock()
                .insert(qualified_name.to_string(), sha.to_string());
            Ok(())
        }
        async fn delete_ref(&self, qualified_name: &str) -> Result<()> {
            self.refs.lock().remove(qualified_name);
            Ok(())
        }
        async fn compare_commits(&self, _base: &str, _head: &str) -> Result<CompareResult> {
            Ok(CompareResult::Identical)
        }
        async fn add_labels(&self, number: i64, new_labels: &[String]) -> Result<()> {
            let mut labels = self.labels.lock();
            let entry = labels.entry(number).or_default();
            for l in new_labels {
                if !entry.contains(l) {
                    entry.push(l.clone());
                }
            }
            Ok(())
        }
        async fn remove_label(&self, number: i64, label: &str) -> Result<()> {
            if let Some(entry) = self.labels.lock().get_mut(&number) {
                entry.retain(|l| l != label);
            }
            Ok(())
        }
        async fn list_labels(&self, number: i64) -> Result<Vec<String>> {
            Ok(self.labels.lock().get(&number).cloned().unwrap_or_default())
        }
        async fn create_status(
            &self,
            sha: &str,
            state: CheckState,
            target_url: Option<&str>,
            description: Option<&str>,
            context: &str,
        ) -> Result<()> {
            self.status_writes
                .lock()
                .push(format!("{}:{}", sha, context));
            let mut combined = self.combined.lock();
            let entry = combined.entry(sha.to_string()).or_insert(CombinedStatus {
                state: CheckState::Success,
                statuses: vec![],
            });
            let new_status = status_with(context, state, description, target_url);
            match entry.statuses.iter_mut().find(|s| s.context == context) {
                Some(existing) => *existing = new_status,
                None => entry.statuses.push(new_status),
            }
            Ok(())
        }
        async fn get_authenticated_emails(&self) -> Result<Vec<String>> {
            Ok(vec!["anubis@example.com".to_string()])
        }
        async fn get_user_display_name(&self, login: &str) -> Result<String> {
            Ok(login.to_string())
        }
        async fn close_pr(&self, number: i64) -> Result<()> {
            self.closed.lock().push(number);
            Ok(())
        }
    }

    fn pr(number: i64) -> PullRequest {
        PullRequest {
            number,
            state: PrState::Open,
            title: "Fix foo".to_string(),
            body: "does the thing".to_string(),
            author_login: "carol".to_string(),
            base_branch: "master".to_string(),
            head_branch: format!("pr-{}", number),
            head_sha: "head-sha".to_string(),
            html_url: String::new(),
            mergeable: Some(true),
            labels: vec![],
            requested_reviewers: vec![],
            created_at: Utc::now() - chrono::Duration::hours(49),
            updated_at: Utc::now(),
        }
    }

    fn config() -> Config {
        Config {
            owner: "o".to_string(),
            repo: "r".to_string(),
            github_login: "anubis".to_string(),
            github_token: "t".to_string(),
            webhook_path: "/webhook".to_string(),
            webhook_secret: "s".to_string(),
            host: "0.0.0.0".to_string(),
            port: 3000,
            staging_branch: "auto".to_string(),
            dry_run: false,
            staged_run: false,
            guarded_run: false,
            necessary_approvals: 1,
            sufficient_approvals: 2,
            voting_delay_min: std::time::Duration::from_secs(0),
            voting_delay_max: std::time::Duration::from_secs(60 * 60 * 24 * 10),
            staging_checks: None,
            core_developers: HashSet::new(),
            approval_url: None,
            request_timeout: std::time::Duration::from_secs(180),
        }
    }

    #[tokio::test]
    async fn stages_an_eligible_pr() {
        let forge = FakeForge::new().with_pr(pr(10));
        forge
            .refs
            .lock()
            .insert("heads/master".to_string(), "base-sha".to_string());
        forge
            .refs
            .lock()
            .insert("pull/10/merge".to_string(), "merge-sha".to_string());
        forge.commits.lock().insert(
            "merge-sha".to_string(),
            Commit {
                sha: "merge-sha".to_string(),
                tree: "tree-1".to_string(),
                author: sig("carol"),
                committer: sig("carol"),
                message: "merge".to_string(),
            },
        );
        forge
            .combined
            .lock()
            .insert("head-sha".to_string(), CombinedStatus { state: CheckState::Success, statuses: vec![] });
        forge
            .reviews
            .lock()
            .insert(10, vec![
                Review { reviewer_login: "alice".to_string(), submitted_at: Utc::now(), state: crate::forge::ReviewState::Approved },
                Review { reviewer_login: "bob".to_string(), submitted_at: Utc::now(), state: crate::forge::ReviewState::Approved },
            ]);

        let mut config = config();
        config.core_developers.insert("alice".to_string());
        config.core_developers.insert("bob".to_string());
        let bot_identity = BotIdentityCache::new();
        let slot = StagingSlot::new(None);
        let outcome = process(&forge, &config, &bot_identity, 10, &config.core_developers.clone(), Utc::now(), &slot)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Staged);
        assert!(forge.refs.lock().contains_key("tags/M-staged-PR10"));
        assert!(forge
            .labels
            .lock()
            .get(&10)
            .unwrap()
            .contains(&labels::WAITING_STAGING_CHECKS.to_string()));
    }

    #[tokio::test]
    async fn wip_title_is_not_eligible() {
        let mut p = pr(11);
        p.title = "WIP: still working".to_string();
        let forge = FakeForge::new().with_pr(p);
        let config = config();
        let bot_identity = BotIdentityCache::new();
        let slot = StagingSlot::new(None);
        let outcome = process(&forge, &config, &bot_identity, 11, &config.core_developers, Utc::now(), &slot)
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::NotEligible(_)));
    }

    #[tokio::test]
    async fn merged_label_short_circuits() {
        let mut p = pr(12);
        p.labels.push(labels::MERGED.to_string());
        let forge = FakeForge::new().with_pr(p);
        let config = config();
        let bot_identity = BotIdentityCache::new();
        let slot = StagingSlot::new(None);
        let outcome = process(&forge, &config, &bot_identity, 12, &config.core_developers, Utc::now(), &slot)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::NotEligible("already merged".to_string()));
    }

    #[tokio::test]
    async fn advances_and_merges_once_checks_pass() {
        let forge = FakeForge::new().with_pr(pr(10));
        forge
            .refs
            .lock()
            .insert("tags/M-staged-PR10".to_string(), "staging-sha".to_string());
        forge
            .refs
            .lock()
            .insert("pull/10/merge".to_string(), "merge-sha".to_string());
        forge.commits.lock().insert(
            "staging-sha".to_string(),
            Commit {
                sha: "staging-sha".to_string(),
                tree: "tree-1".to_string(),
                author: sig("carol"),
                committer: sig("anubis"),
                message: "Fix foo (#10)".to_string(),
            },
        );
        forge.commits.lock().insert(
            "merge-sha".to_string(),
            Commit {
                sha: "merge-sha".to_string(),
                tree: "tree-1".to_string(),
                author: sig("carol"),
                committer: sig("carol"),
                message: "merge".to_string(),
            },
        );
        forge.combined.lock().insert(
            "head-sha".to_string(),
            CombinedStatus { state: CheckState::Success, statuses: vec![] },
        );
        forge.combined.lock().insert(
            "staging-sha".to_string(),
            CombinedStatus {
                state: CheckState::Success,
                statuses: vec![status("ci/build", CheckState::Success)],
            },
        );
        forge
            .reviews
            .lock()
            .insert(10, vec![Review { reviewer_login: "alice".to_string(), submitted_at: Utc::now(), state: crate::forge::ReviewState::Approved }]);

        let mut config = config();
        config.core_developers.insert("alice".to_string());
        let bot_identity = BotIdentityCache::new();
        let slot = StagingSlot::new(Some(10));
        let outcome = process(&forge, &config, &bot_identity, 10, &config.core_developers.clone(), Utc::now(), &slot)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Merged);
        assert_eq!(forge.refs.lock().get("heads/master"), Some(&"staging-sha".to_string()));
        assert!(!forge.refs.lock().contains_key("tags/M-staged-PR10"));
        assert_eq!(*forge.closed.lock(), vec![10]);
    }

    #[tokio::test]
    async fn guarded_run_blocks_advance_without_cleared_label() {
        let forge = FakeForge::new().with_pr(pr(10));
        forge
            .refs
            .lock()
            .insert("tags/M-staged-PR10".to_string(), "staging-sha".to_string());
        forge
            .refs
            .lock()
            .insert("pull/10/merge".to_string(), "merge-sha".to_string());
        forge.commits.lock().insert(
            "staging-sha".to_string(),
            Commit {
                sha: "staging-sha".to_string(),
                tree: "tree-1".to_string(),
                author: sig("carol"),
                committer: sig("anubis"),
                message: "Fix foo (#10)".to_string(),
            },
        );
        forge.commits.lock().insert(
            "merge-sha".to_string(),
            Commit {
                sha: "merge-sha".to_string(),
                tree: "tree-1".to_string(),
                author: sig("carol"),
                committer: sig("carol"),
                message: "merge".to_string(),
            },
        );
        forge.combined.lock().insert(
            "head-sha".to_string(),
            CombinedStatus { state: CheckState::Success, statuses: vec![] },
        );
        forge.combined.lock().insert(
            "staging-sha".to_string(),
            CombinedStatus { state: CheckState::Success, statuses: vec![] },
        );
        forge.reviews.lock().insert(10, vec![]);

        let mut config = config();
        config.guarded_run = true;
        config.necessary_approvals = 0;
        let bot_identity = BotIdentityCache::new();
        let slot = StagingSlot::new(Some(10));
        let outcome = process(&forge, &config, &bot_identity, 10, &config.core_developers.clone(), Utc::now(), &slot)
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::Skipped(_)));
        assert!(forge.refs.lock().get("heads/master").is_none());
    }

    #[tokio::test]
    async fn second_eligible_pr_is_turned_away_while_slot_is_occupied() {
        let forge = FakeForge::new().with_pr(pr(20));
        forge
            .refs
            .lock()
            .insert("heads/master".to_string(), "base-sha".to_string());
        forge
            .refs
            .lock()
            .insert("pull/20/merge".to_string(), "merge-sha".to_string());
        forge.commits.lock().insert(
            "merge-sha".to_string(),
            Commit {
                sha: "merge-sha".to_string(),
                tree: "tree-1".to_string(),
                author: sig("carol"),
                committer: sig("carol"),
                message: "merge".to_string(),
            },
        );
        forge
            .combined
            .lock()
            .insert("head-sha".to_string(), CombinedStatus { state: CheckState::Success, statuses: vec![] });

        let mut config = config();
        config.necessary_approvals = 0;
        let bot_identity = BotIdentityCache::new();
        // Some other PR (#10) already occupies the staging branch this scan.
        let slot = StagingSlot::new(Some(10));
        let outcome = process(&forge, &config, &bot_identity, 20, &config.core_developers, Utc::now(), &slot)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StageOutcome::NotEligible("staging branch is occupied by another PR".to_string())
        );
        assert!(!forge.refs.lock().contains_key("tags/M-staged-PR20"));
    }

    #[tokio::test]
    async fn publish_approval_status_skips_duplicate_write() {
        let forge = FakeForge::new();
        forge
            .combined
            .lock()
            .insert("sha1".to_string(), CombinedStatus { state: CheckState::Success, statuses: vec![] });
        let mut config = config();
        config.approval_url = Some("https://example.com/approval".to_string());
        let approval = Approval::Ready {
            description: "approved".to_string(),
        };

        publish_approval_status(&forge, &config, "sha1", &approval)
            .await
            .unwrap();
        publish_approval_status(&forge, &config, "sha1", &approval)
            .await
            .unwrap();

        assert_eq!(forge.status_writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn publish_approval_status_noop_without_approval_url() {
        let forge = FakeForge::new();
        let config = config();
        let approval = Approval::Ready {
            description: "approved".to_string(),
        };
        publish_approval_status(&forge, &config, "sha1", &approval)
            .await
            .unwrap();
        assert!(forge.status_writes.lock().is_empty());
    }
}
