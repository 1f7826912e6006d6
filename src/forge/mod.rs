//! The forge is treated as an abstract API surface (§1, §4.1, §6.1): the core only ever
//! talks to the [`ForgeClient`] trait. [`client`] holds the one concrete implementation.

pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: i64,
    pub state: PrState,
    pub title: String,
    pub body: String,
    pub author_login: String,
    pub base_branch: String,
    pub head_branch: String,
    pub head_sha: String,
    pub html_url: String,
    /// `None` means the forge has not finished computing mergeability yet.
    pub mergeable: Option<bool>,
    pub labels: Vec<String>,
    pub requested_reviewers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PullRequest {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l == name)
    }
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct Commit {
    pub sha: String,
    pub tree: String,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Other,
}

#[derive(Debug, Clone)]
pub struct Review {
    pub reviewer_login: String,
    pub submitted_at: DateTime<Utc>,
    pub state: ReviewState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Success,
    Pending,
    Failure,
    Error,
}

#[derive(Debug, Clone)]
pub struct CheckStatus {
    pub context: String,
    pub state: CheckState,
    pub description: Option<String>,
    pub target_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CombinedStatus {
    pub state: CheckState,
    pub statuses: Vec<CheckStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    Ahead,
    Behind,
    Identical,
    Diverged,
}

/// The operations the core consumes (§4.1). Pagination is transparent to callers: every
/// list-returning method already enumerates every page before returning.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    async fn list_open_prs(&self) -> Result<Vec<PullRequest>>;

    /// When `await_mergeable` is true and the forge has not yet computed `mergeable`, poll
    /// with exponential backoff starting at 1s, doubling to a 64s cap, for up to ~2 minutes
    /// total. Fails with `Timeout` if still unknown and the PR is open (§4.1).
    async fn get_pr(&self, number: i64, await_mergeable: bool) -> Result<PullRequest>;

    async fn get_reviews(&self, number: i64) -> Result<Vec<Review>>;

    async fn get_combined_status(&self, git_ref: &str) -> Result<CombinedStatus>;

    async fn get_required_status_contexts(&self, branch: &str) -> Result<Vec<String>>;

    async fn get_commit(&self, sha: &str) -> Result<Commit>;

    /// Fails `NotFound` if the ref is absent, `Ambiguous` if the forge returns an array of
    /// near matches.
    async fn get_ref(&self, qualified_name: &str) -> Result<String>;

    async fn create_commit(
        &self,
        tree: &str,
        message: &str,
        parents: &[String],
        author: &Signature,
        committer: &Signature,
    ) -> Result<String>;

    async fn create_ref(&self, qualified_name: &str, sha: &str) -> Result<()>;

    /// Non-forced updates fail `Unprocessable` unless the update is a fast-forward.
    async fn update_ref(&self, qualified_name: &str, sha: &str, force: bool) -> Result<()>;

    async fn delete_ref(&self, qualified_name: &str) -> Result<()>;

    async fn compare_commits(&self, base: &str, head: &str) -> Result<CompareResult>;

    async fn add_labels(&self, number: i64, labels: &[String]) -> Result<()>;

    async fn remove_label(&self, number: i64, label: &str) -> Result<()>;

    async fn list_labels(&self, number: i64) -> Result<Vec<String>>;

    async fn create_status(
        &self,
        sha: &str,
        state: CheckState,
        target_url: Option<&str>,
        description: Option<&str>,
        context: &str,
    ) -> Result<()>;

    async fn get_authenticated_emails(&self) -> Result<Vec<String>>;

    async fn get_user_display_name(&self, login: &str) -> Result<String>;

    /// Anubis closes the PR itself on merge rather than relying on the forge to notice the
    /// fast-forward (§1 Non-goals: "recognizing PRs as merged ... after a fast-forward").
    async fn close_pr(&self, number: i64) -> Result<()>;
}
