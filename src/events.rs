//! Translates inbound webhook payloads into sets of [`PrIdentity`] values (§4.6). Pure: no
//! forge calls live here, matching the teacher's `Payload` enum in `webhook.rs` but stripped
//! down to the events this bot actually reacts to.

use serde::Deserialize;

use crate::identity::PrIdentity;

/// The event is already tagged by GitHub's `X-GitHub-Event` header; the webhook receiver
/// picks the right variant to deserialize the body into rather than relying on serde to
/// guess from shape.
#[derive(Debug)]
pub enum Payload {
    PullRequest(PullRequestPayload),
    PullRequestReview(PullRequestReviewPayload),
    Status(StatusPayload),
    Push(PushPayload),
    CheckRun(CheckRunPayload),
    WorkflowRun(WorkflowRunPayload),
    Ping(PingPayload),
}

#[derive(Debug, Deserialize)]
pub struct PullRequestPayload {
    pub pull_request: PrNumberOnly,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestReviewPayload {
    pub pull_request: PrNumberOnly,
    pub review: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct PrNumberOnly {
    pub number: i64,
}

#[derive(Debug, Deserialize)]
pub struct StatusPayload {
    pub branches: Vec<BranchRef>,
    pub commit: CommitRef,
    pub sha: String,
}

#[derive(Debug, Deserialize)]
pub struct BranchRef {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CommitRef {
    pub commit: InnerCommit,
}

#[derive(Debug, Deserialize)]
pub struct InnerCommit {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Deserialize)]
pub struct HeadCommit {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckRunPayload {
    pub check_run: CheckRunInner,
}

#[derive(Debug, Deserialize)]
pub struct CheckRunInner {
    pub head_sha: String,
    pub pull_requests: Vec<PrRefWithUrl>,
    pub check_suite: CheckSuiteInner,
}

#[derive(Debug, Deserialize)]
pub struct CheckSuiteInner {
    pub head_branch: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowRunPayload {
    pub workflow_run: WorkflowRunInner,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowRunInner {
    pub head_sha: String,
    pub head_branch: String,
    pub pull_requests: Vec<PrRefWithUrl>,
}

#[derive(Debug, Deserialize)]
pub struct PrRefWithUrl {
    pub number: i64,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct PingPayload {
    pub zen: Option<String>,
}

/// §4.6: decode a webhook payload into the set of PRs it might affect. `owner_repo` is the
/// `"owner/repo"` string expected in a `pull_requests[].url`, used to filter out check/workflow
/// runs belonging to other repositories sharing the same CI.
pub fn decode(payload: &Payload, staging_branch: &str, owner_repo: &str) -> Vec<PrIdentity> {
    match payload {
        Payload::PullRequest(p) => vec![PrIdentity::pr_num(p.pull_request.number)],
        Payload::PullRequestReview(p) => vec![PrIdentity::pr_num(p.pull_request.number)],
        Payload::Status(s) => s
            .branches
            .iter()
            .map(|b| PrIdentity::branch(b.name.clone(), Some(s.commit.commit.message.clone())))
            .collect(),
        Payload::Push(p) => match p.git_ref.strip_prefix("refs/heads/") {
            Some(branch) => vec![PrIdentity::branch(
                branch.to_string(),
                p.head_commit.as_ref().map(|c| c.message.clone()),
            )],
            None => vec![],
        },
        Payload::CheckRun(c) => {
            if !c.check_run.pull_requests.is_empty() {
                c.check_run
                    .pull_requests
                    .iter()
                    .filter(|pr| pr.url.contains(owner_repo))
                    .map(|pr| PrIdentity::pr_num(pr.number))
                    .collect()
            } else if c.check_run.check_suite.head_branch == staging_branch {
                vec![PrIdentity::sha(c.check_run.head_sha.clone(), None)]
            } else {
                vec![]
            }
        }
        Payload::WorkflowRun(w) => {
            if !w.workflow_run.pull_requests.is_empty() {
                w.workflow_run
                    .pull_requests
                    .iter()
                    .filter(|pr| pr.url.contains(owner_repo))
                    .map(|pr| PrIdentity::pr_num(pr.number))
                    .collect()
            } else if w.workflow_run.head_branch == staging_branch {
                vec![PrIdentity::sha(w.workflow_run.head_sha.clone(), None)]
            } else {
                vec![]
            }
        }
        Payload::Ping(_) => vec![],
    }
}
