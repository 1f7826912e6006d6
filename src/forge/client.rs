//! The one concrete [`ForgeClient`]: a GitHub REST client built on `reqwest`, grounded on
//! the stack the teacher's own later revision uses for this purpose
//! (`other_examples/manifests/paritytech-parity-processbot/Cargo.toml`: `reqwest`, `serde`,
//! `chrono`). Pagination and rate-limit pacing (§4.1) live entirely in here; callers never
//! see a page boundary.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::ResultExt;

use super::{
    CheckState, CombinedStatus, CompareResult, Commit, ForgeClient, PrState, PullRequest,
    Review, ReviewState, Signature,
};
use crate::error::{self, Error};
use crate::Result;

const BASE_URL: &str = "https://api.github.com";
const MERGEABLE_POLL_INITIAL: Duration = Duration::from_secs(1);
const MERGEABLE_POLL_CAP: Duration = Duration::from_secs(64);
const MERGEABLE_POLL_BUDGET: Duration = Duration::from_secs(120);

pub struct GithubForgeClient {
    http: reqwest::Client,
    owner: String,
    repo: String,
    token: String,
}

impl GithubForgeClient {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context(error::Http)?;
        Ok(GithubForgeClient {
            http,
            owner: owner.into(),
            repo: repo.into(),
            token: token.into(),
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{}", BASE_URL, self.owner, self.repo, path)
    }

    /// Central request path: every non-search call funnels through here so the rate-limit
    /// pacing rule (§4.1) is applied uniformly.
    async fn request(&self, method: Method, url: &str) -> Result<reqwest::Response> {
        let resp = self
            .http
            .request(method, url)
            .header(header::AUTHORIZATION, format!("token {}", self.token))
            .header(header::USER_AGENT, "anubis-bot")
            .header(header::ACCEPT, "application/vnd.github.v3+json")
            .send()
            .await
            .context(error::Http)?;
        self.pace_from_headers(&resp).await;
        Ok(resp)
    }

    async fn request_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let resp = self
            .http
            .request(method, url)
            .header(header::AUTHORIZATION, format!("token {}", self.token))
            .header(header::USER_AGENT, "anubis-bot")
            .header(header::ACCEPT, "application/vnd.github.v3+json")
            .json(body)
            .send()
            .await
            .context(error::Http)?;
        self.pace_from_headers(&resp).await;
        Ok(resp)
    }

    /// If more than 20% of the rate-limit quota has been consumed, sleep
    /// `(resetAt - now) / remaining` before returning control to the caller (§4.1).
    async fn pace_from_headers(&self, resp: &reqwest::Response) {
        let headers = resp.headers();
        let used: Option<u64> = header_num(headers, "x-ratelimit-used");
        let limit: Option<u64> = header_num(headers, "x-ratelimit-limit");
        let remaining: Option<u64> = header_num(headers, "x-ratelimit-remaining");
        let reset_at: Option<i64> = header_num(headers, "x-ratelimit-reset");

        if let (Some(used), Some(limit), Some(remaining), Some(reset_at)) =
            (used, limit, remaining, reset_at)
        {
            if limit == 0 || remaining == 0 {
                return;
            }
            let consumed_fraction = used as f64 / limit as f64;
            if consumed_fraction > 0.2 {
                let now = Utc::now().timestamp();
                let seconds_to_reset = (reset_at - now).max(0) as f64;
                let delay_ms = (seconds_to_reset * 1000.0 / remaining as f64).max(0.0);
                if delay_ms > 0.0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
                }
            }
        }
    }

    async fn check_status(&self, resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(resp),
            StatusCode::NOT_FOUND => Err(Error::NotFound {
                what: what.to_string(),
            }),
            StatusCode::UNPROCESSABLE_ENTITY => Err(Error::Unprocessable {
                what: what.to_string(),
            }),
            code => {
                let body = resp.text().await.unwrap_or_default();
                Err(Error::Forge {
                    code: code.as_u16(),
                    msg: body,
                })
            }
        }
    }

    /// Follows `Link: <url>; rel="next"` headers until exhausted, preserving ordering.
    async fn get_all<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(format!("{}{}per_page=100", url, sep(url)));
        while let Some(page_url) = next {
            let resp = self.request(Method::GET, &page_url).await?;
            let resp = self.check_status(resp, &page_url).await?;
            next = next_link(resp.headers());
            let mut page: Vec<T> = resp.json().await.context(error::Http)?;
            items.append(&mut page);
        }
        Ok(items)
    }
}

fn sep(url: &str) -> &'static str {
    if url.contains('?') {
        "&"
    } else {
        "?"
    }
}

fn header_num<T: std::str::FromStr>(headers: &header::HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn next_link(headers: &header::HeaderMap) -> Option<String> {
    let link = headers.get(header::LINK)?.to_str().ok()?;
    for part in link.split(',') {
        let mut segments = part.split(';');
        let url_part = segments.next()?.trim();
        let is_next = segments.any(|s| s.trim() == r#"rel="next""#);
        if is_next {
            return Some(
                url_part
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string(),
            );
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhBranchRef {
    #[serde(rename = "ref")]
    ref_field: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: i64,
    state: String,
    title: String,
    #[serde(default)]
    body: Option<String>,
    user: GhUser,
    html_url: String,
    mergeable: Option<bool>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    requested_reviewers: Vec<GhUser>,
    base: GhBranchRef,
    head: GhBranchRef,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<GhPullRequest> for PullRequest {
    fn from(pr: GhPullRequest) -> Self {
        PullRequest {
            number: pr.number,
            state: if pr.state == "open" {
                PrState::Open
            } else {
                PrState::Closed
            },
            title: pr.title,
            body: pr.body.unwrap_or_default(),
            author_login: pr.user.login,
            base_branch: pr.base.ref_field,
            head_branch: pr.head.ref_field,
            head_sha: pr.head.sha,
            html_url: pr.html_url,
            mergeable: pr.mergeable,
            labels: pr.labels.into_iter().map(|l| l.name).collect(),
            requested_reviewers: pr
                .requested_reviewers
                .into_iter()
                .map(|u| u.login)
                .collect(),
            created_at: pr.created_at,
            updated_at: pr.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhReview {
    user: GhUser,
    state: String,
    submitted_at: DateTime<Utc>,
}

impl From<GhReview> for Review {
    fn from(r: GhReview) -> Self {
        Review {
            reviewer_login: r.user.login,
            submitted_at: r.submitted_at,
            state: match r.state.as_str() {
                "APPROVED" => ReviewState::Approved,
                "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
                _ => ReviewState::Other,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhStatus {
    context: String,
    state: String,
    description: Option<String>,
    target_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhCombinedStatus {
    state: String,
    statuses: Vec<GhStatus>,
}

fn parse_check_state(s: &str) -> CheckState {
    match s {
        "success" => CheckState::Success,
        "pending" => CheckState::Pending,
        "error" => CheckState::Error,
        _ => CheckState::Failure,
    }
}

#[derive(Debug, Deserialize)]
struct GhCommit {
    sha: String,
    commit: GhCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GhCommitDetail {
    message: String,
    tree: GhTree,
    author: GhSignature,
    committer: GhSignature,
}

#[derive(Debug, Deserialize)]
struct GhTree {
    sha: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
struct GhSignature {
    name: String,
    email: String,
}

impl From<GhSignature> for Signature {
    fn from(s: GhSignature) -> Self {
        Signature {
            name: s.name,
            email: s.email,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhCompare {
    status: String,
}

#[derive(Debug, Deserialize)]
struct GhRefObject {
    object: GhRefTarget,
}

#[derive(Debug, Deserialize)]
struct GhRefTarget {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateCommitPayload<'a> {
    message: &'a str,
    tree: &'a str,
    parents: &'a [String],
    author: GhSignature,
    committer: GhSignature,
}

#[derive(Debug, Deserialize)]
struct CreatedSha {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateRefPayload<'a> {
    #[serde(rename = "ref")]
    ref_field: String,
    sha: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateRefPayload<'a> {
    sha: &'a str,
    force: bool,
}

#[derive(Debug, Serialize)]
struct CreateStatusPayload<'a> {
    state: &'a str,
    target_url: Option<&'a str>,
    description: Option<&'a str>,
    context: &'a str,
}

#[async_trait]
impl ForgeClient for GithubForgeClient {
    async fn list_open_prs(&self) -> Result<Vec<PullRequest>> {
        let url = self.repo_url("/pulls?state=open");
        let prs: Vec<GhPullRequest> = self.get_all(&url).await?;
        Ok(prs.into_iter().map(Into::into).collect())
    }

    async fn get_pr(&self, number: i64, await_mergeable: bool) -> Result<PullRequest> {
        let url = self.repo_url(&format!("/pulls/{}", number));
        let mut delay = MERGEABLE_POLL_INITIAL;
        let mut waited = Duration::from_secs(0);
        loop {
            let resp = self.request(Method::GET, &url).await?;
            let resp = self.check_status(resp, &format!("PR #{}", number)).await?;
            let raw: GhPullRequest = resp.json().await.context(error::Http)?;
            let is_open = raw.state == "open";
            let mergeable = raw.mergeable;
            let pr: PullRequest = raw.into();
            if !await_mergeable || mergeable.is_some() || !is_open {
                return Ok(pr);
            }
            if waited >= MERGEABLE_POLL_BUDGET {
                return Err(Error::Timeout {
                    what: format!("mergeable flag for PR #{}", number),
                });
            }
            tokio::time::sleep(delay).await;
            waited += delay;
            delay = (delay * 2).min(MERGEABLE_POLL_CAP);
        }
    }

    async fn get_reviews(&self, number: i64) -> Result<Vec<Review>> {
        let url = self.repo_url(&format!("/pulls/{}/reviews", number));
        let reviews: Vec<GhReview> = self.get_all(&url).await?;
        Ok(reviews.into_iter().map(Into::into).collect())
    }

    async fn get_combined_status(&self, git_ref: &str) -> Result<CombinedStatus> {
        let url = self.repo_url(&format!("/commits/{}/status", git_ref));
        let resp = self.request(Method::GET, &url).await?;
        let resp = self.check_status(resp, &format!("status for {}", git_ref)).await?;
        let raw: GhCombinedStatus = resp.json().await.context(error::Http)?;
        Ok(CombinedStatus {
            state: parse_check_state(&raw.state),
            statuses: raw
                .statuses
                .into_iter()
                .map(|s| super::CheckStatus {
                    context: s.context,
                    state: parse_check_state(&s.state),
                    description: s.description,
                    target_url: s.target_url,
                })
                .collect(),
        })
    }

    async fn get_required_status_contexts(&self, branch: &str) -> Result<Vec<String>> {
        let url = self.repo_url(&format!(
            "/branches/{}/protection/required_status_checks/contexts",
            branch
        ));
        let resp = self.request(Method::GET, &url).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(vec![]),
            _ => {
                let resp = self
                    .check_status(resp, &format!("required status contexts for {}", branch))
                    .await?;
                resp.json().await.context(error::Http)
            }
        }
    }

    async fn get_commit(&self, sha: &str) -> Result<Commit> {
        let url = self.repo_url(&format!("/commits/{}", sha));
        let resp = self.request(Method::GET, &url).await?;
        let resp = self.check_status(resp, &format!("commit {}", sha)).await?;
        let raw: GhCommit = resp.json().await.context(error::Http)?;
        Ok(Commit {
            sha: raw.sha,
            tree: raw.commit.tree.sha,
            author: raw.commit.author.into(),
            committer: raw.commit.committer.into(),
            message: raw.commit.message,
        })
    }

    async fn get_ref(&self, qualified_name: &str) -> Result<String> {
        let url = self.repo_url(&format!("/git/refs/{}", qualified_name));
        let resp = self.request(Method::GET, &url).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound {
                what: format!("ref {}", qualified_name),
            });
        }
        let resp = self.check_status(resp, &format!("ref {}", qualified_name)).await?;
        let value: serde_json::Value = resp.json().await.context(error::Http)?;
        if value.is_array() {
            return Err(Error::Ambiguous {
                what: format!("ref {}", qualified_name),
            });
        }
        let raw: GhRefObject = serde_json::from_value(value).map_err(|e| Error::Message {
            msg: format!("unexpected ref payload: {}", e),
        })?;
        Ok(raw.object.sha)
    }

    async fn create_commit(
        &self,
        tree: &str,
        message: &str,
        parents: &[String],
        author: &Signature,
        committer: &Signature,
    ) -> Result<String> {
        let url = self.repo_url("/git/commits");
        let payload = CreateCommitPayload {
            message,
            tree,
            parents,
            author: GhSignature {
                name: author.name.clone(),
                email: author.email.clone(),
            },
            committer: GhSignature {
                name: committer.name.clone(),
                email: committer.email.clone(),
            },
        };
        let resp = self.request_json(Method::POST, &url, &payload).await?;
        let resp = self.check_status(resp, "create commit").await?;
        let created: CreatedSha = resp.json().await.context(error::Http)?;
        Ok(created.sha)
    }

    async fn create_ref(&self, qualified_name: &str, sha: &str) -> Result<()> {
        let url = self.repo_url("/git/refs");
        let payload = CreateRefPayload {
            ref_field: format!("refs/{}", qualified_name),
            sha,
        };
        let resp = self.request_json(Method::POST, &url, &payload).await?;
        self.check_status(resp, &format!("create ref {}", qualified_name))
            .await?;
        Ok(())
    }

    async fn update_ref(&self, qualified_name: &str, sha: &str, force: bool) -> Result<()> {
        let url = self.repo_url(&format!("/git/refs/{}", qualified_name));
        let payload = UpdateRefPayload { sha, force };
        let resp = self
            .http
            .patch(&url)
            .header(header::AUTHORIZATION, format!("token {}", self.token))
            .header(header::USER_AGENT, "anubis-bot")
            .json(&payload)
            .send()
            .await
            .context(error::Http)?;
        self.pace_from_headers(&resp).await;
        self.check_status(resp, &format!("update ref {}", qualified_name))
            .await?;
        Ok(())
    }

    async fn delete_ref(&self, qualified_name: &str) -> Result<()> {
        let url = self.repo_url(&format!("/git/refs/{}", qualified_name));
        let resp = self.request(Method::DELETE, &url).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            _ => {
                self.check_status(resp, &format!("delete ref {}", qualified_name))
                    .await?;
                Ok(())
            }
        }
    }

    async fn compare_commits(&self, base: &str, head: &str) -> Result<CompareResult> {
        let url = self.repo_url(&format!("/compare/{}...{}", base, head));
        let resp = self.request(Method::GET, &url).await?;
        let resp = self
            .check_status(resp, &format!("compare {}...{}", base, head))
            .await?;
        let raw: GhCompare = resp.json().await.context(error::Http)?;
        Ok(match raw.status.as_str() {
            "ahead" => CompareResult::Ahead,
            "behind" => CompareResult::Behind,
            "identical" => CompareResult::Identical,
            _ => CompareResult::Diverged,
        })
    }

    async fn add_labels(&self, number: i64, labels: &[String]) -> Result<()> {
        let url = self.repo_url(&format!("/issues/{}/labels", number));
        let resp = self.request_json(Method::POST, &url, &labels).await?;
        self.check_status(resp, &format!("add labels to #{}", number))
            .await?;
        Ok(())
    }

    async fn remove_label(&self, number: i64, label: &str) -> Result<()> {
        let url = self.repo_url(&format!(
            "/issues/{}/labels/{}",
            number,
            urlencoding::encode(label)
        ));
        let resp = self.request(Method::DELETE, &url).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            _ => {
                self.check_status(resp, &format!("remove label {} from #{}", label, number))
                    .await?;
                Ok(())
            }
        }
    }

    async fn list_labels(&self, number: i64) -> Result<Vec<String>> {
        let url = self.repo_url(&format!("/issues/{}/labels", number));
        let labels: Vec<GhLabel> = self.get_all(&url).await?;
        Ok(labels.into_iter().map(|l| l.name).collect())
    }

    async fn create_status(
        &self,
        sha: &str,
        state: CheckState,
        target_url: Option<&str>,
        description: Option<&str>,
        context: &str,
    ) -> Result<()> {
        let url = self.repo_url(&format!("/statuses/{}", sha));
        let state_str = match state {
            CheckState::Success => "success",
            CheckState::Pending => "pending",
            CheckState::Failure => "failure",
            CheckState::Error => "error",
        };
        let payload = CreateStatusPayload {
            state: state_str,
            target_url,
            description,
            context,
        };
        let resp = self.request_json(Method::POST, &url, &payload).await?;
        self.check_status(resp, &format!("create status on {}", sha))
            .await?;
        Ok(())
    }

    async fn get_authenticated_emails(&self) -> Result<Vec<String>> {
        let url = format!("{}/user/emails", BASE_URL);
        #[derive(Deserialize)]
        struct GhEmail {
            email: String,
        }
        let emails: Vec<GhEmail> = self.get_all(&url).await?;
        Ok(emails.into_iter().map(|e| e.email).collect())
    }

    async fn get_user_display_name(&self, login: &str) -> Result<String> {
        let url = format!("{}/users/{}", BASE_URL, login);
        let resp = self.request(Method::GET, &url).await?;
        let resp = self.check_status(resp, &format!("user {}", login)).await?;
        let raw: GhUser = resp.json().await.context(error::Http)?;
        Ok(raw.name.unwrap_or(raw.login))
    }

    async fn close_pr(&self, number: i64) -> Result<()> {
        let url = self.repo_url(&format!("/pulls/{}", number));
        #[derive(Serialize)]
        struct ClosePayload<'a> {
            state: &'a str,
        }
        let resp = self
            .request_json(Method::PATCH, &url, &ClosePayload { state: "closed" })
            .await?;
        self.check_status(resp, &format!("close PR #{}", number))
            .await?;
        Ok(())
    }
}
