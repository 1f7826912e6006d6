//! Immutable configuration, read once from the environment at startup (§6.4, §9 "Global
//! mutable state": the design calls for exactly one configuration value passed through
//! constructors rather than a process-wide singleton). Grounded on `main.rs`'s
//! `dotenv::dotenv().ok()` + `dotenv::var(...).expect(...)` pattern.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::Error;
use crate::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub owner: String,
    pub repo: String,
    pub github_login: String,
    pub github_token: String,

    pub webhook_path: String,
    pub webhook_secret: String,
    pub host: String,
    pub port: u16,

    pub staging_branch: String,

    pub dry_run: bool,
    pub staged_run: bool,
    pub guarded_run: bool,

    pub necessary_approvals: usize,
    pub sufficient_approvals: usize,
    pub voting_delay_min: Duration,
    pub voting_delay_max: Duration,

    /// Overrides the forge's declared required-check count when set (§4.3).
    pub staging_checks: Option<usize>,

    pub core_developers: HashSet<String>,

    /// When `Some`, approval statuses are published under context `"PR approval"` (§4.2).
    pub approval_url: Option<String>,

    pub request_timeout: Duration,
}

impl Config {
    /// Fatal configuration error aborts the process before the scan loop starts (§7).
    pub fn from_env() -> Result<Config> {
        dotenv::dotenv().ok();

        let owner = require_var("OWNER")?;
        let repo = require_var("REPO")?;
        let github_login = require_var("GITHUB_LOGIN")?;
        let github_token = require_var("GITHUB_TOKEN")?;

        let webhook_path = var_or("GITHUB_WEBHOOK_PATH", "/webhook");
        let webhook_secret = require_var("GITHUB_WEBHOOK_SECRET")?;
        let host = var_or("HOST", "0.0.0.0");
        let port = parse_var_or("PORT", 3000)?;

        let staging_branch = var_or("STAGING_BRANCH", "auto");

        let dry_run = parse_bool_or("DRY_RUN", false)?;
        let staged_run = parse_bool_or("STAGED_RUN", false)?;
        let guarded_run = parse_bool_or("GUARDED_RUN", false)?;

        let necessary_approvals: usize = parse_var_or("NECESSARY_APPROVALS", 1)?;
        let sufficient_approvals: usize = parse_var_or("SUFFICIENT_APPROVALS", 2)?;
        let voting_delay_min = Duration::from_millis(parse_var_or("VOTING_DELAY_MIN_MS", 0)?);
        let voting_delay_max = Duration::from_millis(parse_var_or(
            "VOTING_DELAY_MAX_MS",
            10 * 24 * 60 * 60 * 1000,
        )?);

        let staging_checks = match dotenv::var("STAGING_CHECKS") {
            Ok(v) => Some(v.parse::<usize>().map_err(|_| Error::Config {
                msg: "STAGING_CHECKS must be an integer".to_string(),
            })?),
            Err(_) => None,
        };

        let core_developers = parse_core_developers(&var_or("CORE_DEVELOPERS", ""))?;

        // An empty CORE_DEVELOPERS is legal (populated from the forge's collaborator list
        // in some deployments); only check the size bound when it's been given inline.
        if !core_developers.is_empty() && sufficient_approvals > core_developers.len() {
            return Err(Error::Config {
                msg: "sufficientApprovals must not exceed the size of coreDevelopers"
                    .to_string(),
            });
        }
        if !core_developers.is_empty() && necessary_approvals > core_developers.len() {
            return Err(Error::Config {
                msg: "necessaryApprovals must not exceed the size of coreDevelopers"
                    .to_string(),
            });
        }

        let approval_url = match dotenv::var("APPROVAL_URL") {
            Ok(v) if !v.trim().is_empty() => Some(v),
            _ => None,
        };

        let request_timeout = Duration::from_secs(parse_var_or("REQUEST_TIMEOUT_SECS", 180)?);

        Ok(Config {
            owner,
            repo,
            github_login,
            github_token,
            webhook_path,
            webhook_secret,
            host,
            port,
            staging_branch,
            dry_run,
            staged_run,
            guarded_run,
            necessary_approvals,
            sufficient_approvals,
            voting_delay_min,
            voting_delay_max,
            staging_checks,
            core_developers,
            approval_url,
            request_timeout,
        })
    }
}

fn require_var(name: &str) -> Result<String> {
    dotenv::var(name).map_err(|_| Error::Config {
        msg: format!("missing required environment variable {}", name),
    })
}

fn var_or(name: &str, default: &str) -> String {
    dotenv::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match dotenv::var(name) {
        Ok(v) => v.parse().map_err(|_| Error::Config {
            msg: format!("{} is not a valid value", name),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool_or(name: &str, default: bool) -> Result<bool> {
    match dotenv::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(Error::Config {
                msg: format!("{} must be a boolean", name),
            }),
        },
        Err(_) => Ok(default),
    }
}

/// Parses the `"login=id,login=id,..."` format from §6.4 into the set of logins; the ids
/// are accepted but not retained, as the core only ever needs logins to evaluate votes.
fn parse_core_developers(raw: &str) -> Result<HashSet<String>> {
    let mut set = HashSet::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let login = entry.split('=').next().unwrap_or(entry).trim();
        if login.is_empty() {
            return Err(Error::Config {
                msg: format!("malformed coreDevelopers entry: {:?}", entry),
            });
        }
        set.insert(login.to_string());
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_developers() {
        let set = parse_core_developers("alice=1,bob=2, carol=3").unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.contains("alice"));
        assert!(set.contains("carol"));
    }

    #[test]
    fn empty_core_developers_is_allowed() {
        assert!(parse_core_developers("").unwrap().is_empty());
    }
}
