//! A tagged identifier used by event handlers to reference a PR without having resolved it
//! to a concrete number yet (§2 "PrIdentity", §4.6 EventDecoder).

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrIdentity {
    PrNum(i64),
    /// A head-commit SHA, carrying the commit message so a PR number can be recovered by
    /// parsing if no other mapping resolves it (§4.4 step 5).
    Sha {
        sha: String,
        commit_message: Option<String>,
    },
    /// A branch name, same rationale as `Sha`.
    Branch {
        branch: String,
        commit_message: Option<String>,
    },
}

impl PrIdentity {
    pub fn pr_num(n: i64) -> Self {
        PrIdentity::PrNum(n)
    }

    pub fn sha(sha: impl Into<String>, commit_message: Option<String>) -> Self {
        PrIdentity::Sha {
            sha: sha.into(),
            commit_message,
        }
    }

    pub fn branch(branch: impl Into<String>, commit_message: Option<String>) -> Self {
        PrIdentity::Branch {
            branch: branch.into(),
            commit_message,
        }
    }
}
