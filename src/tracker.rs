//! Issue and pull-request tracker adapter.
//!
//! Everything here shells out to `gh` (and `git push`) in the project
//! directory. The engine only interprets success or failure plus a few
//! fields of output; the tracker itself stays opaque behind this module.
//!
//! Milestone comments are best-effort: a tracker hiccup is logged and the
//! run keeps going.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

/// Issue reference as given on the command line: `123`, `#123`, or
/// `owner/repo#123`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRef {
    pub repo: Option<String>,
    pub number: u64,
}

impl FromStr for IssueRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (repo, number_part) = match s.split_once('#') {
            Some((repo, rest)) => {
                let repo = repo.trim();
                (
                    if repo.is_empty() {
                        None
                    } else {
                        Some(repo.to_string())
                    },
                    rest,
                )
            }
            None => (None, s),
        };
        if let Some(repo) = &repo {
            if !repo.contains('/') {
                bail!("Invalid issue reference '{s}': expected owner/repo#number");
            }
        }
        let number: u64 = number_part
            .parse()
            .map_err(|_| anyhow!("Invalid issue reference '{s}': '{number_part}' is not a number"))?;
        Ok(Self { repo, number })
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repo {
            Some(repo) => write!(f, "{repo}#{}", self.number),
            None => write!(f, "#{}", self.number),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueInfo {
    pub number: u64,
    pub title: String,
    // gh emits null for issues with no body
    #[serde(default, deserialize_with = "null_to_empty")]
    pub body: String,
    pub url: String,
}

fn null_to_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
}

pub struct Tracker {
    project_dir: PathBuf,
}

impl Tracker {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
        }
    }

    pub async fn fetch_issue(&self, issue: &IssueRef) -> Result<IssueInfo> {
        let number = issue.number.to_string();
        let mut args = vec!["issue", "view", &number, "--json", "number,title,body,url"];
        if let Some(repo) = &issue.repo {
            args.push("--repo");
            args.push(repo);
        }

        let output = tokio::process::Command::new("gh")
            .args(&args)
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run gh issue view")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Failed to fetch issue {issue}: {}", stderr.trim());
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Unexpected gh output for issue {issue}"))
    }

    /// Post a comment on the issue. Failures are logged, never fatal.
    pub async fn comment_issue(&self, issue: &IssueRef, body: &str) {
        let number = issue.number.to_string();
        let mut args = vec!["issue", "comment", &number, "--body", body];
        if let Some(repo) = &issue.repo {
            args.push("--repo");
            args.push(repo);
        }
        if let Err(err) = self.run_gh(&args).await {
            eprintln!("[tracker] issue comment failed (continuing): {err:#}");
        }
    }

    pub async fn push_branch(&self, branch: &str) -> Result<()> {
        let output = tokio::process::Command::new("git")
            .args(["push", "-u", "origin", branch])
            .current_dir(&self.project_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run git push")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Failed to push branch {branch}: {}", stderr.trim());
        }
        Ok(())
    }

    /// Create a PR from `head` into `base`. Returns number and URL.
    pub async fn create_pr(
        &self,
        title: &str,
        body: &str,
        base: &str,
        head: &str,
    ) -> Result<PrInfo> {
        let output = tokio::process::Command::new("gh")
            .args([
                "pr", "create", "--title", title, "--body", body, "--base", base, "--head", head,
            ])
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run gh pr create")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Failed to create PR: {}", stderr.trim());
        }

        let url = String::from_utf8(output.stdout)
            .context("Invalid UTF-8 in gh output")?
            .trim()
            .to_string();
        let number = pr_number_from_url(&url)
            .ok_or_else(|| anyhow!("Could not parse PR number from '{url}'"))?;
        Ok(PrInfo { number, url })
    }

    /// Post a comment on the PR. Failures are logged, never fatal.
    pub async fn comment_pr(&self, number: u64, body: &str) {
        let number = number.to_string();
        if let Err(err) = self
            .run_gh(&["pr", "comment", &number, "--body", body])
            .await
        {
            eprintln!("[tracker] PR comment failed (continuing): {err:#}");
        }
    }

    /// Open a follow-up issue for work this run could not finish.
    /// Returns the new issue's URL.
    pub async fn create_followup_issue(&self, title: &str, body: &str) -> Result<String> {
        let output = tokio::process::Command::new("gh")
            .args(["issue", "create", "--title", title, "--body", body])
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run gh issue create")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Failed to create follow-up issue: {}", stderr.trim());
        }

        Ok(String::from_utf8(output.stdout)
            .context("Invalid UTF-8 in gh output")?
            .trim()
            .to_string())
    }

    async fn run_gh(&self, args: &[&str]) -> Result<()> {
        let output = tokio::process::Command::new("gh")
            .args(args)
            .current_dir(&self.project_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run gh")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gh {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
        }
        Ok(())
    }
}

/// `https://github.com/owner/repo/pull/42` → `42`.
pub fn pr_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|tail| tail.parse().ok())
}
