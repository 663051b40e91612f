//! Source control adapter.
//!
//! The wait engine only needs a handful of git operations, so we keep a
//! small, explicit wrapper around `git` subprocess calls. Every call carries
//! a bounded deadline so a hung command never blocks the loop.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;
use url::Url;

use crate::error::{CiWaitError, Result};

const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);
const FETCH_DEADLINE: Duration = Duration::from_secs(60);
const REBASE_DEADLINE: Duration = Duration::from_secs(30);
const PUSH_DEADLINE: Duration = Duration::from_secs(30);

/// Where a git remote points, split into the pieces the CI API needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    pub host: String,
    pub org: String,
    pub project: String,
}

/// Length of the shorter of two commit hashes, so a short hash can be
/// compared against a full one.
pub fn shorter_hash_len(a: &str, b: &str) -> usize {
    a.len().min(b.len())
}

/// Parse a git remote URL in scp-like (`git@host:org/repo.git`), ssh://,
/// https:// or git:// form.
pub fn parse_remote_url(raw: &str) -> Result<RemoteUrl> {
    let raw = raw.trim();
    if !raw.contains("://") {
        // scp-like syntax has no scheme
        if let Some((user_host, path)) = raw.split_once(':') {
            let host = user_host.rsplit('@').next().unwrap_or(user_host);
            return split_org_project(host, path);
        }
        return Err(CiWaitError::Config(format!(
            "unrecognized remote URL: {raw}"
        )));
    }
    let url = Url::parse(raw)
        .map_err(|e| CiWaitError::Config(format!("invalid remote URL {raw}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| CiWaitError::Config(format!("remote URL {raw} has no host")))?;
    split_org_project(host, url.path())
}

fn split_org_project(host: &str, path: &str) -> Result<RemoteUrl> {
    let path = path.trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let (org, project) = path.split_once('/').ok_or_else(|| {
        CiWaitError::Config(format!("remote path {path:?} is not in org/project form"))
    })?;
    Ok(RemoteUrl {
        host: host.to_string(),
        org: org.to_string(),
        project: project.to_string(),
    })
}

/// The git operations the wait engine consumes. Implemented by [`GitRepo`]
/// for real repositories and by mocks in loop tests.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn current_branch(&self) -> Result<String>;
    async fn tip(&self, branch: &str) -> Result<String>;
    async fn remote_url(&self, remote: &str) -> Result<RemoteUrl>;
    async fn fetch(&self, remote: &str) -> Result<()>;
    async fn show_ref(&self, reference: &str) -> Result<String>;
    async fn merge_base(&self, reference: &str, branch: &str) -> Result<String>;
    /// Rebase `branch` onto `onto_ref`. On failure the rebase is aborted so
    /// the repository is left in a clean state.
    async fn rebase(&self, onto_ref: &str, branch: &str) -> Result<()>;
    /// Push `branch` to `remote` with `--force-with-lease`.
    async fn force_push(&self, remote: &str, branch: &str) -> Result<()>;
}

/// Executes git commands in a working directory (or the process cwd).
#[derive(Debug, Clone, Default)]
pub struct GitRepo {
    workdir: Option<PathBuf>,
}

impl GitRepo {
    pub fn new() -> Self {
        Self { workdir: None }
    }

    pub fn at(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: Some(workdir.into()),
        }
    }

    async fn run(&self, args: &[&str], deadline: Duration) -> Result<String> {
        debug!("git {}", args.join(" "));
        let mut cmd = Command::new("git");
        cmd.args(args).kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let output = match tokio::time::timeout(deadline, cmd.output()).await {
            Ok(out) => out?,
            Err(_) => {
                return Err(CiWaitError::Git {
                    context: args.join(" "),
                    output: format!("timed out after {}s", deadline.as_secs()),
                })
            }
        };
        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(CiWaitError::Git {
                context: args.join(" "),
                output: text.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SourceControl for GitRepo {
    async fn current_branch(&self) -> Result<String> {
        let out = self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"], DEFAULT_DEADLINE)
            .await?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Err(CiWaitError::Config(
                "detached HEAD; pass a branch explicitly".to_string(),
            ));
        }
        Ok(name)
    }

    async fn tip(&self, branch: &str) -> Result<String> {
        let out = self.run(&["rev-parse", branch], DEFAULT_DEADLINE).await?;
        Ok(out.trim().to_string())
    }

    async fn remote_url(&self, remote: &str) -> Result<RemoteUrl> {
        let out = self
            .run(&["remote", "get-url", remote], DEFAULT_DEADLINE)
            .await?;
        parse_remote_url(out.trim())
    }

    async fn fetch(&self, remote: &str) -> Result<()> {
        self.run(&["fetch", remote], FETCH_DEADLINE).await?;
        Ok(())
    }

    async fn show_ref(&self, reference: &str) -> Result<String> {
        let out = self
            .run(&["show-ref", "--hash", reference], DEFAULT_DEADLINE)
            .await?;
        Ok(out.trim().to_string())
    }

    async fn merge_base(&self, reference: &str, branch: &str) -> Result<String> {
        let out = self
            .run(&["merge-base", reference, branch], DEFAULT_DEADLINE)
            .await?;
        Ok(out.trim().to_string())
    }

    async fn rebase(&self, onto_ref: &str, branch: &str) -> Result<()> {
        if let Err(err) = self.run(&["rebase", onto_ref, branch], REBASE_DEADLINE).await {
            // leave the tree usable before reporting the failure
            match self.run(&["rebase", "--abort"], DEFAULT_DEADLINE).await {
                Ok(_) => warn!("rebase onto {onto_ref} failed, aborted cleanly"),
                Err(abort_err) => {
                    warn!("rebase onto {onto_ref} failed and the abort also failed: {abort_err}")
                }
            }
            return Err(err);
        }
        Ok(())
    }

    async fn force_push(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("{branch}:{branch}");
        self.run(
            &["push", "--force-with-lease", remote, &refspec],
            PUSH_DEADLINE,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorter_hash_len_matches_shortest_side() {
        assert_eq!(
            shorter_hash_len("1d79f2b877c86ac0964f3fe69a0171926aa6f1d8", "1d79f2b87"),
            9
        );
        assert_eq!(
            shorter_hash_len("1d79f2b877c86ac0964f3fe69a0171926aa6f1d8", "1d79f2b"),
            7
        );
        assert_eq!(shorter_hash_len("1d79f", "1d79f2b87"), 5);
    }

    #[test]
    fn parses_scp_like_remote() {
        let remote = parse_remote_url("git@github.com:kevinburke/go-circle.git").unwrap();
        assert_eq!(
            remote,
            RemoteUrl {
                host: "github.com".to_string(),
                org: "kevinburke".to_string(),
                project: "go-circle".to_string(),
            }
        );
    }

    #[test]
    fn parses_https_remote() {
        let remote = parse_remote_url("https://github.com/kevinburke/go-circle.git").unwrap();
        assert_eq!(remote.host, "github.com");
        assert_eq!(remote.org, "kevinburke");
        assert_eq!(remote.project, "go-circle");
    }

    #[test]
    fn parses_ssh_scheme_remote_without_git_suffix() {
        let remote = parse_remote_url("ssh://git@bitbucket.org/team/repo").unwrap();
        assert_eq!(remote.host, "bitbucket.org");
        assert_eq!(remote.org, "team");
        assert_eq!(remote.project, "repo");
    }

    #[test]
    fn rejects_remote_without_project_path() {
        assert!(parse_remote_url("https://github.com/justorg").is_err());
        assert!(parse_remote_url("not-a-remote").is_err());
    }

    #[tokio::test]
    async fn tip_and_current_branch_in_fixture_repo() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::at(dir.path());
        let setup = |args: &[&str]| {
            let mut cmd = std::process::Command::new("git");
            cmd.args(args).current_dir(dir.path());
            assert!(cmd.status().unwrap().success(), "git {args:?}");
        };
        setup(&["init", "-q", "-b", "main"]);
        setup(&["config", "user.email", "test@example.com"]);
        setup(&["config", "user.name", "test"]);
        setup(&["commit", "-q", "--allow-empty", "-m", "first"]);

        assert_eq!(repo.current_branch().await.unwrap(), "main");
        let tip = repo.tip("main").await.unwrap();
        assert_eq!(tip.len(), 40);
        assert_eq!(repo.merge_base("main", "main").await.unwrap(), tip);
    }
}
