use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use console::Term;
use log::info;

use crate::cancel::CancelToken;
use crate::circle::{BuildService, BuildSummary, CircleClient};
use crate::config::Config;
use crate::git::{GitRepo, RemoteUrl, SourceControl};
use crate::notify;
use crate::wait::{self, WaitOptions, WaitOutcome};

#[derive(Parser)]
#[command(name = "ciwait")]
#[command(author, version, about = "Wait for CI builds on a branch", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// CI API token; falls back to the config file
    #[arg(short, long, global = true, env = "CIRCLE_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for the latest build on a branch to finish
    Wait {
        /// Git remote to poll and push to
        #[arg(short, long)]
        remote: Option<String>,

        /// Continually rebase onto this remote branch while waiting
        #[arg(long)]
        rebase: Option<String>,

        /// Branch to wait on (defaults to the current branch)
        branch: Option<String>,
    },
    /// Open the latest build on a branch in the browser
    Open { branch: Option<String> },
    /// Cancel the latest build on a branch
    Cancel { branch: Option<String> },
    /// Retry the latest build on a branch
    Rebuild { branch: Option<String> },
}

impl Cli {
    pub async fn execute(&self, cancel: CancelToken) -> Result<()> {
        let config = Config::load()?;
        match &self.command {
            Commands::Wait {
                remote,
                rebase,
                branch,
            } => {
                let remote = remote.as_deref().unwrap_or(&config.remote);
                self.execute_wait(&config, remote, rebase.clone(), branch.clone(), cancel)
                    .await
            }
            Commands::Open { branch } => self.execute_open(&config, branch.clone()).await,
            Commands::Cancel { branch } => self.execute_cancel(&config, branch.clone()).await,
            Commands::Rebuild { branch } => self.execute_rebuild(&config, branch.clone()).await,
        }
    }

    fn api_token(&self, config: &Config) -> Option<String> {
        self.token.clone().or_else(|| config.token.clone())
    }

    async fn execute_wait(
        &self,
        config: &Config,
        remote_name: &str,
        rebase: Option<String>,
        branch: Option<String>,
        cancel: CancelToken,
    ) -> Result<()> {
        let repo = GitRepo::new();
        let (client, branch, remote) =
            session(&repo, config, self.api_token(config), remote_name, branch).await?;
        info!("waiting on {}/{} branch {branch}", remote.org, remote.project);

        let opts = WaitOptions {
            branch: branch.clone(),
            remote: remote_name.to_string(),
            rebase_onto: rebase,
            project: remote.project.clone(),
            interactive: Term::stdout().is_term(),
            cost_fn: wait::flat_rate_cost(config.cost_per_minute),
        };
        let outcome = wait::wait(Arc::new(client), Arc::new(repo), opts, cancel).await?;
        match outcome {
            WaitOutcome::Success { .. } | WaitOutcome::Cancelled => Ok(()),
            WaitOutcome::Failure { .. } => bail!("Build on {branch} failed"),
        }
    }

    async fn execute_open(&self, config: &Config, branch: Option<String>) -> Result<()> {
        let repo = GitRepo::new();
        let (client, branch, _remote) =
            session(&repo, config, self.api_token(config), &config.remote, branch).await?;
        let latest = latest_build(&client, &branch).await?;
        if !latest.not_running() {
            // deep-link straight to the first failed action when there is one
            if let Ok(detail) = client.build_detail(latest.build_num).await {
                if let Some(action) = detail.first_failed_action() {
                    let url = format!("{}#tests/containers/{}", latest.build_url, action.index);
                    notify::open_in_browser(&url)?;
                    return Ok(());
                }
            }
        }
        notify::open_in_browser(&latest.build_url)?;
        Ok(())
    }

    async fn execute_cancel(&self, config: &Config, branch: Option<String>) -> Result<()> {
        let repo = GitRepo::new();
        let (client, branch, _remote) =
            session(&repo, config, self.api_token(config), &config.remote, branch).await?;
        let latest = latest_build(&client, &branch).await?;
        client.cancel_build(latest.build_num).await?;
        println!("Cancelled build {} on {branch}", latest.build_num);
        Ok(())
    }

    async fn execute_rebuild(&self, config: &Config, branch: Option<String>) -> Result<()> {
        let repo = GitRepo::new();
        let (client, branch, _remote) =
            session(&repo, config, self.api_token(config), &config.remote, branch).await?;
        let latest = latest_build(&client, &branch).await?;
        client.rebuild(latest.build_num).await?;
        println!("Requested rebuild of build {} on {branch}", latest.build_num);
        Ok(())
    }
}

/// Resolve the branch (defaulting to HEAD) and build an API client for the
/// repository's remote. Shared by every subcommand.
async fn session(
    repo: &GitRepo,
    config: &Config,
    token: Option<String>,
    remote_name: &str,
    branch: Option<String>,
) -> Result<(CircleClient, String, RemoteUrl)> {
    let branch = match branch {
        Some(branch) => branch,
        None => repo.current_branch().await?,
    };
    let remote = repo.remote_url(remote_name).await?;
    let client = CircleClient::new(&config.base_url, &remote, token)?;
    Ok((client, branch, remote))
}

async fn latest_build(client: &CircleClient, branch: &str) -> Result<BuildSummary> {
    let builds = client.recent_builds(branch).await?;
    match builds.into_iter().next() {
        Some(latest) => Ok(latest),
        None => bail!("no recent builds for {branch}; are you sure this branch runs tests?"),
    }
}
