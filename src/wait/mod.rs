//! The wait engine: poll the latest build on a branch until it finishes,
//! repainting step statistics as it runs, and keep the branch rebased on a
//! moving upstream target when one is configured.

mod rebase;

pub use rebase::{RebaseState, RebaseWatcher};

use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::circle::{BuildDetail, BuildService, BuildSummary};
use crate::error::{CiWaitError, Result};
use crate::git::{shorter_hash_len, SourceControl};
use crate::notify::{self, Notifier};
use crate::output::{self, format_elapsed};

const STARTUP_GRACE: Duration = Duration::from_secs(1);
const POLL_DELAY: Duration = Duration::from_secs(3);
const LIVE_TICK: Duration = Duration::from_millis(200);
const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(2);
const PUSH_GRACE: Duration = Duration::from_secs(7);
const MISMATCH_GRACE: Duration = Duration::from_secs(5);
const RESTART_DELAY: Duration = Duration::from_secs(7);
const STATUS_THROTTLE: Duration = Duration::from_secs(12);
const FAILURE_TEXT_DEADLINE: Duration = Duration::from_secs(20);

/// Estimates the money spent on a build, in cents, from its elapsed time.
pub type CostFn = Arc<dyn Fn(Duration) -> u64 + Send + Sync>;

/// Flat per-container-minute pricing.
pub fn flat_rate_cost(cents_per_minute: f64) -> CostFn {
    Arc::new(move |elapsed| (elapsed.as_secs_f64() / 60.0 * cents_per_minute).round() as u64)
}

/// Tunables for one wait invocation.
pub struct WaitOptions {
    pub branch: String,
    pub remote: String,
    /// Remote branch to continually rebase onto while waiting, if any.
    pub rebase_onto: Option<String>,
    /// Project name, used for notifications.
    pub project: String,
    /// Whether stdout is an interactive terminal (enables in-place redraw
    /// and color).
    pub interactive: bool,
    pub cost_fn: CostFn,
}

/// How one wait session ended.
#[derive(Debug)]
pub enum WaitOutcome {
    Success {
        elapsed: Duration,
    },
    Failure {
        elapsed: Duration,
        failure_texts: Vec<String>,
        build_url: String,
    },
    Cancelled,
}

/// Wait for the latest build on `opts.branch` to finish. When an automatic
/// rebase moves the local tip, the inner loop is restarted from scratch
/// (fresh tip, fresh watcher) after a short delay; every other exit
/// propagates immediately.
pub async fn wait(
    service: Arc<dyn BuildService>,
    repo: Arc<dyn SourceControl>,
    opts: WaitOptions,
    cancel: CancelToken,
) -> Result<WaitOutcome> {
    loop {
        match wait_once(service.as_ref(), &repo, &opts, &cancel).await {
            Err(CiWaitError::RemoteChanged) => {
                if cancel.sleep(RESTART_DELAY).await.is_err() {
                    return Ok(WaitOutcome::Cancelled);
                }
            }
            Err(err) if err.is_cancellation() => return Ok(WaitOutcome::Cancelled),
            other => return other,
        }
    }
}

async fn wait_once(
    service: &dyn BuildService,
    repo: &Arc<dyn SourceControl>,
    opts: &WaitOptions,
    cancel: &CancelToken,
) -> Result<WaitOutcome> {
    let _cursor = opts.interactive.then(output::CursorGuard::hide);
    let tip = repo.tip(&opts.branch).await?;
    let watcher = opts.rebase_onto.clone().map(|onto| {
        RebaseWatcher::spawn(
            Arc::clone(repo),
            opts.branch.clone(),
            opts.remote.clone(),
            onto,
            cancel.clone(),
        )
    });
    let mut session = WaitSession {
        service,
        repo,
        opts,
        cancel,
        notifier: Notifier::new(format!("{} (ciwait)", opts.project)),
        watcher,
        tip,
        lines_drawn: 0,
        last_printed_at: None,
        opened_failed_build: false,
    };
    session.run().await
}

struct WaitSession<'a> {
    service: &'a dyn BuildService,
    repo: &'a Arc<dyn SourceControl>,
    opts: &'a WaitOptions,
    cancel: &'a CancelToken,
    notifier: Notifier,
    watcher: Option<RebaseWatcher>,
    /// Local tip; truncated in place once short-vs-full hash lengths are
    /// known, like the build revisions it is compared against.
    tip: String,
    lines_drawn: usize,
    last_printed_at: Option<Instant>,
    /// Set after the first successful browser open of a failed action, so
    /// later polls never reopen it. Reset only by a loop restart.
    opened_failed_build: bool,
}

impl WaitSession<'_> {
    async fn run(&mut self) -> Result<WaitOutcome> {
        println!(
            "Waiting for latest build on {} to complete",
            self.opts.branch
        );
        // give the CI service a moment to register a fresh push
        self.cancel.sleep(STARTUP_GRACE).await?;
        loop {
            let builds = match self.cancel.guard(self.service.recent_builds(&self.opts.branch)).await
            {
                Ok(builds) => builds,
                Err(err) if err.is_retryable() => {
                    println!("Caught network error: {err}. Continuing");
                    self.last_printed_at = Some(Instant::now());
                    self.cancel.sleep(NETWORK_RETRY_DELAY).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let Some(latest) = builds.into_iter().next() else {
                return Err(CiWaitError::NoBuilds {
                    branch: self.opts.branch.clone(),
                });
            };
            self.notifier.set_open_url(&latest.build_url);

            if !self.tip_matches(&latest) {
                self.handle_tip_mismatch(&latest).await?;
                continue;
            }

            let status = latest.status();
            if status.passed() {
                return self.finish_success(&latest).await;
            }
            if status.failed() {
                return self.finish_failure(&latest).await;
            }
            if status.running() {
                self.poll_running(&latest).await?;
            } else if status.not_running() {
                self.poll_queued(&latest).await?;
            } else {
                println!("Status is {}, trying again", latest.status);
                self.last_printed_at = Some(Instant::now());
            }

            self.apply_pending_rebase().await?;
            self.sleep_between_polls(&latest).await?;
        }
    }

    /// Compare the build's recorded commit against the local tip, truncating
    /// both to the shorter length so short hashes match full ones.
    fn tip_matches(&mut self, latest: &BuildSummary) -> bool {
        let n = shorter_hash_len(&latest.vcs_revision, &self.tip);
        self.tip.truncate(n);
        latest.vcs_revision[..n] == self.tip[..]
    }

    async fn handle_tip_mismatch(&mut self, latest: &BuildSummary) -> Result<()> {
        let n = self.tip.len();
        let build_rev = &latest.vcs_revision[..n.min(latest.vcs_revision.len())];
        if self.opts.rebase_onto.is_some() {
            if let Err(err) = self
                .repo
                .force_push(&self.opts.remote, &self.opts.branch)
                .await
            {
                println!(
                    "CI built commit {build_rev} which does not match local commit {}.\n\n\
                     We attempted a force push to {}/{} to trigger a build, but it failed:\n\n{err}",
                    self.tip, self.opts.remote, self.opts.branch
                );
                self.notifier.display("force push failed");
                return Err(err);
            }
            println!(
                "Force pushed local commit {} to {}/{} to trigger new build...",
                self.tip, self.opts.remote, self.opts.branch
            );
            // the shortest build we have seen took 20 seconds, so there is
            // time to spare before the new build can possibly finish
            self.cancel.sleep(PUSH_GRACE).await
        } else {
            println!(
                "Latest build is for {build_rev}, waiting for {}...",
                self.tip
            );
            self.last_printed_at = Some(Instant::now());
            self.cancel.sleep(MISMATCH_GRACE).await
        }
    }

    async fn finish_success(&mut self, latest: &BuildSummary) -> Result<WaitOutcome> {
        let elapsed = latest.elapsed()?;
        self.first_rebase_check().await?;
        self.apply_pending_rebase().await?;
        match self
            .cancel
            .guard(self.service.build_detail(latest.build_num))
            .await
        {
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => println!("error getting build statistics: {err}"),
            Ok(detail) => self.render_final_statistics(&detail)?,
        }
        println!(
            "\nBuild on {} succeeded!\n\nTests on {} took {}. Quitting.",
            self.opts.branch,
            self.opts.branch,
            format_elapsed(elapsed)
        );
        self.notifier
            .display(&format!("{} build complete!", self.opts.branch));
        Ok(WaitOutcome::Success { elapsed })
    }

    async fn finish_failure(&mut self, latest: &BuildSummary) -> Result<WaitOutcome> {
        let elapsed = latest.elapsed()?;
        self.first_rebase_check().await?;
        self.apply_pending_rebase().await?;
        let detail = match self
            .cancel
            .guard(self.service.build_detail(latest.build_num))
            .await
        {
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                println!("error getting build stats: {err}");
                return Err(err);
            }
            Ok(detail) => detail,
        };
        self.render_final_statistics(&detail)?;
        // failure texts are a diagnostic nicety; errors here are downgraded
        let failure_texts = match tokio::time::timeout(
            FAILURE_TEXT_DEADLINE,
            self.service.failure_texts(&detail),
        )
        .await
        {
            Ok(Ok(texts)) => texts,
            Ok(Err(err)) => {
                warn!("error getting build failures: {err}");
                Vec::new()
            }
            Err(_) => {
                warn!("timed out fetching build failures");
                Vec::new()
            }
        };
        println!("\nOutput from failed builds:\n");
        for text in &failure_texts {
            println!("{text}");
        }
        println!("\nURL: {}", latest.build_url);
        self.notifier.display("build failed");
        Ok(WaitOutcome::Failure {
            elapsed,
            failure_texts,
            build_url: latest.build_url.clone(),
        })
    }

    /// One poll while the build is running: redraw statistics (or print a
    /// status line when non-interactive), and open the first failed action
    /// in the browser, once.
    async fn poll_running(&mut self, latest: &BuildSummary) -> Result<()> {
        let detail = match self
            .cancel
            .guard(self.service.build_detail(latest.build_num))
            .await
        {
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                // keep polling; the next fetch usually succeeds
                println!("Caught network error: {err}. Continuing");
                self.lines_drawn += 1;
                return Ok(());
            }
            Ok(detail) => detail,
        };
        if self.opts.interactive {
            let stats = output::statistics(&detail, true)?;
            self.lines_drawn = output::draw(&mut stdout(), &stats, self.lines_drawn);
        } else {
            println!(
                "Build {} running ({} elapsed)",
                latest.build_num,
                format_elapsed(latest.elapsed()?)
            );
            self.lines_drawn += 1;
        }
        if !self.opened_failed_build {
            self.first_rebase_check().await?;
            self.apply_pending_rebase().await?;
            if let Some(action) = detail.first_failed_action() {
                let url = format!("{}#tests/containers/{}", latest.build_url, action.index);
                if notify::open_in_browser(&url).is_ok() {
                    self.opened_failed_build = true;
                }
            }
        }
        Ok(())
    }

    /// One poll while the build is queued or scheduled: print a cost/time
    /// status line, throttled.
    async fn poll_queued(&mut self, latest: &BuildSummary) -> Result<()> {
        self.first_rebase_check().await?;
        self.apply_pending_rebase().await?;
        let elapsed = latest.elapsed()?;
        let cents = (self.opts.cost_fn)(elapsed);
        let throttled = self
            .last_printed_at
            .is_some_and(|at| at.elapsed() < STATUS_THROTTLE);
        if !throttled {
            println!(
                "Status is {} (queued for {}, cost ${}.{:02}), trying again",
                latest.status,
                format_elapsed(elapsed),
                cents / 100,
                cents % 100
            );
            self.last_printed_at = Some(Instant::now());
        }
        Ok(())
    }

    /// The base inter-poll delay, interruptible by cancellation, with a
    /// 200ms tick that keeps the elapsed-time line fresh while the build is
    /// running without paying for a full redraw.
    async fn sleep_between_polls(&mut self, latest: &BuildSummary) -> Result<()> {
        let sleep = tokio::time::sleep(POLL_DELAY);
        tokio::pin!(sleep);
        let mut live = tokio::time::interval_at(Instant::now() + LIVE_TICK, LIVE_TICK);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CiWaitError::Cancelled),
                _ = &mut sleep => return Ok(()),
                _ = live.tick() => {
                    if latest.running() && self.opts.interactive {
                        let mut out = stdout();
                        output::clear_lines(&mut out, 2);
                        println!(
                            "Build {} running... {} elapsed\n",
                            latest.build_num,
                            format_elapsed(latest.elapsed()?)
                        );
                    }
                }
            }
        }
    }

    /// Overwrite the last in-place draw with final timings, or print the
    /// table once when non-interactive.
    fn render_final_statistics(&mut self, detail: &BuildDetail) -> Result<()> {
        if self.opts.interactive {
            let stats = output::statistics(detail, true)?;
            self.lines_drawn = output::draw(&mut stdout(), &stats, self.lines_drawn);
            output::clear_lines(&mut stdout(), 1);
        } else {
            print!("{}", output::statistics(detail, false)?);
        }
        Ok(())
    }

    /// Block for the watcher's first tick so rebase-dependent decisions
    /// never race it. No-op when no rebase target is configured.
    async fn first_rebase_check(&self) -> Result<()> {
        if let Some(watcher) = &self.watcher {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CiWaitError::Cancelled),
                _ = watcher.ready() => {}
            }
        }
        Ok(())
    }

    /// Apply a pending rebase staged by the watcher, if any: rebase the
    /// local branch onto the remote tracking ref, force-push, and signal the
    /// outer wrapper to restart the loop since the local tip has changed.
    async fn apply_pending_rebase(&mut self) -> Result<()> {
        let Some(watcher) = &self.watcher else {
            return Ok(());
        };
        if watcher.state().pending().is_none() {
            return Ok(());
        }
        // watcher only exists when a rebase target is configured
        let onto = self.opts.rebase_onto.as_deref().unwrap_or_default();
        let remote_ref = format!("{}/{}", self.opts.remote, onto);
        println!(
            "Remote branch {remote_ref} has changed, rebasing {} on top of it",
            self.opts.branch
        );
        if let Err(err) = self.repo.rebase(&remote_ref, &self.opts.branch).await {
            println!(
                "Remote branch {remote_ref} changed, and automatic rebase failed.\n\n\
                 Rebase output was:\n\n{err}"
            );
            self.notifier.display("rebase failed");
            return Err(err);
        }
        if let Err(err) = self
            .repo
            .force_push(&self.opts.remote, &self.opts.branch)
            .await
        {
            println!(
                "Remote branch {remote_ref} changed, we performed a local rebase but push \
                 failed.\n\nPush output was:\n\n{err}"
            );
            self.notifier.display("push after rebase failed");
            return Err(err);
        }
        watcher.state().clear();
        Err(CiWaitError::RemoteChanged)
    }
}
