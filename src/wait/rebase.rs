//! Background detection of upstream movement.
//!
//! While a wait session runs, a watcher task periodically checks whether the
//! configured upstream branch has commits the local branch lacks, and stages
//! the upstream commit hash for the loop to consume. The watcher never
//! rebases anything itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::git::SourceControl;

const WATCH_PERIOD: Duration = Duration::from_secs(10);
const CHECK_DEADLINE: Duration = Duration::from_secs(60);

/// Single-slot cell holding the pending upstream commit. Written only by the
/// watcher task; read and cleared only by the wait loop.
#[derive(Debug, Default)]
pub struct RebaseState {
    pending: Mutex<Option<String>>,
}

impl RebaseState {
    fn store(&self, commit: String) {
        *self.pending.lock().unwrap() = Some(commit);
    }

    pub fn pending(&self) -> Option<String> {
        self.pending.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        *self.pending.lock().unwrap() = None;
    }
}

/// Handle to the spawned watcher task. Dropping it stops the task, so a loop
/// restart fully replaces the previous watcher.
pub struct RebaseWatcher {
    state: Arc<RebaseState>,
    ready: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl RebaseWatcher {
    pub fn spawn(
        repo: Arc<dyn SourceControl>,
        branch: String,
        remote: String,
        onto: String,
        cancel: CancelToken,
    ) -> Self {
        let state = Arc::new(RebaseState::default());
        let (ready_tx, ready_rx) = watch::channel(false);
        let task_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                let check = tokio::time::timeout(
                    CHECK_DEADLINE,
                    unmerged_upstream_commit(repo.as_ref(), &branch, &remote, &onto),
                );
                match check.await {
                    Ok(Ok(Some(commit))) => {
                        debug!("upstream {remote}/{onto} moved to {commit}");
                        task_state.store(commit);
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(err)) => debug!("rebase check failed: {err}"),
                    Err(_) => debug!("rebase check timed out"),
                }
                let _ = ready_tx.send(true);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(WATCH_PERIOD) => {}
                }
            }
        });
        Self {
            state,
            ready: ready_rx,
            handle,
        }
    }

    /// Blocks until the watcher's first check has completed, so the first
    /// rebase-dependent decision never sees a false negative.
    pub async fn ready(&self) {
        let mut rx = self.ready.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn state(&self) -> &RebaseState {
        &self.state
    }
}

impl Drop for RebaseWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Report the upstream ref's commit when it has moved past the merge base
/// with `branch`, meaning upstream has commits the local branch should be
/// rebased onto.
async fn unmerged_upstream_commit(
    repo: &dyn SourceControl,
    branch: &str,
    remote: &str,
    onto: &str,
) -> Result<Option<String>> {
    let remote_ref = format!("{remote}/{onto}");
    repo.fetch(remote).await?;
    let commit = repo.show_ref(&remote_ref).await?;
    let merge_base = repo.merge_base(&remote_ref, branch).await?;
    Ok((commit != merge_base).then_some(commit))
}
