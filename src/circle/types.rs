use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CiWaitError, Result};

/// Closed set of build statuses the API is known to report. Unrecognized
/// strings map to `Unknown` so a new server-side status never crashes the
/// loop; callers fall through to the generic "trying again" branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Fixed,
    Failed,
    Timedout,
    NoTests,
    InfrastructureFail,
    Running,
    NotRunning,
    Queued,
    Scheduled,
    Unknown,
}

impl BuildStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "success" => BuildStatus::Success,
            "fixed" => BuildStatus::Fixed,
            "failed" => BuildStatus::Failed,
            "timedout" => BuildStatus::Timedout,
            "no_tests" => BuildStatus::NoTests,
            "infrastructure_fail" => BuildStatus::InfrastructureFail,
            "running" => BuildStatus::Running,
            "not_running" => BuildStatus::NotRunning,
            "queued" => BuildStatus::Queued,
            "scheduled" => BuildStatus::Scheduled,
            _ => BuildStatus::Unknown,
        }
    }

    pub fn passed(self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Fixed)
    }

    pub fn failed(self) -> bool {
        matches!(
            self,
            BuildStatus::Failed
                | BuildStatus::Timedout
                | BuildStatus::NoTests
                | BuildStatus::InfrastructureFail
        )
    }

    pub fn running(self) -> bool {
        matches!(self, BuildStatus::Running)
    }

    pub fn not_running(self) -> bool {
        matches!(
            self,
            BuildStatus::NotRunning | BuildStatus::Queued | BuildStatus::Scheduled
        )
    }
}

/// One CI run for a branch, as returned by the tree endpoint. Fetched fresh
/// on every poll and superseded by the next poll's copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub build_num: u32,
    pub build_url: String,
    #[serde(rename = "compare", default)]
    pub compare_url: Option<String>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reponame: String,
    #[serde(default)]
    pub username: String,
    pub status: String,
    pub vcs_revision: String,
}

impl BuildSummary {
    pub fn status(&self) -> BuildStatus {
        BuildStatus::parse(&self.status)
    }

    pub fn passed(&self) -> bool {
        self.status().passed()
    }

    pub fn failed(&self) -> bool {
        self.status().failed()
    }

    pub fn running(&self) -> bool {
        self.status().running()
    }

    pub fn not_running(&self) -> bool {
        self.status().not_running()
    }

    /// Best estimate of the time since the CI service found out about this
    /// build. See [`elapsed_from`] for the contract.
    pub fn elapsed(&self) -> Result<Duration> {
        elapsed_from(
            self.queued_at,
            self.usage_queued_at,
            self.stop_time,
            &self.status,
            self,
        )
    }
}

/// Full build record including the per-step timing grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDetail {
    pub build_num: u32,
    #[serde(default = "default_parallel")]
    pub parallel: u32,
    pub status: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_parallel() -> u32 {
    1
}

impl BuildDetail {
    pub fn status(&self) -> BuildStatus {
        BuildStatus::parse(&self.status)
    }

    pub fn elapsed(&self) -> Result<Duration> {
        elapsed_from(
            self.queued_at,
            self.usage_queued_at,
            self.stop_time,
            &self.status,
            self,
        )
    }

    /// `(step, container)` pairs identifying every failed action, in the
    /// shape the output endpoint expects. 2.0 builds address steps by the
    /// action's own step number; 1.0 builds by position.
    pub fn failures(&self) -> Vec<(u32, u32)> {
        let mut failures = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            for (j, action) in step.actions.iter().enumerate() {
                if action.is_failed() {
                    if self.platform == "2.0" {
                        failures.push((action.step, j as u32));
                    } else {
                        failures.push((i as u32, j as u32));
                    }
                }
            }
        }
        failures
    }

    /// The first failed action in step order, if any.
    pub fn first_failed_action(&self) -> Option<&Action> {
        self.steps
            .iter()
            .flat_map(|step| step.actions.iter())
            .find(|action| action.is_failed())
    }
}

/// A named phase of a build, fanned out across parallel containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// One parallel execution unit (container) within a step. `index` is the
/// container slot; indices within a step are non-decreasing and may have
/// gaps, which render as blank cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub step: u32,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub failed: Option<bool>,
    /// Runtime in milliseconds; `None` means the service reported no
    /// runtime (the "unknown" sentinel).
    #[serde(default)]
    pub run_time_millis: Option<u64>,
}

impl Action {
    pub fn is_failed(&self) -> bool {
        self.failed.unwrap_or(false)
    }
}

/// Elapsed-time contract shared by summaries and details: prefer
/// `queued_at`, then `usage_queued_at`, each measured to `stop_time` or now.
/// A build that was never queued reports zero only when its status is
/// explicitly `not_running`; any other missing-timestamp case means the data
/// source violated its documented shape, so the offending record is dumped
/// and reported as a fatal inconsistency instead of being defaulted.
fn elapsed_from<T: Serialize>(
    queued_at: Option<DateTime<Utc>>,
    usage_queued_at: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    status: &str,
    record: &T,
) -> Result<Duration> {
    let since = |from: DateTime<Utc>| {
        let end = stop_time.unwrap_or_else(Utc::now);
        (end - from).to_std().unwrap_or_default()
    };
    if let Some(queued) = queued_at {
        return Ok(since(queued));
    }
    if let Some(queued) = usage_queued_at {
        return Ok(since(queued));
    }
    if BuildStatus::parse(status) == BuildStatus::NotRunning {
        return Ok(Duration::ZERO);
    }
    Err(CiWaitError::DataInconsistency(serde_json::to_string_pretty(
        record,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn summary(status: &str) -> BuildSummary {
        BuildSummary {
            build_num: 42,
            build_url: "https://circleci.com/gh/org/proj/42".to_string(),
            compare_url: None,
            queued_at: None,
            usage_queued_at: None,
            start_time: None,
            stop_time: None,
            reponame: "proj".to_string(),
            username: "org".to_string(),
            status: status.to_string(),
            vcs_revision: "abc123".to_string(),
        }
    }

    #[test]
    fn status_predicates() {
        assert!(summary("success").passed());
        assert!(summary("fixed").passed());
        assert!(summary("failed").failed());
        assert!(summary("infrastructure_fail").failed());
        assert!(summary("running").running());
        assert!(summary("queued").not_running());
        assert!(summary("scheduled").not_running());
        assert!(summary("not_running").not_running());
        assert_eq!(BuildStatus::parse("on_hold"), BuildStatus::Unknown);
    }

    #[test]
    fn elapsed_prefers_queued_at() {
        let mut b = summary("success");
        let now = Utc::now();
        b.queued_at = Some(now - TimeDelta::seconds(90));
        b.usage_queued_at = Some(now - TimeDelta::seconds(10));
        b.stop_time = Some(now);
        assert_eq!(b.elapsed().unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn elapsed_falls_back_to_usage_queued_at() {
        let mut b = summary("success");
        let now = Utc::now();
        b.usage_queued_at = Some(now - TimeDelta::seconds(30));
        b.stop_time = Some(now);
        assert_eq!(b.elapsed().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn elapsed_is_zero_only_for_explicit_not_running() {
        assert_eq!(summary("not_running").elapsed().unwrap(), Duration::ZERO);
    }

    #[test]
    fn elapsed_without_timestamps_is_a_hard_error() {
        let err = summary("running").elapsed().unwrap_err();
        match err {
            CiWaitError::DataInconsistency(dump) => {
                assert!(dump.contains("\"build_num\": 42"), "record dumped: {dump}")
            }
            other => panic!("expected DataInconsistency, got {other}"),
        }
        // queued is not the explicit not_running status, so it aborts too
        assert!(summary("queued").elapsed().is_err());
    }

    #[test]
    fn deserializes_tree_response_with_nulls() {
        let json = r#"[{
            "build_num": 7,
            "build_url": "https://circleci.com/gh/org/proj/7",
            "compare": null,
            "queued_at": null,
            "usage_queued_at": "2024-05-01T12:00:00Z",
            "start_time": null,
            "stop_time": null,
            "reponame": "proj",
            "status": "queued",
            "username": "org",
            "vcs_revision": "1d79f2b877c86ac0964f3fe69a0171926aa6f1d8"
        }]"#;
        let builds: Vec<BuildSummary> = serde_json::from_str(json).unwrap();
        assert_eq!(builds[0].build_num, 7);
        assert!(builds[0].queued_at.is_none());
        assert!(builds[0].usage_queued_at.is_some());
    }

    #[test]
    fn null_runtime_is_the_unknown_sentinel() {
        let json = r#"{
            "name": "npm test",
            "index": 0,
            "step": 3,
            "status": "timedout",
            "failed": null,
            "run_time_millis": null
        }"#;
        let action: Action = serde_json::from_str(json).unwrap();
        assert_eq!(action.run_time_millis, None);
        assert!(!action.is_failed());
    }

    #[test]
    fn failures_use_action_step_on_platform_2() {
        let detail = BuildDetail {
            build_num: 9,
            parallel: 2,
            status: "failed".to_string(),
            platform: "2.0".to_string(),
            queued_at: None,
            usage_queued_at: None,
            start_time: None,
            stop_time: None,
            steps: vec![Step {
                name: "tests".to_string(),
                actions: vec![
                    Action {
                        name: "ok".to_string(),
                        index: 0,
                        step: 103,
                        status: Some("success".to_string()),
                        failed: Some(false),
                        run_time_millis: Some(1000),
                    },
                    Action {
                        name: "bad".to_string(),
                        index: 1,
                        step: 103,
                        status: Some("failed".to_string()),
                        failed: Some(true),
                        run_time_millis: Some(2000),
                    },
                ],
            }],
        };
        assert_eq!(detail.failures(), vec![(103, 1)]);
        assert_eq!(detail.first_failed_action().unwrap().index, 1);
    }
}
