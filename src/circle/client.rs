use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use log::debug;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{CiWaitError, Result};
use crate::git::RemoteUrl;

pub const DEFAULT_BASE_URL: &str = "https://circleci.com/api/v1.1/project";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The build-service operations the wait engine consumes. Implemented by
/// [`CircleClient`] and by mocks in loop tests.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Most recent builds for a branch, newest first.
    async fn recent_builds(&self, branch: &str) -> Result<Vec<super::BuildSummary>>;
    async fn build_detail(&self, build_num: u32) -> Result<super::BuildDetail>;
    /// Raw output of one failed action.
    async fn failure_text(&self, build_num: u32, step: u32, index: u32) -> Result<String>;

    /// Output of every failed action in the build, fetched concurrently.
    async fn failure_texts(&self, detail: &super::BuildDetail) -> Result<Vec<String>> {
        let fetches = detail
            .failures()
            .into_iter()
            .map(|(step, index)| self.failure_text(detail.build_num, step, index));
        try_join_all(fetches).await
    }
}

/// CircleCI v1.1 API client, scoped to one project.
pub struct CircleClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    vcs: &'static str,
    org: String,
    project: String,
}

/// Map a git host to the VCS type segment the API expects.
pub fn vcs_type(host: &str) -> Result<&'static str> {
    if host.contains("github.com") {
        Ok("github")
    } else if host.contains("bitbucket.org") {
        Ok("bitbucket")
    } else {
        Err(CiWaitError::Config(format!(
            "can't find VCS type for unknown host {host}"
        )))
    }
}

impl CircleClient {
    pub fn new(base_url: &str, remote: &RemoteUrl, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ciwait/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CiWaitError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            vcs: vcs_type(&remote.host)?,
            org: remote.org.clone(),
            project: remote.project.clone(),
        })
    }

    fn project_url(&self, rest: &str) -> String {
        let mut url = format!(
            "{}/{}/{}/{}{}",
            self.base_url, self.vcs, self.org, self.project, rest
        );
        if let Some(token) = &self.token {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("circle-token=");
            url.push_str(token);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, rest: &str) -> Result<T> {
        let url = self.project_url(rest);
        debug!("GET {}{rest}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error response".to_string());
            return Err(CiWaitError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }

    async fn post_empty(&self, rest: &str) -> Result<()> {
        let url = self.project_url(rest);
        debug!("POST {}{rest}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error response".to_string());
            return Err(CiWaitError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    /// Cancel a build (POST `/cancel`).
    pub async fn cancel_build(&self, build_num: u32) -> Result<()> {
        self.post_empty(&format!("/{build_num}/cancel")).await
    }

    /// Retry a build (POST `/retry`).
    pub async fn rebuild(&self, build_num: u32) -> Result<()> {
        self.post_empty(&format!("/{build_num}/retry")).await
    }
}

/// One chunk of action output from the output endpoint.
#[derive(Debug, Deserialize)]
struct OutputChunk {
    #[serde(default)]
    message: String,
}

#[async_trait]
impl BuildService for CircleClient {
    async fn recent_builds(&self, branch: &str) -> Result<Vec<super::BuildSummary>> {
        // branch names may contain slashes
        let branch = branch.replace('/', "%2F");
        self.get_json(&format!("/tree/{branch}")).await
    }

    async fn build_detail(&self, build_num: u32) -> Result<super::BuildDetail> {
        self.get_json(&format!("/{build_num}")).await
    }

    async fn failure_text(&self, build_num: u32, step: u32, index: u32) -> Result<String> {
        let chunks: Vec<OutputChunk> = self
            .get_json(&format!("/{build_num}/output/{step}/{index}"))
            .await?;
        let mut message = String::new();
        for chunk in chunks {
            message.push_str(&chunk.message);
            message.push('\n');
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RemoteUrl {
        RemoteUrl {
            host: "github.com".to_string(),
            org: "kevinburke".to_string(),
            project: "go-circle".to_string(),
        }
    }

    #[test]
    fn vcs_type_from_host() {
        assert_eq!(vcs_type("github.com").unwrap(), "github");
        assert_eq!(vcs_type("bitbucket.org").unwrap(), "bitbucket");
        assert!(vcs_type("gitlab.example.com").is_err());
    }

    #[tokio::test]
    async fn recent_builds_hits_tree_endpoint_with_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "GET",
                "/github/kevinburke/go-circle/tree/feature%2Fthing?circle-token=sekrit",
            )
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"build_num": 3, "build_url": "https://circleci.com/gh/kevinburke/go-circle/3",
                     "status": "running", "vcs_revision": "abc123",
                     "queued_at": "2024-05-01T12:00:00Z"}]"#,
            )
            .create_async()
            .await;

        let client =
            CircleClient::new(&server.url(), &remote(), Some("sekrit".to_string())).unwrap();
        let builds = client.recent_builds("feature/thing").await.unwrap();
        mock.assert_async().await;
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].build_num, 3);
        assert!(builds[0].running());
    }

    #[tokio::test]
    async fn api_error_body_is_fatal_not_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/github/kevinburke/go-circle/tree/main")
            .with_status(404)
            .with_body(r#"{"message": "Build not found"}"#)
            .create_async()
            .await;

        let client = CircleClient::new(&server.url(), &remote(), None).unwrap();
        let err = client.recent_builds("main").await.unwrap_err();
        match &err {
            CiWaitError::Api { status, message } => {
                assert_eq!(*status, 404);
                assert!(message.contains("Build not found"));
            }
            other => panic!("expected Api error, got {other}"),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn build_detail_parses_steps() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/github/kevinburke/go-circle/42")
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"build_num": 42, "parallel": 2, "status": "failed", "platform": "2.0",
                    "queued_at": "2024-05-01T12:00:00Z",
                    "stop_time": "2024-05-01T12:05:00Z",
                    "steps": [{"name": "make test", "actions": [
                        {"name": "make test", "index": 0, "step": 101, "failed": true,
                         "run_time_millis": 90000},
                        {"name": "make test", "index": 1, "step": 101, "failed": false,
                         "run_time_millis": 3500}
                    ]}]}"#,
            )
            .create_async()
            .await;

        let client = CircleClient::new(&server.url(), &remote(), None).unwrap();
        let detail = client.build_detail(42).await.unwrap();
        assert_eq!(detail.parallel, 2);
        assert_eq!(detail.steps.len(), 1);
        assert_eq!(detail.failures(), vec![(101, 0)]);
        assert_eq!(detail.elapsed().unwrap(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn failure_texts_concatenates_output_messages() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/github/kevinburke/go-circle/42/output/101/0")
            .with_header("content-type", "application/json")
            .with_body(r#"[{"message": "--- FAIL: TestThing"}, {"message": "FAIL"}]"#)
            .create_async()
            .await;

        let client = CircleClient::new(&server.url(), &remote(), None).unwrap();
        let text = client.failure_text(42, 101, 0).await.unwrap();
        assert_eq!(text, "--- FAIL: TestThing\nFAIL\n");
    }

    #[tokio::test]
    async fn rebuild_posts_to_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/github/kevinburke/go-circle/7/retry")
            .with_body("{}")
            .create_async()
            .await;

        let client = CircleClient::new(&server.url(), &remote(), None).unwrap();
        client.rebuild(7).await.unwrap();
        mock.assert_async().await;
    }
}
