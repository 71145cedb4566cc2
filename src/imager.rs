//! Image asset generation against an async-job diffusion endpoint.
//!
//! The contract is submit / poll / download. Polling is a bounded busy-wait:
//! fixed interval, fixed maximum wait, degrading to a failed outcome rather
//! than an error if the upstream job never completes.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::time::{Duration, sleep};

use crate::error::AIError;

pub const IMAGES_SUBDIR: &str = "imgs";

pub fn clue_image_name(chapter: usize, clue_index: usize) -> String {
    format!("clue-ch{chapter}-{clue_index}.png")
}

pub fn character_image_name(name: &str) -> String {
    format!("{name}.png")
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded { url: String },
    Failed { reason: String },
}

/// Narrow seam to the diffusion service, fakeable in tests.
#[allow(async_fn_in_trait)]
pub trait ImageBackend {
    async fn submit(&self, prompt: &str, size: &str) -> Result<String, AIError>;
    async fn poll(&self, job_id: &str) -> Result<JobStatus, AIError>;
    async fn download(&self, url: &str) -> Result<Vec<u8>, AIError>;
}

/// Poll pacing. Injected so tests can use sub-second budgets.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(120),
        }
    }
}

/// The recorded result of one asset generation attempt. Kept in the
/// orchestrator's registries and in the manifest; never an Err.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageOutcome {
    pub success: bool,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub loaded_from_disk: bool,
}

impl ImageOutcome {
    pub fn failed(filename: &str, error: String) -> Self {
        Self {
            success: false,
            filename: filename.to_string(),
            local_path: None,
            error: Some(error),
            loaded_from_disk: false,
        }
    }

    pub fn from_disk(filename: &str, local_path: PathBuf) -> Self {
        Self {
            success: true,
            filename: filename.to_string(),
            local_path: Some(local_path),
            error: None,
            loaded_from_disk: true,
        }
    }
}

/// Drives one prompt through submit → poll → download and writes the bytes
/// to `imgs_dir/filename`. Every failure mode becomes a failed outcome.
pub async fn generate_and_save<I: ImageBackend>(
    backend: &I,
    prompt: &str,
    size: &str,
    imgs_dir: &Path,
    filename: &str,
    policy: PollPolicy,
) -> ImageOutcome {
    let job_id = match backend.submit(prompt, size).await {
        Ok(id) => id,
        Err(e) => return ImageOutcome::failed(filename, format!("submit failed: {e}")),
    };

    let mut waited = Duration::ZERO;
    let url = loop {
        match backend.poll(&job_id).await {
            Ok(JobStatus::Succeeded { url }) => break url,
            Ok(JobStatus::Failed { reason }) => {
                return ImageOutcome::failed(filename, format!("job failed: {reason}"));
            }
            Ok(JobStatus::Pending) | Ok(JobStatus::Running) => {}
            Err(e) => return ImageOutcome::failed(filename, format!("poll failed: {e}")),
        }
        if waited >= policy.max_wait {
            return ImageOutcome::failed(filename, "job timed out".to_string());
        }
        sleep(policy.interval).await;
        waited += policy.interval;
    };

    let bytes = match backend.download(&url).await {
        Ok(bytes) => bytes,
        Err(e) => return ImageOutcome::failed(filename, format!("download failed: {e}")),
    };

    let local_path = imgs_dir.join(filename);
    if let Err(e) = std::fs::create_dir_all(imgs_dir) {
        return ImageOutcome::failed(filename, format!("cannot create image dir: {e}"));
    }
    if let Err(e) = std::fs::write(&local_path, bytes) {
        return ImageOutcome::failed(filename, format!("cannot write image: {e}"));
    }

    ImageOutcome {
        success: true,
        filename: filename.to_string(),
        local_path: Some(local_path),
        error: None,
        loaded_from_disk: false,
    }
}

/// Client for a DashScope-style asynchronous text-to-image API.
#[derive(Clone)]
pub struct ImageJobClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ImageJobClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    output: SubmitOutput,
}

#[derive(Deserialize)]
struct SubmitOutput {
    task_id: String,
}

#[derive(Deserialize)]
struct TaskResponse {
    output: TaskOutput,
}

#[derive(Deserialize)]
struct TaskOutput {
    task_status: String,
    #[serde(default)]
    results: Vec<TaskResult>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct TaskResult {
    #[serde(default)]
    url: Option<String>,
}

impl ImageBackend for ImageJobClient {
    async fn submit(&self, prompt: &str, size: &str) -> Result<String, AIError> {
        let body = json!({
            "model": self.model,
            "input": { "prompt": prompt },
            "parameters": { "size": size, "n": 1 },
        });
        let response = self
            .http
            .post(format!(
                "{}/services/aigc/text2image/image-synthesis",
                self.base_url
            ))
            .bearer_auth(&self.api_key)
            .header("X-DashScope-Async", "enable")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AIError::Upstream(text));
        }

        let submitted: SubmitResponse = response.json().await?;
        Ok(submitted.output.task_id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobStatus, AIError> {
        let response = self
            .http
            .get(format!("{}/tasks/{job_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AIError::Upstream(text));
        }

        let task: TaskResponse = response.json().await?;
        let status = match task.output.task_status.as_str() {
            "PENDING" => JobStatus::Pending,
            "RUNNING" => JobStatus::Running,
            "SUCCEEDED" => {
                let url = task
                    .output
                    .results
                    .into_iter()
                    .find_map(|r| r.url)
                    .ok_or(AIError::NoMessageFound)?;
                JobStatus::Succeeded { url }
            }
            other => JobStatus::Failed {
                reason: task
                    .output
                    .message
                    .unwrap_or_else(|| format!("status {other}")),
            },
        };
        Ok(status)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, AIError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AIError::Upstream(format!(
                "download status {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Backend used when image generation is disabled; every submit fails fast.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullImageBackend;

impl ImageBackend for NullImageBackend {
    async fn submit(&self, _prompt: &str, _size: &str) -> Result<String, AIError> {
        Err(AIError::Unavailable("image generation disabled".into()))
    }

    async fn poll(&self, _job_id: &str) -> Result<JobStatus, AIError> {
        Err(AIError::Unavailable("image generation disabled".into()))
    }

    async fn download(&self, _url: &str) -> Result<Vec<u8>, AIError> {
        Err(AIError::Unavailable("image generation disabled".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubBackend {
        statuses: Mutex<Vec<JobStatus>>,
    }

    impl StubBackend {
        fn new(statuses: Vec<JobStatus>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
            }
        }
    }

    impl ImageBackend for StubBackend {
        async fn submit(&self, _prompt: &str, _size: &str) -> Result<String, AIError> {
            Ok("job-1".to_string())
        }

        async fn poll(&self, _job_id: &str) -> Result<JobStatus, AIError> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                Ok(statuses[0].clone())
            }
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>, AIError> {
            assert_eq!(url, "http://img/1.png");
            Ok(vec![0x89, 0x50, 0x4e, 0x47])
        }
    }

    fn quick_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_wait: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn generate_writes_file_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StubBackend::new(vec![
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded {
                url: "http://img/1.png".to_string(),
            },
        ]);
        let outcome = generate_and_save(
            &backend,
            "a knife",
            "1024*1024",
            dir.path(),
            &clue_image_name(1, 1),
            quick_policy(),
        )
        .await;
        assert!(outcome.success);
        let path = outcome.local_path.unwrap();
        assert!(path.ends_with("clue-ch1-1.png"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn generate_times_out_as_failed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StubBackend::new(vec![JobStatus::Running]);
        let outcome = generate_and_save(
            &backend,
            "a knife",
            "1024*1024",
            dir.path(),
            "x.png",
            quick_policy(),
        )
        .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn generate_reports_job_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StubBackend::new(vec![JobStatus::Failed {
            reason: "nsfw filter".to_string(),
        }]);
        let outcome = generate_and_save(
            &backend,
            "a knife",
            "1024*1024",
            dir.path(),
            "x.png",
            quick_policy(),
        )
        .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("nsfw filter"));
    }

    #[tokio::test]
    async fn null_backend_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = generate_and_save(
            &NullImageBackend,
            "a knife",
            "1024*1024",
            dir.path(),
            "x.png",
            quick_policy(),
        )
        .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("disabled"));
    }

    #[test]
    fn deterministic_asset_names() {
        assert_eq!(clue_image_name(2, 3), "clue-ch2-3.png");
        assert_eq!(character_image_name("Alice"), "Alice.png");
    }
}
