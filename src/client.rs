// HTTP client for the generation server.
// Submit a prompt to /prompt, poll /history/{id} until outputs appear, then fetch images from /view.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};

use crate::{config::ServerConfig, prompt::Prompt};

/// Raised by `wait_for_prompt` when the job has no outputs before the deadline.
#[derive(Debug, Error)]
#[error("timed out after {waited:?} waiting for prompt {prompt_id}")]
pub struct PromptTimeout {
    pub prompt_id: String,
    pub waited: Duration,
}

/// The server refused the prompt (usually a validation error). Not worth retrying.
#[derive(Debug, Error)]
#[error("server rejected prompt with status {status}: {body}")]
pub struct PromptRejected {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
        }
    }
}

/// One produced image, as listed in the job history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_type")]
    pub image_type: String,
}

fn default_image_type() -> String {
    "output".to_string()
}

pub struct ComfyClient {
    base_url: String,
    client_id: String,
    submit_retries: usize,
    http: reqwest::Client,
}

impl ComfyClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client_id: uuid::Uuid::new_v4().to_string(),
            submit_retries: 3,
            http,
        })
    }

    pub fn from_config(server: &ServerConfig) -> Result<Self> {
        Ok(Self::new(&server.base_url, server.request_timeout())?.with_submit_retries(server.submit_retries))
    }

    pub fn with_submit_retries(mut self, retries: usize) -> Self {
        self.submit_retries = retries;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Queues a prompt and returns the server's prompt id.
    pub async fn queue_prompt(&self, prompt: &Prompt) -> Result<String> {
        #[derive(Serialize)]
        struct QueueRequest<'a> {
            prompt: &'a Prompt,
            client_id: &'a str,
        }

        #[derive(Deserialize)]
        struct QueueResponse {
            prompt_id: String,
            #[serde(default)]
            number: Option<u64>,
        }

        let body = &QueueRequest {
            prompt,
            client_id: &self.client_id,
        };
        let retry_strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(2))
            .take(self.submit_retries);
        let text = RetryIf::spawn(
            retry_strategy,
            || async move {
                let response = self
                    .http
                    .post(self.url("/prompt"))
                    .json(body)
                    .send()
                    .await
                    .context("failed to send prompt")?;
                let status = response.status();
                let text = response.text().await.context("failed to read response")?;
                if status.is_client_error() {
                    return Err(anyhow::Error::new(PromptRejected {
                        status: status.as_u16(),
                        body: text,
                    }));
                }
                if !status.is_success() {
                    bail!("server returned {} for /prompt", status);
                }
                Ok::<_, anyhow::Error>(text)
            },
            |e: &anyhow::Error| e.downcast_ref::<PromptRejected>().is_none(),
        )
        .await?;
        trace!("Response: {}", text);

        let parsed: QueueResponse = serde_json::from_str(&text).context("failed to parse response")?;
        info!(
            "Queued prompt {} ({} nodes, queue number {:?})",
            parsed.prompt_id,
            prompt.len(),
            parsed.number
        );
        Ok(parsed.prompt_id)
    }

    pub async fn get_history(&self, prompt_id: &str) -> Result<Value> {
        let history = self
            .http
            .get(self.url(&format!("/history/{}", prompt_id)))
            .send()
            .await
            .context("failed to poll history")?
            .error_for_status()
            .context("history request failed")?
            .json()
            .await
            .context("failed to parse history")?;
        Ok(history)
    }

    /// Polls the history until the job lists outputs, and returns that history.
    pub async fn wait_for_prompt(&self, prompt_id: &str, wait: WaitOptions) -> Result<Value> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < wait.timeout {
            trace!("Polling history");
            let history = self.get_history(prompt_id).await?;
            if has_outputs(&history, prompt_id) {
                debug!("Prompt {} finished after {:?}", prompt_id, start.elapsed());
                return Ok(history);
            }
            if let Some(messages) = execution_error(&history, prompt_id) {
                bail!("prompt {} failed on the server: {}", prompt_id, messages);
            }
            tokio::time::sleep(wait.poll_interval).await;
        }
        Err(PromptTimeout {
            prompt_id: prompt_id.to_owned(),
            waited: start.elapsed(),
        }
        .into())
    }

    pub async fn download_image(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(self.url("/view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.image_type.as_str()),
            ])
            .send()
            .await
            .context("failed to download image")?
            .error_for_status()
            .with_context(|| format!("server refused to serve {}", image.filename))?
            .bytes()
            .await
            .context("failed to read image")?;
        debug!("Downloaded {} ({} bytes)", image.filename, bytes.len());
        Ok(bytes.to_vec())
    }
}

fn has_outputs(history: &Value, prompt_id: &str) -> bool {
    history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .and_then(Value::as_object)
        .map_or(false, |outputs| !outputs.is_empty())
}

// The server marks failed jobs with status_str "error" and never fills in outputs.
fn execution_error(history: &Value, prompt_id: &str) -> Option<String> {
    let status = history.get(prompt_id)?.get("status")?;
    if status.get("status_str")?.as_str()? != "error" {
        return None;
    }
    Some(status.get("messages").map(Value::to_string).unwrap_or_default())
}

/// Every image listed under `history[prompt_id].outputs.*.images`.
pub fn extract_images(history: &Value, prompt_id: &str) -> Vec<ImageRef> {
    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };
    let mut images = Vec::new();
    for (node_id, output) in outputs {
        let Some(listed) = output.get("images").and_then(Value::as_array) else {
            continue;
        };
        for image in listed {
            match serde_json::from_value::<ImageRef>(image.clone()) {
                Ok(image) => images.push(image),
                Err(e) => warn!("Skipping malformed image entry from node {}: {}", node_id, e),
            }
        }
    }
    images
}

#[cfg(test)]
mod tests {
    use mockito::{mock, Matcher};
    use serde_json::json;

    use super::*;

    fn history() -> Value {
        json!({
            "abc": {
                "outputs": {
                    "9": {"images": [
                        {"filename": "fox_00001_.png", "subfolder": "", "type": "output"},
                        {"filename": "fox_00002_.png"},
                    ]},
                    "12": {"text": ["not an image"]},
                },
                "status": {"status_str": "success", "completed": true},
            }
        })
    }

    #[test]
    fn test_extract_images() {
        let images = extract_images(&history(), "abc");
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].filename, "fox_00002_.png");
        assert_eq!(images[1].subfolder, "");
        assert_eq!(images[1].image_type, "output");
        assert!(extract_images(&history(), "other").is_empty());
        assert!(has_outputs(&history(), "abc"));
        assert!(!has_outputs(&json!({}), "abc"));
    }

    #[test]
    fn test_execution_error() {
        let failed = json!({"abc": {"outputs": {}, "status": {"status_str": "error", "messages": []}}});
        assert_eq!(execution_error(&failed, "abc"), Some("[]".to_string()));
        assert_eq!(execution_error(&history(), "abc"), None);
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let client = ComfyClient::new("http://localhost:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
        assert_eq!(client.url("/prompt"), "http://localhost:8000/prompt");
        assert_eq!(client.client_id().len(), 36);
    }

    fn client() -> ComfyClient {
        ComfyClient::new(&mockito::server_url(), Duration::from_secs(5)).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_submit_wait_download() {
        let submit_mock = mock("POST", "/prompt")
            .match_body(Matcher::PartialJson(json!({"prompt": {"9": {"class_type": "SaveImage"}}})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"prompt_id": "abc", "number": 3, "node_errors": {}}"#)
            .create();
        let history_mock = mock("GET", "/history/abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(history().to_string())
            .create();
        let view_mock = mock("GET", "/view")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("filename".into(), "fox_00001_.png".into()),
                Matcher::UrlEncoded("subfolder".into(), "".into()),
                Matcher::UrlEncoded("type".into(), "output".into()),
            ]))
            .with_status(200)
            .with_body("PNGDATA")
            .create();

        let client = client();
        let prompt: Prompt =
            serde_json::from_str(r#"{"9": {"inputs": {"filename_prefix": "fox"}, "class_type": "SaveImage"}}"#)
                .unwrap();
        let prompt_id = client.queue_prompt(&prompt).await.unwrap();
        assert_eq!(prompt_id, "abc");
        let history = client.wait_for_prompt(&prompt_id, WaitOptions::default()).await.unwrap();
        let images = extract_images(&history, &prompt_id);
        let data = client.download_image(&images[0]).await.unwrap();
        assert_eq!(data, b"PNGDATA");

        submit_mock.assert();
        history_mock.assert();
        view_mock.assert();
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_times_out() {
        let _history_mock = mock("GET", "/history/slow")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create();
        let wait = WaitOptions {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
        };
        let err = client().wait_for_prompt("slow", wait).await.unwrap_err();
        let timeout = err.downcast_ref::<PromptTimeout>().unwrap();
        assert_eq!(timeout.prompt_id, "slow");
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_stops_on_execution_error() {
        let history_mock = mock("GET", "/history/broken")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"broken": {"outputs": {}, "status": {"status_str": "error", "messages": []}}}).to_string(),
            )
            .expect(1)
            .create();
        let err = client().wait_for_prompt("broken", WaitOptions::default()).await.unwrap_err();
        assert!(err.downcast_ref::<PromptTimeout>().is_none());
        history_mock.assert();
    }

    #[test_log::test(tokio::test)]
    async fn test_rejected_prompt_is_not_retried() {
        let submit_mock = mock("POST", "/prompt")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": {"type": "prompt_no_outputs"}}"#)
            .expect(1)
            .create();
        let client = client().with_submit_retries(3);
        let err = client.queue_prompt(&Prompt::new()).await.unwrap_err();
        let rejected = err.downcast_ref::<PromptRejected>().unwrap();
        assert_eq!(rejected.status, 400);
        submit_mock.assert();
    }

    #[test_log::test(tokio::test)]
    async fn test_server_errors_are_retried() {
        let submit_mock = mock("POST", "/prompt").with_status(500).expect(2).create();
        let client = client().with_submit_retries(1);
        let err = client.queue_prompt(&Prompt::new()).await.unwrap_err();
        assert!(err.downcast_ref::<PromptRejected>().is_none());
        submit_mock.assert();
    }
}
