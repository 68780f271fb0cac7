//! `ollama.install` reference handler (§4.8). Streams `/api/pull`, tracks
//! progress through layered download frames, then polls for post-install
//! registration — grounded on `ollama_install.py`'s control flow and
//! `app/utils/ollama.py`'s `normalize_server_base`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use crate::jobs::handler::{HandlerError, HandlerResult, HandlerRuntime, JobContext};

/// Strips a trailing `/api/pull` or `/api` suffix so handlers can build
/// `{base}/api/...` URLs regardless of which form the caller supplied.
fn normalize_server_base(url: &str) -> String {
    let mut url = url.trim().trim_end_matches('/').to_string();
    if let Some(stripped) = url.strip_suffix("/api/pull") {
        url = stripped.to_string();
    }
    if let Some(stripped) = url.strip_suffix("/api") {
        url = stripped.to_string();
    }
    url
}

/// One pull-progress frame, reduced to a monotonic overall percent across
/// however many layers Ollama happens to be downloading at once.
pub struct PullSnapshot {
    pub percent: Option<u8>,
    pub stage: String,
    pub message: String,
    pub bucket_changed: bool,
    pub payload: Value,
}

/// Maps Ollama's per-layer `{status, digest, total, completed}` frames into
/// a single `[1, 99)` percent, monotonically non-decreasing, with a bucket
/// (5-point band) used to throttle progress-event emission.
#[derive(Default)]
pub struct PullTracker {
    layers: HashMap<String, (u64, u64)>,
    last_percent: u8,
    last_bucket: u8,
    last_status: String,
}

impl PullTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_frame(&mut self, frame: &Value) -> PullSnapshot {
        let status = frame
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let digest = frame.get("digest").and_then(|v| v.as_str());
        let total = frame.get("total").and_then(|v| v.as_u64());
        let completed = frame.get("completed").and_then(|v| v.as_u64());

        if let (Some(digest), Some(total)) = (digest, total) {
            if total > 0 {
                self.layers
                    .insert(digest.to_string(), (completed.unwrap_or(0), total));
            }
        }

        let percent = if self.layers.is_empty() {
            None
        } else {
            let total_bytes: u64 = self.layers.values().map(|(_, t)| *t).sum();
            let completed_bytes: u64 = self.layers.values().map(|(c, _)| *c).sum();
            let ratio = if total_bytes > 0 {
                completed_bytes as f64 / total_bytes as f64
            } else {
                0.0
            };
            let computed = (1.0 + ratio * 97.0) as u8;
            let monotonic = computed.clamp(1, 98).max(self.last_percent);
            self.last_percent = monotonic;
            Some(monotonic)
        };

        let bucket = percent.map(|p| p / 5).unwrap_or(self.last_bucket);
        let status_changed = status != self.last_status;
        let bucket_changed = match percent {
            Some(_) => bucket != self.last_bucket || status_changed,
            None => status_changed,
        };
        self.last_bucket = bucket;
        self.last_status = status.clone();

        PullSnapshot {
            percent,
            stage: if status.is_empty() {
                "downloading".to_string()
            } else {
                status.clone()
            },
            message: status,
            bucket_changed,
            payload: frame.clone(),
        }
    }
}

/// Exponential-then-extended wait schedule for post-pull registration
/// polling: the server may finish the stream before the model is actually
/// queryable via `/api/show`.
fn registration_wait_schedule() -> Vec<u64> {
    [0u64, 1, 1, 2, 3]
        .into_iter()
        .chain(std::iter::repeat(5).take(6))
        .chain(std::iter::repeat(10).take(6))
        .chain(std::iter::repeat(20).take(3))
        .collect()
}

fn find_model_entry(tags_payload: &Value, identifiers: &HashSet<String>) -> Option<Value> {
    let models = tags_payload.get("models")?.as_array()?;
    for model in models {
        let mut tokens: HashSet<String> = HashSet::new();
        for key in ["name", "model", "digest"] {
            if let Some(v) = model.get(key).and_then(|v| v.as_str()) {
                tokens.insert(v.to_string());
            }
        }
        if let Some(aliases) = model.get("aliases").and_then(|v| v.as_array()) {
            for alias in aliases {
                if let Some(s) = alias.as_str() {
                    tokens.insert(s.to_string());
                } else if let Some(obj) = alias.as_object() {
                    for v in obj.values() {
                        if let Some(s) = v.as_str() {
                            tokens.insert(s.to_string());
                        }
                    }
                }
            }
        }
        let mut expanded = tokens.clone();
        for token in &tokens {
            if let Some((prefix, _)) = token.split_once(':') {
                expanded.insert(prefix.to_string());
            }
        }
        if identifiers.intersection(&expanded).next().is_some() {
            return Some(json!({
                "digest": model.get("digest").cloned().unwrap_or(Value::Null),
                "size": model.get("size").cloned().unwrap_or(Value::Null),
                "modified_at": model.get("modified").or_else(|| model.get("modified_at")).cloned().unwrap_or(Value::Null),
            }));
        }
    }
    None
}

pub struct ModelInstallHandler {
    http: Client,
}

impl ModelInstallHandler {
    pub fn new() -> Self {
        Self {
            http: Client::builder()
                .build()
                .expect("reqwest client build"),
        }
    }

    async fn fetch_show(
        &self,
        server_base: &str,
        api_key: Option<&str>,
        model_name: &str,
    ) -> Result<Option<Value>, HandlerError> {
        let mut req = self
            .http
            .post(format!("{server_base}/api/show"))
            .timeout(Duration::from_secs(30))
            .json(&json!({ "name": model_name }));
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| HandlerError::Failed(format!("Ollama request failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            let payload: Value = response.json().await.unwrap_or(Value::Null);
            return Ok(Some(json!({
                "digest": payload.get("digest").cloned().unwrap_or(Value::Null),
                "size": payload.get("size").cloned().unwrap_or(Value::Null),
                "modified_at": payload.get("modified").or_else(|| payload.get("modified_at")).cloned().unwrap_or(Value::Null),
            })));
        }
        if status.as_u16() == 400 || status.as_u16() == 404 {
            return Ok(None);
        }
        Err(HandlerError::Failed(format!(
            "Ollama /api/show returned HTTP {status}"
        )))
    }

    async fn fetch_tags(&self, server_base: &str, api_key: Option<&str>) -> Option<Value> {
        let mut req = self
            .http
            .get(format!("{server_base}/api/tags"))
            .timeout(Duration::from_secs(30));
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<Value>().await.ok()
    }

    async fn wait_for_model_registration(
        &self,
        ctx: &JobContext,
        server_base: &str,
        api_key: Option<&str>,
        model_name: &str,
        digest: Option<&str>,
    ) -> Result<Value, HandlerError> {
        let canonical = model_name.split(':').next().unwrap_or(model_name).to_string();
        let mut identifiers: HashSet<String> = HashSet::new();
        identifiers.insert(model_name.to_string());
        identifiers.insert(canonical);
        if let Some(digest) = digest {
            identifiers.insert(digest.to_string());
        }

        for delay in registration_wait_schedule() {
            ctx.check_for_cancel()?;
            if delay > 0 {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            ctx.check_for_cancel()?;

            if let Some(entry) = self.fetch_show(server_base, api_key, model_name).await? {
                return Ok(entry);
            }
            if let Some(tags) = self.fetch_tags(server_base, api_key).await {
                if let Some(entry) = find_model_entry(&tags, &identifiers) {
                    return Ok(entry);
                }
            }
        }

        Err(HandlerError::Failed(format!(
            "Model {model_name} not present on Ollama server after install"
        )))
    }
}

impl Default for ModelInstallHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HandlerRuntime for ModelInstallHandler {
    fn job_type(&self) -> &'static str {
        "ollama.install"
    }

    fn validate_payload(&self, payload: &Value) -> Result<(), String> {
        let has_model_name = payload
            .get("model_name")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        if !has_model_name {
            return Err("model_name is required".to_string());
        }
        let has_server_url = payload
            .get("server_url")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        if !has_server_url {
            return Err("server_url is required".to_string());
        }
        Ok(())
    }

    async fn execute(&self, ctx: &JobContext, payload: Value) -> HandlerResult {
        let model_name = payload["model_name"].as_str().unwrap().to_string();
        let server_url = payload["server_url"].as_str().unwrap();
        let api_key = payload.get("api_key").and_then(|v| v.as_str()).map(str::to_string);
        let force_reinstall = payload
            .get("force_reinstall")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let timeout_seconds = payload
            .get("timeout_seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(1800);

        let server_base = normalize_server_base(server_url);
        let pull_url = format!("{server_base}/api/pull");

        ctx.report_progress(
            Some(0),
            Some("queued"),
            Some("Waiting to start download"),
            "progress",
            Some(json!({ "model_name": model_name, "server_url": server_base })),
        )
        .map_err(|e| HandlerError::Failed(e.to_string()))?;
        ctx.check_for_cancel()?;

        let mut req = self
            .http
            .post(&pull_url)
            .timeout(Duration::from_secs(timeout_seconds))
            .json(&json!({
                "name": model_name,
                "stream": true,
                "keep_alive": false,
                "force": force_reinstall,
            }));
        if let Some(key) = &api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| HandlerError::Failed(format!("Ollama request failed: {e}")))?;
        let status = response.status();

        ctx.report_progress(
            None,
            Some("connecting"),
            Some(&format!("Ollama responded with status {status}")),
            "status",
            Some(json!({ "status_code": status.as_u16() })),
        )
        .map_err(|e| HandlerError::Failed(e.to_string()))?;

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandlerError::Failed(if body.is_empty() {
                format!("Ollama returned HTTP {status}")
            } else {
                body
            }));
        }

        ctx.report_progress(
            Some(1),
            Some("downloading"),
            Some("Starting download"),
            "progress",
            Some(json!({ "force_reinstall": force_reinstall, "progress_percent": 1 })),
        )
        .map_err(|e| HandlerError::Failed(e.to_string()))?;

        let mut tracker = PullTracker::new();
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut completion_digest: Option<String> = None;

        'frames: while let Some(chunk) = stream.next().await {
            ctx.check_for_cancel()?;
            let chunk = chunk.map_err(|e| HandlerError::Failed(format!("Ollama request failed: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue;
                }

                let frame: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => {
                        ctx.report_progress(None, None, None, "log", Some(Value::String(line)))
                            .map_err(|e| HandlerError::Failed(e.to_string()))?;
                        continue;
                    }
                };

                if let Some(error) = frame.get("error").and_then(|v| v.as_str()) {
                    return Err(HandlerError::Failed(error.to_string()));
                }

                let snapshot = tracker.process_frame(&frame);
                if snapshot.bucket_changed {
                    ctx.report_progress(
                        snapshot.percent,
                        Some(&snapshot.stage),
                        Some(&snapshot.message),
                        "progress",
                        Some(snapshot.payload.clone()),
                    )
                    .map_err(|e| HandlerError::Failed(e.to_string()))?;
                }

                let status_text = frame
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_lowercase();
                let done = frame.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
                if done || status_text == "success" {
                    completion_digest = frame.get("digest").and_then(|v| v.as_str()).map(str::to_string);
                    break 'frames;
                }
            }
        }

        // Falls through here even if the stream ended without an explicit
        // `done`/`success` frame — the original handler still attempts
        // registration in that case rather than failing outright.
        ctx.report_progress(
            Some(99),
            Some("finalizing"),
            Some("Download completed, finalizing installation"),
            "progress",
            None,
        )
        .map_err(|e| HandlerError::Failed(e.to_string()))?;

        let metadata = self
            .wait_for_model_registration(
                ctx,
                &server_base,
                api_key.as_deref(),
                &model_name,
                completion_digest.as_deref(),
            )
            .await?;

        ctx.report_progress(
            Some(100),
            Some("completed"),
            Some("Model installed successfully"),
            "progress",
            Some(metadata.clone()),
        )
        .map_err(|e| HandlerError::Failed(e.to_string()))?;

        let mut result = json!({
            "model_name": model_name,
            "server_url": server_base,
            "force_reinstall": force_reinstall,
        });
        if let (Value::Object(result_map), Value::Object(meta_map)) = (&mut result, metadata) {
            result_map.extend(meta_map);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_pull_and_api_suffixes() {
        assert_eq!(normalize_server_base("http://host:11434/api/pull"), "http://host:11434");
        assert_eq!(normalize_server_base("http://host:11434/api/"), "http://host:11434");
        assert_eq!(normalize_server_base("http://host:11434/"), "http://host:11434");
    }

    #[test]
    fn pull_tracker_percent_is_monotonic_across_layers() {
        let mut tracker = PullTracker::new();
        let first = tracker.process_frame(&json!({
            "status": "pulling sha256:aaa",
            "digest": "sha256:aaa",
            "total": 100,
            "completed": 50,
        }));
        assert_eq!(first.percent, Some(50));

        let regressed = tracker.process_frame(&json!({
            "status": "pulling sha256:bbb",
            "digest": "sha256:bbb",
            "total": 1000,
            "completed": 0,
        }));
        assert!(regressed.percent.unwrap() >= first.percent.unwrap());
    }

    #[test]
    fn find_model_entry_matches_canonical_name_without_tag() {
        let tags = json!({
            "models": [
                {"name": "llama3:latest", "digest": "sha256:xyz", "size": 123}
            ]
        });
        let mut identifiers = HashSet::new();
        identifiers.insert("llama3".to_string());
        let entry = find_model_entry(&tags, &identifiers).unwrap();
        assert_eq!(entry["digest"], json!("sha256:xyz"));
    }

    #[test]
    fn validate_payload_requires_model_name_and_server_url() {
        let handler = ModelInstallHandler::new();
        assert!(handler.validate_payload(&json!({})).is_err());
        assert!(handler
            .validate_payload(&json!({"model_name": "llama3"}))
            .is_err());
        assert!(handler
            .validate_payload(&json!({"model_name": "llama3", "server_url": "http://h"}))
            .is_ok());
    }
}
