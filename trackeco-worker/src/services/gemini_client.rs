//! Gemini inference client
//!
//! Talks to the provider's file-session API: upload the media bytes, poll
//! the file state at a bounded interval until it is ACTIVE, issue one
//! structured-generation call with the evaluation prompt, and delete the
//! remote file in every outcome. The provider is a black box that returns
//! free text expected to contain one JSON object; interpretation happens in
//! `interpreter`.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Inference client errors. Every variant triggers credential rotation;
/// the split exists for logging and for tests.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Quota exhausted for this credential (HTTP 429)
    #[error("Credential quota exhausted")]
    Quota,

    /// Credential rejected (HTTP 401/403)
    #[error("Credential rejected")]
    Auth,

    /// Transport failure or provider 5xx
    #[error("Network error: {0}")]
    Network(String),

    /// Remote file processing failed or timed out
    #[error("Provider processing failed: {0}")]
    Processing(String),

    /// Provider response envelope missing expected fields
    #[error("Malformed provider response: {0}")]
    Envelope(String),
}

impl InferenceError {
    fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            429 => InferenceError::Quota,
            401 | 403 => InferenceError::Auth,
            code if code >= 500 => InferenceError::Network(format!("HTTP {}: {}", code, body)),
            code => InferenceError::Processing(format!("HTTP {}: {}", code, body)),
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        InferenceError::Network(e.to_string())
    }
}

/// Remote file resource as reported by the provider
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResource {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: FileResource,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Gemini API client (one instance per worker, key passed per call)
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    poll_interval: Duration,
    poll_budget: Duration,
}

impl GeminiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        model: String,
        poll_interval_secs: u64,
        poll_budget_secs: u64,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            poll_interval: Duration::from_secs(poll_interval_secs),
            poll_budget: Duration::from_secs(poll_budget_secs),
        }
    }

    /// Full analysis round trip with one credential: upload, poll, generate.
    /// The remote file is deleted best-effort whatever the outcome, so a
    /// failed credential leaves no partial remote state behind.
    pub async fn analyze(
        &self,
        api_key: &str,
        media: Vec<u8>,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, InferenceError> {
        let file = self.upload_file(api_key, media, mime_type).await?;
        info!(file = %file.name, "Uploaded media to provider");

        let outcome = self.generate_once_ready(api_key, &file, mime_type, prompt).await;

        self.delete_file(api_key, &file.name).await;
        outcome
    }

    async fn generate_once_ready(
        &self,
        api_key: &str,
        file: &FileResource,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, InferenceError> {
        let ready = self.poll_until_active(api_key, file).await?;
        self.generate(api_key, &ready.uri, mime_type, prompt).await
    }

    async fn upload_file(
        &self,
        api_key: &str,
        media: Vec<u8>,
        mime_type: &str,
    ) -> Result<FileResource, InferenceError> {
        let url = format!("{}/upload/v1beta/files?key={}", self.base_url, api_key);
        let response = self
            .http
            .post(&url)
            .header("X-Goog-Upload-Protocol", "raw")
            .header("Content-Type", mime_type)
            .body(media)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::from_status(status, body));
        }

        let upload: UploadResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Envelope(format!("upload response: {}", e)))?;
        Ok(upload.file)
    }

    /// Poll the file state until ACTIVE, bounded by the configured budget
    async fn poll_until_active(
        &self,
        api_key: &str,
        file: &FileResource,
    ) -> Result<FileResource, InferenceError> {
        let deadline = Instant::now() + self.poll_budget;
        let mut current = file.clone();

        while current.state == "PROCESSING" || current.state.is_empty() {
            if Instant::now() >= deadline {
                return Err(InferenceError::Processing(format!(
                    "File {} still processing after {:?}",
                    current.name, self.poll_budget
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
            current = self.get_file(api_key, &current.name).await?;
            debug!(file = %current.name, state = %current.state, "Polled file state");
        }

        match current.state.as_str() {
            "ACTIVE" => Ok(current),
            "FAILED" => Err(InferenceError::Processing(format!(
                "Provider failed to process file {}",
                current.name
            ))),
            other => Err(InferenceError::Envelope(format!(
                "Unexpected file state: {}",
                other
            ))),
        }
    }

    async fn get_file(&self, api_key: &str, name: &str) -> Result<FileResource, InferenceError> {
        let url = format!("{}/v1beta/{}?key={}", self.base_url, name, api_key);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::from_status(status, body));
        }
        response
            .json()
            .await
            .map_err(|e| InferenceError::Envelope(format!("file status: {}", e)))
    }

    /// One structured-generation call over the uploaded media
    async fn generate(
        &self,
        api_key: &str,
        file_uri: &str,
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, InferenceError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, api_key
        );
        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "file_data": { "mime_type": mime_type, "file_uri": file_uri } }
                ]
            }]
        });

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::from_status(status, body));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Envelope(format!("generate response: {}", e)))?;

        let text: String = generated
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(InferenceError::Envelope(
                "No text candidate in response".to_string(),
            ));
        }
        Ok(text)
    }

    /// Best-effort cleanup of the remote upload; failures are only logged
    async fn delete_file(&self, api_key: &str, name: &str) {
        let url = format!("{}/v1beta/{}?key={}", self.base_url, name, api_key);
        match self.http.delete(&url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(file = name, "Deleted remote file");
            }
            Ok(response) => {
                warn!(file = name, status = %response.status(), "Remote file delete rejected");
            }
            Err(e) => {
                warn!(file = name, "Remote file delete failed: {}", e);
            }
        }
    }
}

/// Guess the media MIME type from the file extension
pub fn mime_type_for(path: &str) -> &'static str {
    let extension = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match extension.as_str() {
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_classification() {
        assert!(matches!(
            InferenceError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new()),
            InferenceError::Quota
        ));
        assert!(matches!(
            InferenceError::from_status(reqwest::StatusCode::FORBIDDEN, String::new()),
            InferenceError::Auth
        ));
        assert!(matches!(
            InferenceError::from_status(reqwest::StatusCode::BAD_GATEWAY, String::new()),
            InferenceError::Network(_)
        ));
        assert!(matches!(
            InferenceError::from_status(reqwest::StatusCode::BAD_REQUEST, String::new()),
            InferenceError::Processing(_)
        ));
    }

    #[test]
    fn mime_guess_covers_video_and_fallback() {
        assert_eq!(mime_type_for("incoming/clip.MP4"), "video/mp4");
        assert_eq!(mime_type_for("a/b/photo.jpeg"), "image/jpeg");
        assert_eq!(mime_type_for("noextension"), "application/octet-stream");
    }

    #[test]
    fn generate_response_text_extraction() {
        let raw = r#"{
            "candidates": [
                { "content": { "parts": [ { "text": "{\"finalScore\"" }, { "text": ": 5}" } ] } }
            ]
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let text: String = parsed.candidates[0]
            .content
            .as_ref()
            .unwrap()
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        assert_eq!(text, "{\"finalScore\": 5}");
    }
}
