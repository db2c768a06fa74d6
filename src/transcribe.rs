//! HTTP client for the whisper server's `/inference` endpoint.
//!
//! Uploads are `multipart/form-data` with the audio under the `file`
//! field. The server reports failures in two shapes: a non-success
//! HTTP status, or an `error` field in an otherwise successful JSON
//! body. Both become [`TranscribeError`]s; an empty transcription is a
//! valid result (silence is not an error).

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transcription output format requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Json,
    Text,
    Srt,
    Vtt,
    VerboseJson,
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseFormat::Json => "json",
            ResponseFormat::Text => "text",
            ResponseFormat::Srt => "srt",
            ResponseFormat::Vtt => "vtt",
            ResponseFormat::VerboseJson => "verbose_json",
        }
    }
}

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("cannot connect to whisper server at {url}; is it running?")]
    Connect { url: String },
    #[error("whisper server timeout; transcription took too long or the server is unresponsive")]
    Timeout,
    #[error("transcription endpoint not found; check the server URL: {url}")]
    EndpointNotFound { url: String },
    #[error("whisper server rejected the request as unauthorized")]
    Unauthorized,
    #[error("whisper server error: {0}")]
    Backend(String),
    #[error("transcription request failed with HTTP {0}")]
    Status(StatusCode),
    #[error("failed to read audio file {}: {source}", .path.display())]
    ReadAudio {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("transcription request failed: {0}")]
    Request(#[source] reqwest::Error),
}

/// Client for one whisper server.
pub struct TranscriptionClient {
    base_url: String,
    language: Option<String>,
    timeout: Duration,
    http: Client,
}

impl TranscriptionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            language: None,
            timeout: DEFAULT_TIMEOUT,
            http: Client::new(),
        }
    }

    /// Pins the transcription language instead of letting the server
    /// fall back to its own configuration.
    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Uploads `audio` and returns the whitespace-normalized
    /// transcription.
    pub async fn transcribe(
        &self,
        audio: &Path,
        format: ResponseFormat,
    ) -> Result<String, TranscribeError> {
        let bytes = tokio::fs::read(audio)
            .await
            .map_err(|source| TranscribeError::ReadAudio {
                path: audio.to_path_buf(),
                source,
            })?;
        debug!(
            "Uploading {} bytes from {} for transcription",
            bytes.len(),
            audio.display()
        );

        let part = Part::bytes(bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(TranscribeError::Request)?;
        let mut form = Form::new()
            .part("file", part)
            .text("response_format", format.as_str());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let url = format!("{}/inference", self.base_url);
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(TranscribeError::EndpointNotFound { url }),
            StatusCode::UNAUTHORIZED => return Err(TranscribeError::Unauthorized),
            status if !status.is_success() => return Err(TranscribeError::Status(status)),
            _ => {}
        }

        let body = response.text().await.map_err(TranscribeError::Request)?;
        parse_transcription(&body)
    }

    fn classify(&self, err: reqwest::Error) -> TranscribeError {
        if err.is_timeout() {
            TranscribeError::Timeout
        } else if err.is_connect() {
            TranscribeError::Connect {
                url: self.base_url.clone(),
            }
        } else {
            TranscribeError::Request(err)
        }
    }
}

/// Extracts the transcription from a response body. JSON objects carry
/// either an `error` field (failure, even under HTTP 200) or a `text`
/// field; anything else is taken as plain text output.
fn parse_transcription(body: &str) -> Result<String, TranscribeError> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(object) = value.as_object() {
            if let Some(error) = object.get("error") {
                let message = error
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Err(TranscribeError::Backend(message));
            }
            let text = object.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            return Ok(normalize_text(text));
        }
    }
    Ok(normalize_text(body))
}

/// Collapses all whitespace runs (spaces, newlines, tabs) to single
/// spaces and trims the ends.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
