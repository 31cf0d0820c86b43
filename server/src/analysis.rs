use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Which collaborator handles a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            MediaKind::Image
        } else {
            MediaKind::Video
        }
    }
}

/// Payload returned by an `/explain` endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub frames: Option<i64>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub lime_image: Option<String>,
    #[serde(default)]
    pub explanation: Option<serde_json::Value>,
}

/// Client for the external image and video explain services
#[derive(Clone)]
pub struct AnalysisClient {
    http: reqwest::Client,
    image_url: Option<String>,
    video_url: Option<String>,
}

impl AnalysisClient {
    pub fn new(
        image_url: Option<String>,
        video_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            image_url,
            video_url,
        })
    }

    pub fn endpoint(&self, kind: MediaKind) -> ApiResult<String> {
        let (base, name) = match kind {
            MediaKind::Image => (self.image_url.as_deref(), "image"),
            MediaKind::Video => (self.video_url.as_deref(), "video"),
        };
        let base = base
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ApiError::Unavailable(format!("The {name} analysis service is not configured")))?;
        Ok(format!("{}/explain", base.trim_end_matches('/')))
    }

    /// Forward one file to the matching `/explain` endpoint.
    pub async fn explain(
        &self,
        file_name: &str,
        mime: &str,
        data: Vec<u8>,
    ) -> ApiResult<Explanation> {
        let kind = MediaKind::from_mime(mime);
        let url = self.endpoint(kind)?;

        let part = Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| ApiError::BadRequest(format!("Invalid content type: {e}")))?;
        let form = Form::new().part("file", part);

        tracing::info!(%url, ?kind, "Forwarding file to analysis service");
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Upstream(format!("{url} answered {status}")));
        }

        let mut explanation: Explanation = response
            .json()
            .await
            .map_err(|e| ApiError::Upstream(format!("{url}: invalid payload: {e}")))?;
        explanation.label = explanation.label.trim().to_ascii_uppercase();
        Ok(explanation)
    }
}
