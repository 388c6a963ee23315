use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::RemoteServiceError;
use crate::schema::{GenerationConfig, Style};
use crate::services::generation::{
    GeneratedVideo, GenerationService, build_expansion_prompt, build_image_prompt,
    scenes_or_fallback,
};
use crate::services::media::split_data_uri;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_TEXT_MODEL: &str = "gemini-3-flash-preview";
const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
const DEFAULT_VIDEO_MODEL: &str = "veo-3.1-fast-generate-preview";
const DEFAULT_POLL_SECS: u64 = 8;
const DEFAULT_VIDEO_TIMEOUT_SECS: u64 = 600;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const VIDEO_RESOLUTION: &str = "720p";

#[derive(Debug, Clone)]
pub struct GeminiClientConfig {
    pub api_key: String,
    pub api_base: String,
    pub text_model: String,
    pub image_model: String,
    pub video_model: String,
    pub poll_interval: Duration,
    pub video_timeout: Duration,
}

impl GeminiClientConfig {
    pub fn from_env() -> Self {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("API_KEY"))
            .unwrap_or_default();
        let env_or = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        let secs_or = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            api_key,
            api_base: env_or("GEMINI_API_BASE", DEFAULT_API_BASE),
            text_model: env_or("GEMINI_TEXT_MODEL", DEFAULT_TEXT_MODEL),
            image_model: env_or("GEMINI_IMAGE_MODEL", DEFAULT_IMAGE_MODEL),
            video_model: env_or("GEMINI_VIDEO_MODEL", DEFAULT_VIDEO_MODEL),
            poll_interval: Duration::from_secs(secs_or(
                "DREAMSCENE_VIDEO_POLL_SECS",
                DEFAULT_POLL_SECS,
            )),
            video_timeout: Duration::from_secs(secs_or(
                "DREAMSCENE_VIDEO_TIMEOUT_SECS",
                DEFAULT_VIDEO_TIMEOUT_SECS,
            )),
        }
    }
}

pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiClientConfig,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

#[derive(Deserialize)]
struct VideoOperation {
    #[serde(default)]
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<OperationError>,
    response: Option<VideoOperationResponse>,
}

#[derive(Deserialize)]
struct OperationError {
    code: Option<u16>,
    message: Option<String>,
    status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoOperationResponse {
    generate_video_response: Option<GenerateVideoResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateVideoResponse {
    #[serde(default)]
    generated_samples: Vec<GeneratedSample>,
}

#[derive(Deserialize)]
struct GeneratedSample {
    video: Option<VideoRef>,
}

#[derive(Deserialize)]
struct VideoRef {
    uri: Option<String>,
}

impl GeminiClient {
    pub fn new(config: GeminiClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn has_credential(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            self.config.api_base.trim_end_matches('/'),
            model,
            method
        )
    }

    fn api_key(&self) -> Result<&str, RemoteServiceError> {
        let key = self.config.api_key.trim();
        if key.is_empty() {
            return Err(RemoteServiceError::MissingCredential);
        }
        Ok(key)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, RemoteServiceError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key()?)
            .json(body)
            .send()
            .await?;
        read_json(response).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, RemoteServiceError> {
        let response = self
            .client
            .get(url)
            .header("x-goog-api-key", self.api_key()?)
            .send()
            .await?;
        read_json(response).await
    }

    async fn poll_operation(
        &self,
        mut operation: VideoOperation,
    ) -> Result<VideoOperation, RemoteServiceError> {
        let url = format!(
            "{}/v1beta/{}",
            self.config.api_base.trim_end_matches('/'),
            operation.name
        );
        let mut polls = 0u32;
        while !operation.done {
            tokio::time::sleep(self.config.poll_interval).await;
            polls += 1;
            operation = self.get_json(&url).await?;
            tracing::debug!(polls, done = operation.done, "gemini: polled video operation");
        }
        Ok(operation)
    }

    async fn download_video(&self, uri: &str) -> Result<GeneratedVideo, RemoteServiceError> {
        let key = self.api_key()?;
        let response = self
            .client
            .get(uri)
            .query(&[("key", key)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteServiceError::from_api_reply(status, &body));
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("video/"))
            .unwrap_or("video/mp4")
            .to_string();
        let bytes = response.bytes().await?.to_vec();
        Ok(GeneratedVideo { mime_type, bytes })
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteServiceError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(RemoteServiceError::from_api_reply(status, &body));
    }
    serde_json::from_str(&body).map_err(|e| {
        RemoteServiceError::InvalidResponse(format!("failed to parse Gemini response: {e}"))
    })
}

fn expansion_request_body(base_prompt: &str, style: Style, count: u8) -> serde_json::Value {
    json!({
        "contents": [{
            "parts": [{ "text": build_expansion_prompt(base_prompt, style, count) }]
        }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": {
                "type": "ARRAY",
                "items": { "type": "STRING" }
            }
        }
    })
}

fn image_request_body(scene_prompt: &str, config: &GenerationConfig) -> serde_json::Value {
    let mut parts = Vec::new();
    if let Some(reference) = &config.reference_image {
        parts.push(json!({
            "inlineData": {
                "mimeType": reference.mime_type.as_str(),
                "data": reference.base64(),
            }
        }));
    }
    parts.push(json!({ "text": build_image_prompt(scene_prompt, config) }));

    json!({
        "contents": [{ "parts": parts }],
        "generationConfig": {
            "imageConfig": { "aspectRatio": config.aspect_ratio.as_str() }
        }
    })
}

/// Generated image first, then the reference image, then text only.
fn video_request_body(
    scene_prompt: &str,
    config: &GenerationConfig,
    source_image: Option<&str>,
) -> serde_json::Value {
    let mut instance = json!({ "prompt": scene_prompt });
    let image = source_image
        .and_then(split_data_uri)
        .map(|(mime, data)| (mime.to_string(), data.to_string()))
        .or_else(|| {
            config
                .reference_image
                .as_ref()
                .map(|r| (r.mime_type.clone(), r.base64()))
        });
    if let Some((mime_type, data)) = image {
        instance["image"] = json!({
            "bytesBase64Encoded": data,
            "mimeType": mime_type,
        });
    }

    json!({
        "instances": [instance],
        "parameters": {
            "aspectRatio": config.aspect_ratio.as_str(),
            "resolution": VIDEO_RESOLUTION,
            "sampleCount": 1,
        }
    })
}

fn first_text(response: &GenerateContentResponse) -> Option<String> {
    let parts = &response.candidates.first()?.content.as_ref()?.parts;
    let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
    if text.trim().is_empty() { None } else { Some(text) }
}

fn first_inline_image(response: &GenerateContentResponse) -> Option<String> {
    let parts = &response.candidates.first()?.content.as_ref()?.parts;
    parts.iter().find_map(|part| {
        let inline = part.inline_data.as_ref()?;
        let mime = inline.mime_type.as_deref().unwrap_or("image/png");
        Some(format!("data:{mime};base64,{}", inline.data))
    })
}

fn operation_video_uri(operation: VideoOperation) -> Result<String, RemoteServiceError> {
    if let Some(err) = operation.error {
        let message = err.message.unwrap_or_else(|| "video operation failed".to_string());
        if err.status.as_deref() == Some("NOT_FOUND") || err.code == Some(404) {
            return Err(RemoteServiceError::EntityNotFound(message));
        }
        return Err(RemoteServiceError::Api {
            status: err.code.unwrap_or(500),
            message,
        });
    }
    operation
        .response
        .and_then(|r| r.generate_video_response)
        .and_then(|r| r.generated_samples.into_iter().next())
        .and_then(|s| s.video)
        .and_then(|v| v.uri)
        .filter(|uri| !uri.is_empty())
        .ok_or(RemoteServiceError::NoVideoUri)
}

#[async_trait::async_trait]
impl GenerationService for GeminiClient {
    async fn expand_prompt(
        &self,
        prompt: &str,
        style: Style,
        count: u8,
    ) -> Result<Vec<String>, RemoteServiceError> {
        let url = self.model_url(&self.config.text_model, "generateContent");
        let response: GenerateContentResponse = self
            .post_json(&url, &expansion_request_body(prompt, style, count))
            .await?;
        let scenes = scenes_or_fallback(first_text(&response).as_deref(), prompt);
        tracing::info!(requested = count, received = scenes.len(), "gemini: prompt expanded");
        Ok(scenes)
    }

    async fn generate_image(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, RemoteServiceError> {
        let url = self.model_url(&self.config.image_model, "generateContent");
        let response: GenerateContentResponse = self
            .post_json(&url, &image_request_body(prompt, config))
            .await?;
        first_inline_image(&response).ok_or(RemoteServiceError::NoImageData)
    }

    async fn generate_video(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        source_image: Option<&str>,
    ) -> Result<GeneratedVideo, RemoteServiceError> {
        let url = self.model_url(&self.config.video_model, "predictLongRunning");
        let operation: VideoOperation = self
            .post_json(&url, &video_request_body(prompt, config, source_image))
            .await?;
        tracing::info!(operation = %operation.name, "gemini: video operation started");

        let timeout = self.config.video_timeout;
        let operation = tokio::time::timeout(timeout, self.poll_operation(operation))
            .await
            .map_err(|_| RemoteServiceError::TimedOut(timeout.as_secs()))??;

        let uri = operation_video_uri(operation)?;
        let video = self.download_video(&uri).await?;
        tracing::info!(bytes = video.bytes.len(), "gemini: video downloaded");
        Ok(video)
    }
}
