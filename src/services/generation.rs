use crate::error::{MalformedResponseError, RemoteServiceError};
use crate::schema::{GenerationConfig, Style};

pub const IMAGE_QUALITY_SUFFIX: &str = "high resolution, photorealistic, 8k";
pub const REFERENCE_INSTRUCTION: &str =
    " Use the attached image as a style and composition reference.";

#[derive(Debug, Clone)]
pub struct GeneratedVideo {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// The three remote capabilities the pipeline consumes.
#[async_trait::async_trait]
pub trait GenerationService: Send + Sync {
    /// Break a base prompt into `count` scene prompts. A reply that is not a
    /// JSON array of strings degrades to `[prompt]` instead of failing.
    async fn expand_prompt(
        &self,
        prompt: &str,
        style: Style,
        count: u8,
    ) -> Result<Vec<String>, RemoteServiceError>;

    /// Returns the image as a `data:` URI.
    async fn generate_image(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, RemoteServiceError>;

    /// Runs the long-running video job to completion and downloads the clip.
    /// `source_image` is a `data:` URI; without it the reference image is used.
    async fn generate_video(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        source_image: Option<&str>,
    ) -> Result<GeneratedVideo, RemoteServiceError>;
}

pub fn build_expansion_prompt(base_prompt: &str, style: Style, count: u8) -> String {
    format!(
        "Break down the following visual concept into {count} distinct, highly detailed, and realistic visual scenes.\n\
         Style should be: {style}.\n\
         Base Prompt: {base_prompt}.\n\n\
         Return as a JSON array of strings, each string being a complete image generation prompt."
    )
}

pub fn build_image_prompt(scene_prompt: &str, config: &GenerationConfig) -> String {
    let mut text = format!(
        "{scene_prompt} | Style: {} | {IMAGE_QUALITY_SUFFIX}",
        config.style
    );
    if config.has_reference() {
        text.push_str(REFERENCE_INSTRUCTION);
    }
    text
}

pub fn parse_scene_list(text: &str) -> Result<Vec<String>, MalformedResponseError> {
    serde_json::from_str::<Vec<String>>(text.trim())
        .map_err(|e| MalformedResponseError(format!("{e}; raw: {text}")))
}

/// Scene prompts from an expansion reply, falling back to the base prompt.
pub fn scenes_or_fallback(text: Option<&str>, base_prompt: &str) -> Vec<String> {
    // an empty reply counts as an empty list
    let text = text.unwrap_or("[]");
    match parse_scene_list(text) {
        Ok(scenes) => scenes,
        Err(err) => {
            tracing::warn!(error = %err, "expansion reply unparseable, using base prompt as the only scene");
            vec![base_prompt.to_string()]
        }
    }
}
