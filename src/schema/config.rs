use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::InvalidConfig;

pub const MIN_SCENES: u8 = 1;
pub const MAX_SCENES: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[default]
    #[serde(rename = "16:9")]
    Widescreen,
    #[serde(rename = "9:16")]
    Vertical,
    #[serde(rename = "4:3")]
    Standard,
    #[serde(rename = "3:4")]
    StandardPortrait,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Widescreen => "16:9",
            Self::Vertical => "9:16",
            Self::Standard => "4:3",
            Self::StandardPortrait => "3:4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Style {
    #[default]
    Realistic,
    Cinematic,
    Photographic,
    Fantasy,
    Cyberpunk,
    Anime,
    Minimalist,
}

impl Style {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realistic => "Realistic",
            Self::Cinematic => "Cinematic",
            Self::Photographic => "Photographic",
            Self::Fantasy => "Fantasy",
            Self::Cyberpunk => "Cyberpunk",
            Self::Anime => "Anime",
            Self::Minimalist => "Minimalist",
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stages every job of a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GenerationMode {
    #[default]
    #[serde(rename = "photo")]
    ImageOnly,
    #[serde(rename = "video")]
    VideoOnly,
    #[serde(rename = "both")]
    ImageThenVideo,
}

impl GenerationMode {
    pub fn needs_image(&self) -> bool {
        matches!(self, Self::ImageOnly | Self::ImageThenVideo)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImageOnly => "photo",
            Self::VideoOnly => "video",
            Self::ImageThenVideo => "both",
        }
    }
}

/// Image attached to a run to guide style and composition.
///
/// On the wire `data` is base64, optionally wrapped in a `data:` URI.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub mime_type: String,
    #[serde(serialize_with = "encode_bytes", deserialize_with = "decode_bytes")]
    pub data: Vec<u8>,
}

impl ReferenceImage {
    pub fn base64(&self) -> String {
        BASE64.encode(&self.data)
    }
}

impl fmt::Debug for ReferenceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceImage")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

fn encode_bytes<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(data))
}

fn decode_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    let payload = match raw.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => raw.as_str(),
    };
    BASE64
        .decode(payload.trim())
        .map_err(serde::de::Error::custom)
}

/// Settings for one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub aspect_ratio: AspectRatio,
    pub style: Style,
    pub scene_count: u8,
    pub mode: GenerationMode,
    pub reference_image: Option<ReferenceImage>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            aspect_ratio: AspectRatio::default(),
            style: Style::default(),
            scene_count: MIN_SCENES,
            mode: GenerationMode::default(),
            reference_image: None,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if !(MIN_SCENES..=MAX_SCENES).contains(&self.scene_count) {
            return Err(InvalidConfig::SceneCount(self.scene_count));
        }
        if let Some(reference) = &self.reference_image {
            if !reference.mime_type.starts_with("image/") {
                return Err(InvalidConfig::ReferenceMime(reference.mime_type.clone()));
            }
        }
        Ok(())
    }

    pub fn has_reference(&self) -> bool {
        self.reference_image.is_some()
    }
}
