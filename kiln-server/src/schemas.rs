//! OpenAI image API request and response shapes.

use std::{fmt, io::Cursor, str::FromStr};

use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// No file hosting here, so `url` carries a `data:` URI.
    #[default]
    Url,
    B64Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub n: Option<usize>,
    pub size: Option<String>,
    pub response_format: Option<ResponseFormat>,
    pub quality: Option<String>,
    pub style: Option<String>,
    pub user: Option<String>,
    // Extensions over the OpenAI schema.
    pub seed: Option<u64>,
    pub steps: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

impl ImageObject {
    pub fn new(format: ResponseFormat, b64_png: String) -> Self {
        match format {
            ResponseFormat::B64Json => Self {
                b64_json: Some(b64_png),
                ..Default::default()
            },
            ResponseFormat::Url => Self {
                url: Some(format!("data:image/png;base64,{b64_png}")),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationResponse {
    pub created: i64,
    pub data: Vec<ImageObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

/// `<width>x<height>`, as in the OpenAI `size` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("size must look like 1024x1024, got {s:?}"))?;
        let parse = |dim: &str| match dim.trim().parse::<usize>() {
            Ok(0) | Err(_) => Err(format!("invalid image size {s:?}")),
            Ok(dim) => Ok(dim),
        };
        Ok(Self {
            width: parse(width)?,
            height: parse(height)?,
        })
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Encodes an image as a base64 PNG.
pub fn image_to_base64_png(img: &DynamicImage) -> Result<String, image::ImageError> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}
