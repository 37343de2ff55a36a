use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::messages::ImageJob;

pub const DEFAULT_MODEL: &str = "fal-ai/lcm";

pub const DEFAULT_PROMPT: &str =
    "((anime, masterpiece)), vibrant, high-contrast, high-quality, manga";

pub const DEFAULT_NEGATIVE_PROMPT: &str = "watercolor, dull, nsfw, (worst quality, low quality:1.3), \
(depth of field, blurry:1.2), (greyscale, monochrome:1.1), 3D face, nose, cropped, lowres, text, \
jpeg artifacts, signature, watermark, username, blurry, artist name, trademark, watermark, title, \
(tan, muscular, loli, petite, child, infant, toddlers, chibi, sd character:1.1), multiple view, \
Reference sheet,";

/// Image-to-image parameters sent with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub sync_mode: bool,
    pub guidance_scale: f64,
    pub negative_prompt: String,
    pub num_inference_steps: u32,
    pub enable_safety_checks: bool,
    pub num_images: u32,
    /// Lower keeps the output closer to the source image.
    pub strength: f64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            sync_mode: true,
            guidance_scale: 1.2,
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            num_inference_steps: 5,
            enable_safety_checks: false,
            num_images: 1,
            strength: 0.6,
        }
    }
}

/// One generation call. `request_id` is the original image URL and is the
/// key results are correlated back on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    #[serde(skip)]
    pub model: String,
    pub prompt: String,
    pub image_url: String,
    pub request_id: String,
    #[serde(flatten)]
    pub params: ModelParams,
}

impl GenerationRequest {
    pub fn for_job(job: &ImageJob, user_prompt: &str, model: &str, params: &ModelParams) -> Self {
        Self {
            model: model.to_string(),
            prompt: resolve_prompt(user_prompt),
            image_url: job.cropped_b64_image.clone(),
            request_id: job.image_url.clone(),
            params: params.clone(),
        }
    }

    /// JSON body for the service, without the model (which selects the endpoint).
    pub fn payload(&self) -> anyhow::Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!("generation request serialized to non-object: {other}"),
        }
    }
}

/// Falls back to the built-in prompt when the user left the field empty.
pub fn resolve_prompt(user_prompt: &str) -> String {
    if user_prompt.is_empty() {
        DEFAULT_PROMPT.to_string()
    } else {
        user_prompt.to_string()
    }
}
