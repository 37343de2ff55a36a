use serde::{Deserialize, Serialize};

/// One image handed to the generation side. `cropped_b64_image` is the
/// payload actually sent as the source image; for plain URLs it is the URL
/// itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageJob {
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    #[serde(rename = "croppedb64Image")]
    pub cropped_b64_image: String,
}

impl ImageJob {
    pub fn for_url(image_url: impl Into<String>) -> Self {
        let image_url = image_url.into();
        Self {
            cropped_b64_image: image_url.clone(),
            image_url,
        }
    }
}

/// Messages exchanged between the page and the extension's other contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireMessage", into = "WireMessage")]
pub enum ExtensionMessage {
    /// Background → page: a generation finished for `original_url`.
    UpdateSingleImage {
        original_url: String,
        new_image_url: String,
    },
    /// Popup → page (and page → other contexts): replacement switched on or off.
    ReplaceImages { enabled: bool },
    /// Page → background: request generation for a batch.
    ProcessImages { images: Vec<ImageJob> },
}

impl ExtensionMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpdateSingleImage { .. } => "updateSingleImage",
            Self::ReplaceImages { .. } => "replaceImages",
            Self::ProcessImages { .. } => "processImages",
        }
    }
}

pub fn parse_message(raw: &str) -> anyhow::Result<ExtensionMessage> {
    Ok(serde_json::from_str(raw)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireMessage {
    Action(ActionMessage),
    Toggle {
        #[serde(rename = "replaceImages")]
        replace_images: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
enum ActionMessage {
    #[serde(rename = "updateSingleImage", rename_all = "camelCase")]
    UpdateSingleImage {
        original_url: String,
        new_image_url: String,
    },
    #[serde(rename = "processImages")]
    ProcessImages { images: Vec<ImageJob> },
}

impl From<WireMessage> for ExtensionMessage {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::Action(ActionMessage::UpdateSingleImage {
                original_url,
                new_image_url,
            }) => Self::UpdateSingleImage {
                original_url,
                new_image_url,
            },
            WireMessage::Action(ActionMessage::ProcessImages { images }) => {
                Self::ProcessImages { images }
            }
            WireMessage::Toggle { replace_images } => Self::ReplaceImages {
                enabled: replace_images,
            },
        }
    }
}

impl From<ExtensionMessage> for WireMessage {
    fn from(message: ExtensionMessage) -> Self {
        match message {
            ExtensionMessage::UpdateSingleImage {
                original_url,
                new_image_url,
            } => Self::Action(ActionMessage::UpdateSingleImage {
                original_url,
                new_image_url,
            }),
            ExtensionMessage::ProcessImages { images } => {
                Self::Action(ActionMessage::ProcessImages { images })
            }
            ExtensionMessage::ReplaceImages { enabled } => Self::Toggle {
                replace_images: enabled,
            },
        }
    }
}
