use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub type ElementId = usize;

/// A rendered `<img>` as the scanner sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageView {
    pub id: ElementId,
    pub src: String,
    pub alt: String,
    pub width: f64,
    pub height: f64,
}

/// A `<source>` element that carries a `srcset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceView {
    pub id: ElementId,
    pub srcset: String,
}

/// Structural changes observed since the last drain. Batches are coarse:
/// one batch may cover many changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationBatch {
    pub added_nodes: usize,
    pub attribute_changes: usize,
}

impl MutationBatch {
    pub fn has_additions(&self) -> bool {
        self.added_nodes > 0
    }

    pub fn is_empty(&self) -> bool {
        self.added_nodes == 0 && self.attribute_changes == 0
    }
}

/// The live page tree the replacement engine reads and rewrites.
pub trait Document {
    fn images(&self) -> Vec<ImageView>;
    fn sources(&self) -> Vec<SourceView>;
    fn set_image_src(&mut self, id: ElementId, src: &str);
    fn set_source_srcset(&mut self, id: ElementId, srcset: &str);
    /// Drains the pending mutation batch.
    fn take_mutations(&mut self) -> MutationBatch;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageElement {
    pub src: String,
    #[serde(default)]
    pub alt: String,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceElement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcset: Option<String>,
}

/// In-memory page loaded from JSON:
///
/// ```json
/// {"images": [{"src": "...", "alt": "...", "width": 640, "height": 480}],
///  "sources": [{"srcset": "https://... 1x, https://... 2x"}]}
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    #[serde(default)]
    pub images: Vec<ImageElement>,
    #[serde(default)]
    pub sources: Vec<SourceElement>,
    #[serde(skip)]
    pending: MutationBatch,
    #[serde(skip)]
    attribute_writes: usize,
}

impl PageSnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading page {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid page JSON {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn with_image(mut self, src: &str, alt: &str, width: f64, height: f64) -> Self {
        self.images.push(ImageElement {
            src: src.to_string(),
            alt: alt.to_string(),
            width,
            height,
        });
        self
    }

    pub fn with_source(mut self, srcset: &str) -> Self {
        self.sources.push(SourceElement {
            srcset: Some(srcset.to_string()),
        });
        self
    }

    /// Inserts every element of `more`, as lazy loading or infinite scroll would.
    pub fn append(&mut self, more: PageSnapshot) {
        let added = more.images.len() + more.sources.len();
        self.images.extend(more.images);
        self.sources.extend(more.sources);
        self.pending.added_nodes += added;
    }

    pub fn image_src(&self, id: ElementId) -> Option<&str> {
        self.images.get(id).map(|image| image.src.as_str())
    }

    pub fn source_srcset(&self, id: ElementId) -> Option<&str> {
        self.sources.get(id).and_then(|source| source.srcset.as_deref())
    }

    /// Total attribute writes since the page was created.
    pub fn attribute_writes(&self) -> usize {
        self.attribute_writes
    }

    fn record_attribute_write(&mut self) {
        self.attribute_writes += 1;
        self.pending.attribute_changes += 1;
    }
}

impl Document for PageSnapshot {
    fn images(&self) -> Vec<ImageView> {
        self.images
            .iter()
            .enumerate()
            .map(|(id, image)| ImageView {
                id,
                src: image.src.clone(),
                alt: image.alt.clone(),
                width: image.width,
                height: image.height,
            })
            .collect()
    }

    fn sources(&self) -> Vec<SourceView> {
        self.sources
            .iter()
            .enumerate()
            .filter_map(|(id, source)| {
                source.srcset.as_ref().map(|srcset| SourceView {
                    id,
                    srcset: srcset.clone(),
                })
            })
            .collect()
    }

    fn set_image_src(&mut self, id: ElementId, src: &str) {
        let Some(image) = self.images.get_mut(id) else {
            return;
        };
        image.src = src.to_string();
        self.record_attribute_write();
    }

    fn set_source_srcset(&mut self, id: ElementId, srcset: &str) {
        let Some(source) = self.sources.get_mut(id) else {
            return;
        };
        source.srcset = Some(srcset.to_string());
        self.record_attribute_write();
    }

    fn take_mutations(&mut self) -> MutationBatch {
        std::mem::take(&mut self.pending)
    }
}
