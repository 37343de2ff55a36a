use chrono::{DateTime, Utc};

use super::registry::ImageRegistry;

/// Images where both rendered sides fall below this are skipped.
pub const MIN_RENDERED_SIDE_PX: f64 = 125.0;

/// Lowercased URL fragments marking decorative or non-photographic assets.
pub const DENIED_URL_MARKERS: &[&str] = &["video_thumb", "icon", "static-asset"];

const PROFILE_ALT_MARKER: &str = "profile";
const INLINE_IMAGE_PREFIX: &str = "data:image";

/// What a scan sees of an image element at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateImage<'a> {
    pub url: &'a str,
    pub alt: &'a str,
    pub width: f64,
    pub height: f64,
}

/// Whether `candidate` should be sent for generation now.
pub fn is_eligible(
    candidate: &CandidateImage<'_>,
    registry: &ImageRegistry,
    now: DateTime<Utc>,
) -> bool {
    let url = candidate.url.to_lowercase();
    registry.is_retry_window_elapsed(candidate.url, now)
        && !candidate.url.starts_with(INLINE_IMAGE_PREFIX)
        && !candidate.alt.to_lowercase().contains(PROFILE_ALT_MARKER)
        && !DENIED_URL_MARKERS.iter().any(|marker| url.contains(marker))
        && !(candidate.width < MIN_RENDERED_SIDE_PX && candidate.height < MIN_RENDERED_SIDE_PX)
}
