mod eligibility;
mod registry;

pub use eligibility::{is_eligible, CandidateImage, DENIED_URL_MARKERS, MIN_RENDERED_SIDE_PX};
pub use registry::{ImageRegistry, RETRY_WINDOW_MS};
