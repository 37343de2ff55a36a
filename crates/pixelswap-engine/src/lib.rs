pub mod bus;
pub mod clock;
pub mod dispatch;
pub mod engine;
pub mod page;
pub mod providers;
pub mod srcset;

pub use bus::{ChannelBridge, TabId, TabRouter};
pub use dispatch::{BatchOutcome, GenerationDispatcher};
pub use engine::{HostBridge, ReplaceEngine};
pub use page::{Document, PageSnapshot};
pub use providers::{default_provider_registry, ImageProvider, ImageProviderRegistry};
