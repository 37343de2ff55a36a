pub mod events;
pub mod images;
pub mod messages;
pub mod params;
pub mod session;
