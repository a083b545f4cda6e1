mod cache;
mod hub;
mod publisher;
mod types;

pub use cache::{CachedStatus, StatusCache};
#[cfg(test)]
pub use hub::RecordingSink;
pub use hub::{BroadcastHub, EventSink, JsonlSink};
pub use publisher::EventPublisher;
pub use types::{Event, EventType};
