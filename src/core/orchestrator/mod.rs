mod client;
mod guarded;
mod http;
#[cfg(test)]
pub mod scripted;

pub use client::{
    ExternalRunHandle, ExternalRunState, ExternalState, OrchestratorClient, SubTaskState,
};
pub use guarded::GuardedOrchestrator;
pub use http::HttpOrchestrator;
