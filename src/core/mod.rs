pub mod chain;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod orchestrator;
pub mod reconcile;
pub mod resilience;
pub mod run;
pub mod services;
pub mod store;
pub mod terminal;

#[cfg(test)]
pub mod testkit;
