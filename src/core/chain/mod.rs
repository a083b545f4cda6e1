mod controller;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::{CoreError, CoreResult};
use crate::core::run::WorkflowRun;

pub use controller::{ChainController, HopOutcome};

/// Ordered list of stages walked one after another on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub name: String,
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<String, ChainDefinition>,
}

impl ChainRegistry {
    pub fn new(definitions: &[ChainDefinition]) -> Self {
        let chains = definitions
            .iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect();
        Self { chains }
    }

    pub fn get(&self, name: &str) -> CoreResult<&ChainDefinition> {
        self.chains
            .get(name)
            .ok_or_else(|| CoreError::not_found("Chain", name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.chains.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Told about every run that reaches a terminal status, exactly once per
/// stored transition.
#[async_trait]
pub trait TerminalRunHandler: Send + Sync {
    async fn on_run_terminal(&self, run: &WorkflowRun) -> CoreResult<()>;
}

#[cfg(test)]
mod tests;
