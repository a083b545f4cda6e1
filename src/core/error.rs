//! Error taxonomy shared by every component of the coordinator.

/// Result alias used throughout `core`.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A referenced job, run, chain or context entity does not exist.
    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Malformed command input.
    #[error("validation error for {field}: {message}")]
    Validation { field: String, message: String },

    /// The orchestrator call failed after local retry policy was exhausted.
    #[error("{service} error: {message}")]
    ExternalService { service: String, message: String },

    /// The breaker for `service` is open; the call was never attempted.
    #[error("circuit breaker for {service} is open")]
    CircuitOpen { service: String },

    /// Local persistence failed. Never retried here.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// An event could not be delivered to one or more channels.
    #[error("event publish failed: {0}")]
    Publish(String),

    /// Optimistic version check failed; another writer got there first.
    #[error("concurrent update detected for run {run_id}")]
    Conflict { run_id: String },
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    /// True for `ExternalService` and its `CircuitOpen` specialization.
    pub fn is_external(&self) -> bool {
        matches!(self, Self::ExternalService { .. } | Self::CircuitOpen { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_counts_as_external() {
        let err = CoreError::CircuitOpen {
            service: "airflow".to_string(),
        };
        assert!(err.is_external());
        assert!(err.is_circuit_open());
        assert!(!CoreError::not_found("WorkflowRun", "r1").is_external());
    }

    #[test]
    fn messages_name_the_entity() {
        let err = CoreError::not_found("Job", "etl");
        assert_eq!(err.to_string(), "Job with id etl not found");
    }
}
