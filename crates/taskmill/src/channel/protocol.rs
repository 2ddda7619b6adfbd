//! Wire protocol types for controller-unit communication.
//!
//! The vocabulary is deliberately small: a job dispatch, its result, a
//! shutdown signal, the unit's final exit result, and the handshake hello.
//! Requests and responses are tagged enums, so an exit result is always
//! distinguished from a task result by shape, never by position.

use serde::{Deserialize, Serialize};

/// Unique correlation id for one job dispatch.
///
/// A fresh id is generated per `enqueue` call and exists solely to detect
/// protocol desynchronization between controller and unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque task submitted by a caller: a handler name plus arbitrary input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub input: serde_json::Value,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

/// Description of a failure that happened inside a remote unit.
///
/// Only the description crosses the wire; the original error's identity is
/// never reconstructed on the controller side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFault {
    /// Failure class, e.g. the error type name or "panic".
    pub kind: String,
    pub message: String,
}

impl RemoteFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Outcome of a job or of a unit's entire lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Success { value: serde_json::Value },
    Failure { fault: RemoteFault },
}

impl Outcome {
    pub fn success(value: serde_json::Value) -> Self {
        Self::Success { value }
    }

    pub fn failure(fault: RemoteFault) -> Self {
        Self::Failure { fault }
    }

    pub fn into_result(self) -> Result<serde_json::Value, RemoteFault> {
        match self {
            Self::Success { value } => Ok(value),
            Self::Failure { fault } => Err(fault),
        }
    }
}

/// Messages from controller to unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitRequest {
    Job { id: JobId, task: TaskSpec },
    Shutdown,
}

/// Messages from unit to controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitResponse {
    /// First message after connecting: echoes the authentication key the unit
    /// received over its side channel.
    Hello { key: String },

    /// Outcome of one job; `id` must match the job it answers.
    TaskResult { id: JobId, outcome: Outcome },

    /// The unit's final message before terminating.
    Exit { outcome: Outcome },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_id_roundtrips_as_plain_string() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with('"'));
        let parsed: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn job_request_serializes_tagged() {
        let req = UnitRequest::Job {
            id: JobId::new(),
            task: TaskSpec::new("sum", json!([1, 2, 3])),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "job");
        assert_eq!(value["task"]["name"], "sum");
    }

    #[test]
    fn shutdown_serializes_tagged() {
        let value = serde_json::to_value(UnitRequest::Shutdown).unwrap();
        assert_eq!(value["type"], "shutdown");
    }

    #[test]
    fn exit_and_task_result_differ_by_tag() {
        let exit = serde_json::to_value(UnitResponse::Exit {
            outcome: Outcome::success(json!(0)),
        })
        .unwrap();
        let result = serde_json::to_value(UnitResponse::TaskResult {
            id: JobId::new(),
            outcome: Outcome::success(json!(0)),
        })
        .unwrap();
        assert_eq!(exit["type"], "exit");
        assert_eq!(result["type"], "task_result");
    }

    #[test]
    fn failure_outcome_carries_fault_description() {
        let outcome = Outcome::failure(RemoteFault::new("ValueError", "bad input"));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["type"], "failure");
        assert_eq!(value["fault"]["kind"], "ValueError");

        let parsed: Outcome = serde_json::from_value(value).unwrap();
        let fault = parsed.into_result().unwrap_err();
        assert_eq!(fault.message, "bad input");
    }
}
