//! Wire types for the daemon's JSON-RPC 2.0 surface (<https://www.jsonrpc.org/specification>).
//!
//! Orchestrator failures use application codes in the server-error range and
//! carry a typed `data` member, so a caller can tell "job already finished"
//! from "no such job" without matching on message text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::models::JobStatus;
use crate::core::provisioning::{ProvisioningCommand, ProvisioningError};
use crate::error::OrchestratorError;

pub const VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Client, job or backup does not exist.
pub const NOT_FOUND: i32 = -32000;
/// A precondition was violated; no job was created or changed.
pub const VALIDATION_FAILED: i32 = -32001;
/// The provisioning tool could not be run or exited with a failure.
pub const PROVISIONING_FAILED: i32 = -32002;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    pub fn call(method: impl Into<String>, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(Value::from(id)),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != VERSION {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl Response {
    pub fn success(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                jsonrpc: VERSION.to_string(),
                result: Some(result),
                error: None,
                id,
            },
            Err(e) => Self::failure(id, RpcError::new(INTERNAL_ERROR, e.to_string())),
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// The request line was not JSON, so its id is unknown.
    pub fn parse_error() -> Self {
        Self::failure(Value::Null, RpcError::new(PARSE_ERROR, "Parse error"))
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::failure(id, RpcError::new(INVALID_REQUEST, "Invalid request"))
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        let message = format!("Method not found: {method}");
        Self::failure(id, RpcError::new(METHOD_NOT_FOUND, message))
    }

    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::failure(id, RpcError::new(INVALID_PARAMS, details))
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn with_data(mut self, data: ErrorData) -> Self {
        self.data = Some(data);
        self
    }
}

/// Machine-readable detail attached to application errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorData {
    /// The job exists but its status does not allow the request.
    JobState { job_id: String, status: JobStatus },
    UnknownWorkspace { client_id: String },
    CommandFailed {
        command: ProvisioningCommand,
        exit_code: Option<i32>,
    },
}

impl From<&OrchestratorError> for RpcError {
    fn from(error: &OrchestratorError) -> Self {
        let message = error.to_string();
        match error {
            OrchestratorError::Validation(_) => RpcError::new(VALIDATION_FAILED, message),
            OrchestratorError::CannotCancel { job_id, status } => {
                RpcError::new(VALIDATION_FAILED, message).with_data(ErrorData::JobState {
                    job_id: job_id.clone(),
                    status: *status,
                })
            }
            OrchestratorError::NotFound(_) => RpcError::new(NOT_FOUND, message),
            OrchestratorError::Provisioning(e) => {
                let error = RpcError::new(PROVISIONING_FAILED, message);
                match e {
                    ProvisioningError::UnknownWorkspace(client_id) => {
                        error.with_data(ErrorData::UnknownWorkspace {
                            client_id: client_id.clone(),
                        })
                    }
                    ProvisioningError::CommandFailed { command, code, .. } => {
                        error.with_data(ErrorData::CommandFailed {
                            command: *command,
                            exit_code: *code,
                        })
                    }
                    ProvisioningError::Spawn { command, .. } => {
                        error.with_data(ErrorData::CommandFailed {
                            command: *command,
                            exit_code: None,
                        })
                    }
                    ProvisioningError::Workspace { .. } => error,
                }
            }
            OrchestratorError::Store(_) => RpcError::new(INTERNAL_ERROR, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_call_and_notification() {
        let line = r#"{"jsonrpc":"2.0","method":"jobs.list","params":{"client_id":"c-1"},"id":1}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        assert_eq!(req.method, "jobs.list");
        assert_eq!(req.id, Some(json!(1)));
        assert!(req.validate().is_ok());

        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"drtest.sweep"}"#).unwrap();
        assert!(req.is_notification());
        assert!(req.params.is_none());
    }

    #[test]
    fn rejects_wrong_version() {
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"1.0","method":"jobs.get","id":7}"#).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn success_omits_error_member() {
        let json = serde_json::to_value(Response::success(json!(1), "ok")).unwrap();
        assert_eq!(json, json!({"jsonrpc": "2.0", "result": "ok", "id": 1}));
    }

    #[test]
    fn cancel_rejection_carries_job_status() {
        let error = OrchestratorError::CannotCancel {
            job_id: "j-1".into(),
            status: JobStatus::Success,
        };
        let response = Response::failure(json!(4), RpcError::from(&error));
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["error"]["code"], VALIDATION_FAILED);
        assert_eq!(
            json["error"]["data"],
            json!({"kind": "job_state", "job_id": "j-1", "status": "Success"})
        );
        assert!(json.get("result").is_none());

        let decoded: Response = serde_json::from_value(json).unwrap();
        let error = decoded.into_result().unwrap_err();
        assert_eq!(
            error.data,
            Some(ErrorData::JobState {
                job_id: "j-1".into(),
                status: JobStatus::Success
            })
        );
    }

    #[test]
    fn failed_command_reports_exit_code() {
        let error = OrchestratorError::from(ProvisioningError::CommandFailed {
            command: ProvisioningCommand::Apply,
            code: Some(1),
            output: "Error: invalid credentials".into(),
        });
        let rpc = RpcError::from(&error);

        assert_eq!(rpc.code, PROVISIONING_FAILED);
        assert!(rpc.message.contains("invalid credentials"));
        assert_eq!(
            rpc.data,
            Some(ErrorData::CommandFailed {
                command: ProvisioningCommand::Apply,
                exit_code: Some(1)
            })
        );
    }

    #[test]
    fn plain_validation_and_missing_jobs_have_no_data() {
        let rpc = RpcError::from(&OrchestratorError::validation("nope"));
        assert_eq!((rpc.code, rpc.data), (VALIDATION_FAILED, None));

        let rpc = RpcError::from(&OrchestratorError::not_found("gone"));
        assert_eq!((rpc.code, rpc.data), (NOT_FOUND, None));
    }
}
