use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalidJson,
    ConfigInvalidValue,

    ValidationInvalidArgument,
    ValidationMissingParameter,

    HostDuplicate,
    HostNotFound,

    TaskDuplicate,
    TaskNotFound,
    TaskCyclic,

    SshConnectFailed,

    RemoteCommandFailed,
    RemoteCommandTimeout,

    ReleaseNoRollbackTarget,

    InternalIoError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",
            ErrorCode::ValidationMissingParameter => "validation.missing_parameter",

            ErrorCode::HostDuplicate => "host.duplicate",
            ErrorCode::HostNotFound => "host.not_found",

            ErrorCode::TaskDuplicate => "task.duplicate",
            ErrorCode::TaskNotFound => "task.not_found",
            ErrorCode::TaskCyclic => "task.cyclic",

            ErrorCode::SshConnectFailed => "ssh.connect_failed",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::RemoteCommandTimeout => "remote.command_timeout",

            ErrorCode::ReleaseNoRollbackTarget => "release.no_rollback_target",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundDetails {
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub known: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateDetails {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CyclicTaskDetails {
    pub cycle: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingParameterDetails {
    pub task: String,
    pub parameter: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDetails {
    pub host: String,
    pub address: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub target: TargetDetails,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandTimeoutDetails {
    pub command: String,
    pub timeout_secs: u64,
    pub target: TargetDetails,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectFailedDetails {
    pub stderr: String,
    pub exit_code: i32,
    pub target: TargetDetails,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in recipe",
            serde_json::json!({ "path": path.into(), "error": err.to_string() }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let problem = problem.into();
        let key = key.into();
        Self::new(
            ErrorCode::ConfigInvalidValue,
            format!("Invalid value for '{}': {}", key, problem),
            to_details(ConfigInvalidValueDetails {
                key,
                value,
                problem,
            }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
    ) -> Self {
        let problem = problem.into();
        Self::new(
            ErrorCode::ValidationInvalidArgument,
            problem.clone(),
            to_details(InvalidArgumentDetails {
                field: field.into(),
                problem,
            }),
        )
    }

    pub fn missing_parameter(task: impl Into<String>, parameter: impl Into<String>) -> Self {
        let task = task.into();
        let parameter = parameter.into();
        Self::new(
            ErrorCode::ValidationMissingParameter,
            format!("Task '{}' requires parameter '{}'", task, parameter),
            to_details(MissingParameterDetails {
                task,
                parameter: parameter.clone(),
            }),
        )
        .with_hint(format!("Pass --{}=<value> to set it", parameter))
    }

    pub fn duplicate_host(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(
            ErrorCode::HostDuplicate,
            format!("Host '{}' is already registered", id),
            to_details(DuplicateDetails { id }),
        )
    }

    pub fn unknown_host(id: impl Into<String>, known: Vec<String>) -> Self {
        let id = id.into();
        Self::new(
            ErrorCode::HostNotFound,
            format!("Host '{}' not found", id),
            to_details(NotFoundDetails { id, known }),
        )
        .with_hint("Run 'rollout hosts' to see configured hosts")
    }

    pub fn duplicate_task(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(
            ErrorCode::TaskDuplicate,
            format!("Task '{}' is already defined", id),
            to_details(DuplicateDetails { id }),
        )
    }

    pub fn unknown_task(id: impl Into<String>, known: Vec<String>) -> Self {
        let id = id.into();
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task '{}' not found", id),
            to_details(NotFoundDetails { id, known }),
        )
        .with_hint("Run 'rollout plan <task>' to inspect a task's expansion")
    }

    pub fn cyclic_task(cycle: Vec<String>) -> Self {
        Self::new(
            ErrorCode::TaskCyclic,
            format!("Task graph contains a cycle: {}", cycle.join(" -> ")),
            to_details(CyclicTaskDetails { cycle }),
        )
    }

    pub fn connection_failed(target: TargetDetails, exit_code: i32, stderr: String) -> Self {
        let mut err = Self::new(
            ErrorCode::SshConnectFailed,
            format!("Could not connect to {}", target.address),
            to_details(ConnectFailedDetails {
                stderr,
                exit_code,
                target,
            }),
        )
        .with_hint("Check that the host is reachable and your ssh agent holds the key");
        err.retryable = Some(true);
        err
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        Self::new(
            ErrorCode::RemoteCommandFailed,
            format!(
                "Remote command failed with exit code {}: {}",
                details.exit_code, details.command
            ),
            to_details(details),
        )
    }

    pub fn command_timeout(details: RemoteCommandTimeoutDetails) -> Self {
        Self::new(
            ErrorCode::RemoteCommandTimeout,
            format!(
                "Remote command exceeded {}s: {}",
                details.timeout_secs, details.command
            ),
            to_details(details),
        )
    }

    pub fn no_rollback_target(host: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ReleaseNoRollbackTarget,
            "No previous release to roll back to",
            serde_json::json!({ "host": host.into() }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalIoError,
            "IO error",
            to_details(InternalIoErrorDetails {
                error: error.into(),
                context,
            }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalUnexpected,
            error.clone(),
            serde_json::json!({ "error": error }),
        )
    }

    /// Exit code of the failed remote command, when this error carries one.
    pub fn remote_exit_code(&self) -> Option<i32> {
        match self.code {
            ErrorCode::RemoteCommandFailed | ErrorCode::SshConnectFailed => self
                .details
                .get("exitCode")
                .and_then(Value::as_i64)
                .map(|code| code as i32),
            _ => None,
        }
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }
}
