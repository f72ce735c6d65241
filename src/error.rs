use thiserror::Error;

/// Failure taxonomy shared by every workflow and adapter.
///
/// Every variant is terminal for the workflow that hits it: nothing in this
/// crate retries automatically. The distinction that matters to operators is
/// between `Timeout` (the remote side may still be working) and
/// `ToolExecution` (the remote side reported failure).
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error("timed out after {seconds}s: {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("{tool} failed with exit code {exit_code}: {output}")]
    ToolExecution {
        tool: String,
        exit_code: i32,
        output: String,
    },

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    pub fn timeout(what: impl Into<String>, seconds: u64) -> Self {
        MigrateError::Timeout {
            what: what.into(),
            seconds,
        }
    }

    pub fn tool(tool: impl Into<String>, exit_code: i32, output: impl Into<String>) -> Self {
        MigrateError::ToolExecution {
            tool: tool.into(),
            exit_code,
            output: output.into(),
        }
    }
}

impl From<toml::de::Error> for MigrateError {
    fn from(err: toml::de::Error) -> Self {
        MigrateError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for MigrateError {
    fn from(err: serde_yaml::Error) -> Self {
        MigrateError::Parse(err.to_string())
    }
}
