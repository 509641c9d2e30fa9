use derive_more::{Display, From};
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Display, Debug, From)]
pub enum Error {
    Engine(EngineError),
    Gateway(GatewayError),
    Storage(StorageError),
    Pack(PackError),
    Scenario(ScenarioError),
    Serialization(serde_json::Error),
    Yaml(serde_yaml::Error),
    IO(std::io::Error),
    StringError(String),
}

/// Turn-fatal failures raised by the pipeline itself. A validator rejection
/// is deliberately absent here: blocked actions are normal validator output,
/// not an error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no campaign database at {0}")]
    NoCampaign(String),

    #[error("campaign has no current scene")]
    NoCurrentScene,

    #[error("turn {0} not found in event log")]
    TurnNotFound(u64),

    #[error("replay range {start}..={end} is outside the recorded log")]
    ReplayOutOfRange { start: u64, end: u64 },

    #[error("unknown prompt id: {0}")]
    UnknownPrompt(String),

    #[error("prompt {id} has no version {version}")]
    UnknownPromptVersion { id: String, version: String },
}

// Errors related to LLM operations are separated into their own enum.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("OpenAI API error: {0}")]
    OpenAI(#[from] async_openai::error::OpenAIError),

    #[error("provider returned no message content")]
    NoMessageFound,

    #[error("timeout occurred")]
    Timeout,

    #[error("output failed schema validation after {attempts} attempts: {detail}")]
    SchemaValidation { attempts: u32, detail: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A proposed diff would break a projection invariant. This is a
    /// bug-class error: the resolver produced a diff the store refuses.
    #[error("state constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("row not found: {0}")]
    MissingRow(String),
}

#[derive(Debug, Error)]
pub enum PackError {
    #[error("pack manifest missing or unreadable at {0}")]
    MissingManifest(String),

    #[error("malformed pack file {path}: {detail}")]
    Malformed { path: String, detail: String },

    #[error("pack {0} is already installed")]
    AlreadyInstalled(String),

    #[error("pack {id} depends on {dependency}, which is not installed")]
    MissingDependency { id: String, dependency: String },
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario references unknown pack entity {0}")]
    UnknownPackEntity(String),

    #[error("scenario references pack {0}, which is not installed")]
    PackNotInstalled(String),

    #[error("invalid scenario: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        Error::Storage(StorageError::Sqlite(error))
    }
}

impl From<async_openai::error::OpenAIError> for Error {
    fn from(error: async_openai::error::OpenAIError) -> Self {
        Error::Gateway(GatewayError::OpenAI(error))
    }
}
