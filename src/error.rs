use thiserror::Error;

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The peer could not be dialed, or the connection broke mid-command.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The store answered with an error reply.
    #[error("Store replied with error: {0}")]
    Command(String),

    /// The store answered with a frame we did not expect for the command.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Process control error: {0}")]
    Process(String),
}

pub type Result<T> = std::result::Result<T, CascadeError>;

impl CascadeError {
    pub fn config(msg: impl Into<String>) -> Self {
        CascadeError::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        CascadeError::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CascadeError::Protocol(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        CascadeError::Process(msg.into())
    }
}

impl From<nix::Error> for CascadeError {
    fn from(e: nix::Error) -> Self {
        CascadeError::Process(e.to_string())
    }
}

impl From<redis_protocol::error::RedisProtocolError> for CascadeError {
    fn from(e: redis_protocol::error::RedisProtocolError) -> Self {
        CascadeError::Protocol(e.to_string())
    }
}
