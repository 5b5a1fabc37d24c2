use thiserror::Error;

/// Process exit codes used by the daemon binary.
pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP: i32 = 1;
pub const EXIT_PORT_BIND: i32 = 2;
pub const EXIT_CONFIG: i32 = 3;

#[derive(Debug, Error)]
pub enum TamiasError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No model configured: set defaultModels or add a connection with selectedModels")]
    NoModelConfigured,

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Model failure: {0}")]
    ModelFailure(String),

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: String },

    #[error("Agent disabled: {id}")]
    AgentDisabled { id: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Bridge error ({bridge}): {reason}")]
    Bridge { bridge: String, reason: String },

    #[error("MCP server error ({server}): {reason}")]
    Mcp { server: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TamiasError {
    /// Short error code string used in HTTP error payloads and logs.
    pub fn code(&self) -> &'static str {
        match self {
            TamiasError::Config(_) => "CONFIG_ERROR",
            TamiasError::NoModelConfigured => "NO_MODEL_CONFIGURED",
            TamiasError::UnknownConnection(_) => "UNKNOWN_CONNECTION",
            TamiasError::ModelFailure(_) => "MODEL_FAILURE",
            TamiasError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            TamiasError::AgentNotFound { .. } => "AGENT_NOT_FOUND",
            TamiasError::AgentDisabled { .. } => "AGENT_DISABLED",
            TamiasError::Persistence(_) => "PERSISTENCE_ERROR",
            TamiasError::Database(_) => "DATABASE_ERROR",
            TamiasError::Bridge { .. } => "BRIDGE_ERROR",
            TamiasError::Mcp { .. } => "MCP_ERROR",
            TamiasError::Serialization(_) => "SERIALIZATION_ERROR",
            TamiasError::Io(_) => "IO_ERROR",
            TamiasError::Shutdown => "SHUTDOWN",
            TamiasError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TamiasError>;
