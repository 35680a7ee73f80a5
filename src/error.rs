use thiserror::Error;

pub type FunnelResult<T> = Result<T, FunnelError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Funnel must define at least one step")]
    NoSteps,
    #[error("Step rank {rank} is defined more than once")]
    DuplicateRank { rank: u32 },
    #[error("Step ranks must be contiguous from 1 to {max_step}; missing rank {missing}")]
    RankGap { missing: u32, max_step: u32 },
    #[error("Step rank {rank} has no {field}")]
    IncompleteStep { rank: u32, field: &'static str },
    #[error("Missing required binding: {0}")]
    MissingBinding(&'static str),
    #[error("Invalid SQL identifier for {field}: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },
    #[error("Dimension {0:?} is declared more than once")]
    DuplicateDimension(String),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum FunnelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid input row: {0}")]
    InvalidInput(String),
}
