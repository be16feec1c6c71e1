use proxy_protocol::ErrorKind;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("state file {path} is corrupt: {reason}")]
    CorruptState { path: PathBuf, reason: String },
    #[error("state file version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },
    #[error("no free port: {0}")]
    NoFreePort(String),
    #[error("wireproxy executable not found (set a path or add it to PATH)")]
    BinaryNotFound,
    #[error("failed to start wireproxy for {profile}: {reason}")]
    SpawnFailed { profile: String, reason: String },
    #[error("invalid WireGuard config: {0}")]
    InvalidConfig(String),
    #[error("profile {0} already exists")]
    DuplicateProfile(String),
    #[error("profile {0} has an operation in progress")]
    OperationInProgress(String),
    #[error("profile {0} not found")]
    ProfileNotFound(String),
    #[error("port {port} is outside the allocation range {start}-{end}")]
    PortOutOfRange { port: u16, start: u16, end: u16 },
    #[error("port {0} is in use by another process")]
    PortUnavailable(u16),
    #[error("port {port} is used by running profile {owner}; confirm to take it over")]
    PortConflict { port: u16, owner: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::CorruptState { .. } => ErrorKind::CorruptState,
            ManagerError::UnsupportedSchema { .. } => ErrorKind::UnsupportedSchema,
            ManagerError::NoFreePort(_) => ErrorKind::NoFreePort,
            ManagerError::BinaryNotFound => ErrorKind::BinaryNotFound,
            ManagerError::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            ManagerError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            ManagerError::DuplicateProfile(_) => ErrorKind::DuplicateProfile,
            ManagerError::OperationInProgress(_) => ErrorKind::OperationInProgress,
            ManagerError::ProfileNotFound(_) => ErrorKind::ProfileNotFound,
            ManagerError::PortOutOfRange { .. } => ErrorKind::PortOutOfRange,
            ManagerError::PortUnavailable(_) => ErrorKind::PortUnavailable,
            ManagerError::PortConflict { .. } => ErrorKind::PortConflict,
            ManagerError::Io(_) => ErrorKind::Io,
        }
    }

    /// Conditions the caller can resolve by retrying, renaming or waiting.
    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }
}
