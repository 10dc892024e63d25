use haven_wire::WireError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("storage")]
    Storage,
    #[error("crypto")]
    Crypto,
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("malformed {0}")]
    Malformed(String),
    #[error("transport {0}")]
    Transport(String),
    #[error("cafe {code}: {message}")]
    Cafe { code: u32, message: String },
    #[error("{0}")]
    Wire(#[from] WireError),
    #[error("stopped")]
    Stopped,
}

impl CoreError {
    /// Transient failures keep a request row pending and bump its attempt
    /// counter; everything else is terminal for the attempt in some way.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Transport(_) => true,
            CoreError::Cafe { code, .. } => *code >= haven_wire::CODE_SERVER_FAULT,
            _ => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CoreError::Unauthorized)
            || matches!(self, CoreError::Cafe { code, .. } if *code == haven_wire::CODE_UNAUTHORIZED)
    }
}
