use thiserror::Error;

/// Errors produced by the telnetd protocol layer and server.
#[derive(Debug, Error)]
pub enum TelnetdError {
    #[error("outbound buffer full: {needed} bytes needed, {free} free")]
    BufferFull { needed: usize, free: usize },

    #[error("config error: {0}")]
    Config(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TelnetdResult<T> = Result<T, TelnetdError>;
