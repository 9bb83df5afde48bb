use thiserror::Error;

/// Errors that can occur in swarm, connection and stream operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A handle was unusable for the requested operation (belongs to another
    /// swarm, is no longer registered, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Selection was attempted against an empty candidate set
    #[error("No connections")]
    NoConnections,

    /// A selector returned nothing, or a connection outside its candidates
    #[error("Invalid selected connection")]
    InvalidConnSelected,

    /// The swarm has been closed
    #[error("Swarm closed")]
    SwarmClosed,

    /// Connection (multiplexing session) closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Every stream ID of this session's parity has been handed out
    #[error("Stream IDs exhausted")]
    StreamIdsExhausted,

    /// Protocol error (malformed frame, unexpected stream id, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame payload too large
    #[error("Packet too large: {0} bytes (max {1})")]
    PacketTooLarge(usize, usize),

    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// Opaque error reported by a third-party transport
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary transport error without interpreting it.
    pub fn transport<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Transport(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
