use thiserror::Error;

/// Errors raised by the responder, the capture pipeline and the collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket connect/read/write failure. Recovered by reconnecting.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed framed message from the control daemon.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The display surface could not be opened or mapped.
    #[error("display device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The encode unit rejected a frame.
    #[error("encode error: {0}")]
    Encode(String),

    #[error("surface read failed: {0}")]
    SurfaceRead(String),

    #[error("output buffer too small ({needed} bytes needed, {capacity} available)")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("{0} already running")]
    AlreadyRunning(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
