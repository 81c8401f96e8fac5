//! Error taxonomy for the connection engine.
//!
//! `Error` covers both the narrow I/O collaborator boundary (the tun device
//! standing in for the IP layer) and the TCP-level error codes from the
//! socket API (spec S6, S7).

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    #[error("no route to peer: local address selection failed")]
    NotConfigured,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("connection is closing")]
    ConnectionClosing,
    #[error("connection was reset by peer")]
    ConnectionReset,
    #[error("socket is not connected")]
    NotConnected,
    #[error("end of stream")]
    EndOfStream,
    #[error("operation timed out")]
    Timeout,
    #[error("operation failed")]
    Failure,
    #[error("out of resources")]
    OutOfResources,
    #[error("invalid socket")]
    InvalidSocket,
    #[error("socket is already connected")]
    AlreadyConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tun error: {0}")]
    TunError(#[from] tidy_tuntap::error::Error),

    #[error("Port: {0} has been unexpectedly closed")]
    PortClosed(u16),

    #[error("Port: {0} already in use")]
    PortInUse(u16),

    #[error("{0}")]
    Tcp(#[from] TcpError),
}

impl Error {
    /// Best-effort projection onto the TCP-level error codes surfaced by the
    /// socket API (spec S6); collaborator-boundary errors outside that
    /// taxonomy fall back to `FAILURE`.
    pub fn as_tcp_error(&self) -> TcpError {
        match self {
            Error::Tcp(e) => *e,
            Error::TunError(_) => TcpError::Failure,
            Error::PortClosed(_) => TcpError::NotConnected,
            Error::PortInUse(_) => TcpError::OutOfResources,
        }
    }
}
