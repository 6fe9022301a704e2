use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Returned by [`SignalConnector`](crate::SignalConnector) and
    /// [`SignalChannel`](crate::SignalChannel) implementations.
    #[error("signal channel error: {0}")]
    Signal(String),
    #[error("room error: {0}")]
    Room(String),
    #[error("device credentials unavailable: {0}")]
    Credentials(String),
    #[error("organization lookup failed: {0}")]
    Organization(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid room url: {0}")]
    InvalidUrl(String),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    /// Returned by [`TransportFactory`](crate::TransportFactory) implementations.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("not connected")]
    NotConnected,
}

/// Failure acquiring or switching a capture device.
///
/// Stored in session state per device kind, so it is `Clone + PartialEq`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("device not found")]
    NotFound,
    #[error("device in use")]
    InUse,
    #[error("{0}")]
    Other(String),
}
