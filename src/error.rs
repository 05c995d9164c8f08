//! Error types shared by the connection state machine, the GATT gateway and
//! the command executor.

use thiserror::Error;
use uuid::Uuid;

/// Failure reported by the BLE transport itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("bluetooth adapter is powered off")]
    PoweredOff,

    #[error("bluetooth access is not authorized")]
    Unauthorized,

    #[error("bluetooth adapter is unavailable")]
    Unavailable,

    #[error("bluetooth adapter state is unknown")]
    UnknownAdapterState,

    #[error("peripheral is busy")]
    Busy,

    #[error("peripheral is not connected")]
    NotConnected,

    #[error("connection attempt was canceled")]
    CanceledToConnect,

    #[error("characteristic {0} is not supported by this peripheral")]
    NotSupported(Uuid),

    #[error("GATT operation failed: {0}")]
    OperationFailed(#[source] TransportError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("central is already initialized")]
    AlreadyInitialized,

    #[error("malformed value: expected {expected} bytes, got {actual}")]
    MalformedValue { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
