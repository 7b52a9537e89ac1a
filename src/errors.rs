use super::model::RequestId;

/// Ошибки самого диспетчера.
///
/// Ошибки work unit сюда не попадают, они приходят внутри
/// [`Response`](crate::response::Response).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher at capacity: {capacity} requests already in flight")]
    CapacityExceeded { capacity: usize },

    #[error("dispatcher is shut down")]
    ShutDown,

    #[error("unknown request: {0}")]
    UnknownRequest(RequestId),

    #[error("timed out waiting for response")]
    Timeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no tokio runtime available")]
    NoRuntime,
}

pub type DispatchResult<T> = Result<T, DispatchError>;
