//! Конверт с результатом или ошибкой для каждого запроса

use std::{
    any::Any,
    error::Error,
    fmt,
    sync::Arc,
};

/// Итог одного запроса. После завершения вариант больше не меняется
#[derive(Debug, Clone)]
pub enum Response<T> {
    Success(T),
    Failure(Failure),
    Cancelled(Cancellation),
}

impl<T> Response<T> {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn cancellation(&self) -> Option<&Cancellation> {
        match self {
            Self::Cancelled(cancellation) => Some(cancellation),
            _ => None,
        }
    }

    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Success(value) => Response::Success(f(value)),
            Self::Failure(failure) => Response::Failure(failure),
            Self::Cancelled(cancellation) => Response::Cancelled(cancellation),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// `execute` вернул ошибку
    Error,
    /// `execute` запаниковал
    Panic,
    /// Blocking задача с `execute` была уничтожена до возврата
    Interrupted,
    /// Ответ уже забрал другой handle
    Consumed,
}

/// Диагностика запроса, который не вернул значение
#[derive(Clone)]
pub struct Failure {
    kind: FailureKind,
    message: String,
    source: Option<Arc<dyn Error + Send + Sync>>,
}

impl Failure {
    pub fn from_error<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            kind: FailureKind::Error,
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self {
            kind: FailureKind::Panic,
            message,
            source: None,
        }
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Interrupted,
            message: message.into(),
            source: None,
        }
    }

    pub fn consumed() -> Self {
        Self {
            kind: FailureKind::Consumed,
            message: "response was taken by another handle".to_string(),
            source: None,
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Исходная ошибка work unit, если она была
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.source.as_deref()?.downcast_ref::<E>()
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Error => write!(f, "execution failed: {}", self.message),
            FailureKind::Panic => write!(f, "execution panicked: {}", self.message),
            FailureKind::Interrupted => write!(f, "execution interrupted: {}", self.message),
            FailureKind::Consumed => write!(f, "{}", self.message),
        }
    }
}

impl Error for Failure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

/// Где был запрос в момент отмены
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStage {
    /// Воркер его не взял, `execute` не запускался
    Queued,
    /// Выполнялся, у unit вызван `abort`
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// Явный `cancel`
    Requested,
    /// Истёк дедлайн запроса
    DeadlineExceeded,
    /// Вызывающий перестал ждать ответ
    AwaitTimeout,
    /// Диспетчер остановлен с незавершённой работой
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancellation {
    pub stage: CancelStage,
    pub cause: CancelCause,
}

impl Cancellation {
    pub fn new(stage: CancelStage, cause: CancelCause) -> Self {
        Self { stage, cause }
    }

    /// `true`, если unit выполнялся и был прерван
    pub fn was_aborted(&self) -> bool {
        self.stage == CancelStage::Running
    }
}

impl fmt::Display for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            CancelStage::Queued => write!(f, "cancelled before start ({:?})", self.cause),
            CancelStage::Running => write!(f, "aborted while running ({:?})", self.cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset by {peer}")]
    struct ResetError {
        peer: String,
    }

    #[test]
    fn failure_keeps_the_original_error_as_source() {
        let failure = Failure::from_error(ResetError { peer: "db-1".into() });
        assert_eq!(failure.kind(), FailureKind::Error);
        assert_eq!(failure.message(), "connection reset by db-1");
        assert!(failure.source().is_some());
        assert_eq!(failure.downcast_ref::<ResetError>().map(|e| e.peer.as_str()), Some("db-1"));
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let from_str = Failure::from_panic(Box::new("boom"));
        let from_string = Failure::from_panic(Box::new(String::from("bang")));
        let opaque = Failure::from_panic(Box::new(7_u32));

        assert_eq!(from_str.message(), "boom");
        assert_eq!(from_string.message(), "bang");
        assert_eq!(opaque.kind(), FailureKind::Panic);
        assert!(opaque.source().is_none());
    }

    #[test]
    fn map_only_touches_success() {
        let ok: Response<u32> = Response::Success(21);
        assert_eq!(ok.map(|v| v * 2).into_success(), Some(42));

        let cancelled: Response<u32> =
            Response::Cancelled(Cancellation::new(CancelStage::Queued, CancelCause::Requested));
        let mapped = cancelled.map(|v| v * 2);
        assert!(mapped.is_cancelled());
        assert!(!mapped.cancellation().map(Cancellation::was_aborted).unwrap_or(true));
    }
}
