//! Контракт work unit и адаптер, превращающий его в [`Response`]

use super::response::{Failure, Response};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// Одна прерываемая, возможно блокирующая операция.
///
/// `execute` выполняется в blocking потоке. `abort` может прийти из любого
/// другого потока в любой момент, в том числе до старта `execute` или во время
/// возврата. Реализация должна это переживать, как и повторный `abort`.
pub trait WorkUnit: Send + Sync + 'static {
    type Output: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn execute(&self) -> Result<Self::Output, Self::Error>;

    /// Просит `execute` завершиться раньше. Должен возвращаться быстро и не паниковать.
    fn abort(&self);
}

impl<W: WorkUnit + ?Sized> WorkUnit for Arc<W> {
    type Output = W::Output;
    type Error = W::Error;

    fn execute(&self) -> Result<Self::Output, Self::Error> {
        (**self).execute()
    }

    fn abort(&self) {
        (**self).abort()
    }
}

/// Запускает привязанный unit ровно один раз и сводит любой исход в [`Response`]
pub struct CallableRequest<W: WorkUnit> {
    work: Arc<W>,
}

impl<W: WorkUnit> CallableRequest<W> {
    pub fn new(work: Arc<W>) -> Self {
        Self { work }
    }

    pub fn work_unit(&self) -> &W {
        &self.work
    }

    pub fn call(self) -> Response<W::Output> {
        let work = self.work;
        match panic::catch_unwind(AssertUnwindSafe(|| work.execute())) {
            Ok(Ok(value)) => Response::Success(value),
            Ok(Err(err)) => Response::Failure(Failure::from_error(err)),
            Err(payload) => Response::Failure(Failure::from_panic(payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::FailureKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("lookup failed for {0}")]
    struct LookupError(u32);

    enum Behaviour {
        Return(u32),
        Fail(u32),
        Panic,
    }

    struct Lookup {
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl Lookup {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self { behaviour, calls: AtomicUsize::new(0) })
        }
    }

    impl WorkUnit for Lookup {
        type Output = u32;
        type Error = LookupError;

        fn execute(&self) -> Result<u32, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Return(v) => Ok(v),
                Behaviour::Fail(key) => Err(LookupError(key)),
                Behaviour::Panic => panic!("lookup table corrupted"),
            }
        }

        fn abort(&self) {}
    }

    #[test]
    fn success_is_wrapped() {
        let work = Lookup::new(Behaviour::Return(42));
        let request = CallableRequest::new(work.clone());
        assert_eq!(request.work_unit().calls.load(Ordering::SeqCst), 0);
        let response = request.call();
        assert_eq!(response.into_success(), Some(42));
        assert_eq!(work.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_becomes_failure_response() {
        let response = CallableRequest::new(Lookup::new(Behaviour::Fail(7))).call();
        let failure = response.failure().expect("expected failure");
        assert_eq!(failure.kind(), FailureKind::Error);
        assert_eq!(failure.message(), "lookup failed for 7");
        assert!(failure.downcast_ref::<LookupError>().is_some());
    }

    #[test]
    fn panic_does_not_escape_the_adapter() {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let response = CallableRequest::new(Lookup::new(Behaviour::Panic)).call();
        panic::set_hook(prev);

        let failure = response.failure().expect("expected failure");
        assert_eq!(failure.kind(), FailureKind::Panic);
        assert_eq!(failure.message(), "lookup table corrupted");
    }
}
