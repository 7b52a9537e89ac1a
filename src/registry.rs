use super::{
    model::{CancelOutcome, RequestId, RequestStatus},
    response::CancelCause,
};
use std::{
    any::Any,
    collections::HashMap,
    sync::Arc,
};
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

/// Запрос со стёртым типом, чтобы один реестр хранил units любого типа
pub(crate) trait TrackedRequest: Send + Sync {
    fn id(&self) -> RequestId;
    fn status(&self) -> RequestStatus;
    fn is_overdue(&self, now: Instant) -> bool;
    fn is_cancel_requested(&self) -> bool;
    fn cancel_and_abort(&self, cause: CancelCause) -> CancelOutcome;
    fn finished_at(&self) -> Option<Instant>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub(crate) type TrackedRef = Arc<dyn TrackedRequest>;

/// Все запросы от отправки до конца окна хранения
#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<HashMap<RequestId, TrackedRef>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, request: TrackedRef) {
        self.entries.lock().insert(request.id(), request);
    }

    pub(crate) fn get(&self, id: &RequestId) -> Option<TrackedRef> {
        self.entries.lock().get(id).cloned()
    }

    pub(crate) fn remove(&self, id: &RequestId) -> Option<TrackedRef> {
        self.entries.lock().remove(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Копия записей, чтобы работать с ними без блокировки:
    /// `abort` выполняет пользовательский код
    pub(crate) fn snapshot(&self) -> Vec<TrackedRef> {
        self.entries.lock().values().cloned().collect()
    }

    /// Удаляет записи, завершённые не позже чем `retention` до `now`
    pub(crate) fn evict_settled(&self, now: Instant, retention: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, request| match request.finished_at() {
            Some(finished) => now.saturating_duration_since(finished) < retention,
            None => true,
        });
        before - entries.len()
    }
}
