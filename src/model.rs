use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};
use uuid::Uuid;

/// Уникальный идентификатор каждой отправки
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Жизненный цикл запроса
///
/// ```text
/// Queued -> Running -> Completed | Aborted
/// Queued -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestStatus {
    Queued = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
    Aborted = 4,
}

impl RequestStatus {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Aborted,
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Aborted)
    }
}

/// Результат отмены через диспетчер
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Запрос не был взят воркером, `execute` не запустится
    Dequeued,
    /// Запрос выполнялся, переведён в aborted и получил `abort`
    Aborted,
    /// Запрос уже завершён, ничего не изменилось
    AlreadyTerminal,
}

#[derive(Debug, Clone)]
pub struct DispatcherMetrics {
    pub queued: usize,
    pub running: usize,
    pub idle_workers: usize,
    pub in_flight: usize,
    pub tracked: usize,
    pub total_submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub aborted: usize,
    pub timed_out: usize,
    pub rejected: usize,
}

impl DispatcherMetrics {
    pub fn utilization(&self) -> f64 {
        if self.running + self.idle_workers == 0 {
            return 0.0;
        }
        self.running as f64 / (self.running + self.idle_workers) as f64
    }

    pub fn queue_pressure(&self) -> f64 {
        self.queued as f64
    }

    /// Доля завершённых запросов, вернувших значение
    pub fn success_rate(&self) -> f64 {
        let settled = self.completed + self.failed + self.cancelled + self.aborted;
        if settled == 0 {
            return 1.0;
        }
        self.completed as f64 / settled as f64
    }

    pub fn settled(&self) -> usize {
        self.completed + self.failed + self.cancelled + self.aborted
    }
}

/// Счётчики, общие для диспетчера и всех его запросов
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) submitted: AtomicUsize,
    pub(crate) running: AtomicUsize,
    pub(crate) completed: AtomicUsize,
    pub(crate) failed: AtomicUsize,
    pub(crate) cancelled: AtomicUsize,
    pub(crate) aborted: AtomicUsize,
    pub(crate) timed_out: AtomicUsize,
    pub(crate) rejected: AtomicUsize,
}

impl Counters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn read(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}
