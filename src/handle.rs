use super::{
    dispatcher::Slots,
    errors::{DispatchError, DispatchResult},
    model::{CancelOutcome, Counters, RequestId, RequestStatus},
    registry::TrackedRequest,
    response::{CancelCause, CancelStage, Cancellation, Failure, Response},
    work::{CallableRequest, WorkUnit},
};
use std::{
    any::Any,
    future::{Future, IntoFuture},
    mem,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, OnceLock,
    },
};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const QUEUED: u8 = RequestStatus::Queued as u8;
const RUNNING: u8 = RequestStatus::Running as u8;
const COMPLETED: u8 = RequestStatus::Completed as u8;
const CANCELLED: u8 = RequestStatus::Cancelled as u8;
const ABORTED: u8 = RequestStatus::Aborted as u8;

/// Слот с итоговым ответом
enum Outcome<T> {
    Pending,
    Ready(Response<T>),
    /// Ответ забрал один из handles по значению
    Taken,
}

impl<T> Outcome<T> {
    fn read(&mut self) -> Option<Response<T>>
    where
        T: Clone,
    {
        match self {
            Self::Pending => None,
            Self::Ready(response) => Some(response.clone()),
            Self::Taken => Some(Response::Failure(Failure::consumed())),
        }
    }

    fn take(&mut self) -> Option<Response<T>> {
        match mem::replace(self, Self::Taken) {
            Self::Pending => {
                *self = Self::Pending;
                None
            }
            Self::Ready(response) => Some(response),
            Self::Taken => Some(Response::Failure(Failure::consumed())),
        }
    }
}

/// Общее состояние одного запроса.
///
/// Любой переход в терминальное состояние это CAS на `status`. Победитель
/// публикует ответ, остальные видят неудачный CAS и ничего не делают.
pub(crate) struct RequestState<W: WorkUnit> {
    id: RequestId,
    work: Arc<W>,
    status: AtomicU8,
    cancel_requested: AtomicBool,
    abort_signalled: AtomicBool,
    submitted_at: Instant,
    deadline: Option<Duration>,
    finished_at: OnceLock<Instant>,
    outcome: Mutex<Outcome<W::Output>>,
    settled: Notify,
    slots: Arc<Slots>,
}

impl<W: WorkUnit> RequestState<W> {
    pub(crate) fn new(work: Arc<W>, deadline: Option<Duration>, slots: Arc<Slots>) -> Self {
        Self {
            id: RequestId::new(),
            work,
            status: AtomicU8::new(QUEUED),
            cancel_requested: AtomicBool::new(false),
            abort_signalled: AtomicBool::new(false),
            submitted_at: Instant::now(),
            deadline,
            finished_at: OnceLock::new(),
            outcome: Mutex::new(Outcome::Pending),
            settled: Notify::new(),
            slots,
        }
    }

    #[inline]
    fn load_status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn counters(&self) -> &Counters {
        &self.slots.counters
    }

    fn try_start(&self) -> bool {
        self.status
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Единственная точка принятия терминального решения
    fn settle(&self, from: u8, to: u8, response: Response<W::Output>) -> bool {
        if self
            .status
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.finished_at.set(Instant::now());
        *self.outcome.lock() = Outcome::Ready(response);
        self.settled.notify_waiters();
        true
    }

    fn signal_abort(&self) {
        if self.abort_signalled.swap(true, Ordering::AcqRel) {
            return;
        }
        let work = &self.work;
        if panic::catch_unwind(AssertUnwindSafe(|| work.abort())).is_err() {
            warn!(request_id = %self.id, "work unit panicked while handling abort");
        }
    }

    /// Обычная отмена future: снимает запрос из очереди.
    /// Для выполняющегося запроса только запоминает намерение.
    pub(crate) fn cancel(&self, cause: CancelCause) -> bool {
        let cancellation = Cancellation::new(CancelStage::Queued, cause);
        if self.settle(QUEUED, CANCELLED, Response::Cancelled(cancellation)) {
            self.cancel_requested.store(true, Ordering::Release);
            Counters::bump(&self.counters().cancelled);
            if cause == CancelCause::DeadlineExceeded {
                Counters::bump(&self.counters().timed_out);
            }
            self.slots.release();
            debug!(request_id = %self.id, ?cause, "request cancelled before start");
            return true;
        }

        // После терминального состояния отмена ничего не меняет
        if self.load_status() == RequestStatus::Running {
            self.cancel_requested.store(true, Ordering::Release);
        }
        false
    }

    /// Отмена через диспетчер: снимает запрос из очереди или
    /// переводит выполняющийся в `Aborted` и вызывает `abort`.
    pub(crate) fn cancel_and_abort(&self, cause: CancelCause) -> CancelOutcome {
        if self.cancel(cause) {
            return CancelOutcome::Dequeued;
        }
        let cancellation = Cancellation::new(CancelStage::Running, cause);
        if self.settle(RUNNING, ABORTED, Response::Cancelled(cancellation)) {
            Counters::bump(&self.counters().aborted);
            if cause == CancelCause::DeadlineExceeded {
                Counters::bump(&self.counters().timed_out);
            }
            debug!(request_id = %self.id, ?cause, "aborting running request");
            self.signal_abort();
            return CancelOutcome::Aborted;
        }
        CancelOutcome::AlreadyTerminal
    }

    /// Тело задачи, которую выполняет воркер
    pub(crate) async fn run(self: Arc<Self>) {
        if !self.try_start() {
            debug!(request_id = %self.id, "skipping request settled before start");
            return;
        }
        Counters::bump(&self.counters().running);
        debug!(request_id = %self.id, "request claimed by worker");

        let adapter = CallableRequest::new(Arc::clone(&self.work));
        let response = match tokio::task::spawn_blocking(move || adapter.call()).await {
            Ok(response) => response,
            Err(join_err) => Response::Failure(Failure::interrupted(join_err.to_string())),
        };
        let succeeded = response.is_success();

        if self.settle(RUNNING, COMPLETED, response) {
            if succeeded {
                Counters::bump(&self.counters().completed);
            } else {
                Counters::bump(&self.counters().failed);
            }
            debug!(request_id = %self.id, succeeded, "request completed");
        } else {
            debug!(request_id = %self.id, "discarding result of aborted request");
        }

        self.counters().running.fetch_sub(1, Ordering::Relaxed);
        self.slots.release();
    }

    /// Ждёт публикации ответа и читает его через `read`
    async fn wait_with<R>(&self, read: fn(&mut Outcome<W::Output>) -> Option<R>) -> R {
        loop {
            let notified = self.settled.notified();
            let ready = {
                let mut outcome = self.outcome.lock();
                read(&mut outcome)
            };
            if let Some(value) = ready {
                return value;
            }
            notified.await;
        }
    }
}

impl<W: WorkUnit> TrackedRequest for RequestState<W> {
    fn id(&self) -> RequestId {
        self.id
    }

    fn status(&self) -> RequestStatus {
        self.load_status()
    }

    fn is_overdue(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => now.saturating_duration_since(self.submitted_at) >= deadline,
            None => false,
        }
    }

    fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    fn cancel_and_abort(&self, cause: CancelCause) -> CancelOutcome {
        RequestState::cancel_and_abort(self, cause)
    }

    fn finished_at(&self) -> Option<Instant> {
        self.finished_at.get().copied()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Handle на запрос, отправленный в диспетчер.
///
/// Клоны дешёвые и смотрят на один и тот же запрос. [`cancel`] только
/// снимает запрос из очереди; чтобы остановить уже выполняющийся unit,
/// используйте [`Dispatcher::cancel_future`](crate::Dispatcher::cancel_future)
/// или вызовите `abort` у [`work_unit`] напрямую.
///
/// Читать ответ можно двумя способами. [`get`] и [`try_get`] клонируют его
/// и подходят для общих handles. [`into_response`] и [`try_take`] забирают
/// ответ по значению и не требуют `Clone`; после этого остальные клоны
/// получают [`FailureKind::Consumed`](crate::FailureKind::Consumed).
///
/// [`cancel`]: AbortableFuture::cancel
/// [`work_unit`]: AbortableFuture::work_unit
/// [`get`]: AbortableFuture::get
/// [`try_get`]: AbortableFuture::try_get
/// [`into_response`]: AbortableFuture::into_response
/// [`try_take`]: AbortableFuture::try_take
pub struct AbortableFuture<W: WorkUnit> {
    state: Arc<RequestState<W>>,
}

impl<W: WorkUnit> Clone for AbortableFuture<W> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state) }
    }
}

impl<W: WorkUnit> AbortableFuture<W> {
    pub(crate) fn new(state: Arc<RequestState<W>>) -> Self {
        Self { state }
    }

    pub(crate) fn state(&self) -> &Arc<RequestState<W>> {
        &self.state
    }

    #[inline]
    pub fn id(&self) -> RequestId {
        self.state.id
    }

    /// Привязанный work unit. `abort` на нём не завершает handle,
    /// это делает результат `execute`.
    #[inline]
    pub fn work_unit(&self) -> &W {
        &self.state.work
    }

    pub fn work_unit_arc(&self) -> Arc<W> {
        Arc::clone(&self.state.work)
    }

    #[inline]
    pub fn status(&self) -> RequestStatus {
        self.state.load_status()
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.state.cancel_requested.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.state.deadline
    }

    /// `true`, если запрос ещё стоял в очереди и теперь отменён.
    /// Для выполняющегося запроса запоминает намерение и возвращает `false`;
    /// unit работает, пока диспетчер его не прервёт.
    pub fn cancel(&self) -> bool {
        self.state.cancel(CancelCause::Requested)
    }

    pub fn try_get(&self) -> Option<Response<W::Output>>
    where
        W::Output: Clone,
    {
        self.state.outcome.lock().read()
    }

    pub async fn get(&self) -> Response<W::Output>
    where
        W::Output: Clone,
    {
        self.state.wait_with(|outcome| outcome.read()).await
    }

    /// Ждёт не дольше `timeout`. Сам запрос при этом не трогается.
    pub async fn get_timeout(&self, timeout: Duration) -> DispatchResult<Response<W::Output>>
    where
        W::Output: Clone,
    {
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| DispatchError::Timeout)
    }

    /// Блокирует текущий поток. Нельзя вызывать внутри async задачи.
    pub fn blocking_get(&self) -> Response<W::Output>
    where
        W::Output: Clone,
    {
        futures::executor::block_on(self.get())
    }

    /// Забирает готовый ответ по значению, `None` пока запрос не завершён
    pub fn try_take(&self) -> Option<Response<W::Output>> {
        self.state.outcome.lock().take()
    }

    /// Ждёт завершения и забирает ответ по значению
    pub async fn into_response(self) -> Response<W::Output> {
        self.state.wait_with(Outcome::take).await
    }
}

impl<W: WorkUnit> IntoFuture for AbortableFuture<W> {
    type Output = Response<W::Output>;
    type IntoFuture = BoxFuture<'static, Response<W::Output>>;

    fn into_future(self) -> Self::IntoFuture {
        self.into_response().boxed()
    }
}
