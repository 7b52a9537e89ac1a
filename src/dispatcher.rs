use super::{
    errors::{DispatchError, DispatchResult},
    handle::{AbortableFuture, RequestState, Task},
    model::{CancelOutcome, Counters, DispatcherMetrics, RequestId, RequestStatus},
    registry::{Registry, TrackedRef, TrackedRequest},
    response::{CancelCause, Response},
    work::WorkUnit,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use crossbeam::deque::Injector;
use tokio::{
    runtime::Handle,
    sync::{Notify, Semaphore, TryAcquireError},
    time::{Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Конфигурация диспетчера
#[derive(Debug, Clone)]
pub struct Config {
    /// Сколько units выполняется одновременно
    pub workers: usize,
    /// Сколько запросов может ждать воркера. Ёмкость `workers + queue_bound`
    pub queue_bound: usize,
    /// Для отправок без собственного дедлайна
    pub default_deadline: Option<Duration>,
    /// Период фонового sweep. `None` отключает его, но
    /// [`Dispatcher::sweep_timeouts`] можно вызывать вручную
    pub sweep_interval: Option<Duration>,
    /// Сколько завершённый запрос доступен по id
    pub retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus * 2, // Внешние вызовы в основном ждут I/O
            queue_bound: num_cpus * 20,
            default_deadline: Some(Duration::from_secs(30)),
            sweep_interval: Some(Duration::from_millis(100)),
            retention: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus,
            queue_bound: num_cpus * 10,
            default_deadline: Some(Duration::from_secs(60)),
            ..Default::default()
        }
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus * 4,
            queue_bound: num_cpus * 64,
            default_deadline: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_bound(mut self, queue_bound: usize) -> Self {
        self.queue_bound = queue_bound;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Насыщается на `usize::MAX`; такой конфиг не проходит [`validate`](Self::validate)
    #[inline]
    pub fn capacity(&self) -> usize {
        self.workers.saturating_add(self.queue_bound)
    }

    pub fn validate(&self) -> DispatchResult<()> {
        if self.workers == 0 {
            return Err(DispatchError::InvalidConfig("workers must be at least 1".into()));
        }
        let capacity = self.workers.checked_add(self.queue_bound).ok_or_else(|| {
            DispatchError::InvalidConfig("workers + queue_bound overflows usize".into())
        })?;
        if capacity > Semaphore::MAX_PERMITS {
            return Err(DispatchError::InvalidConfig(format!(
                "capacity {} exceeds {}",
                capacity,
                Semaphore::MAX_PERMITS
            )));
        }
        if self.sweep_interval == Some(Duration::ZERO) {
            return Err(DispatchError::InvalidConfig("sweep interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Учёт ёмкости, общий для диспетчера и всех запросов.
///
/// Слот берётся при отправке и возвращается ровно один раз: при отмене из
/// очереди или когда `execute` взятого запроса вернулся.
pub(crate) struct Slots {
    permits: Semaphore,
    capacity: usize,
    in_flight: AtomicUsize,
    drained: Notify,
    pub(crate) counters: Counters,
}

impl Slots {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            permits: Semaphore::new(capacity),
            capacity,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            counters: Counters::default(),
        }
    }

    pub(crate) fn try_acquire(&self) -> DispatchResult<()> {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => {
                Counters::bump(&self.counters.rejected);
                Err(DispatchError::CapacityExceeded { capacity: self.capacity })
            }
            Err(TryAcquireError::Closed) => Err(DispatchError::ShutDown),
        }
    }

    pub(crate) fn release(&self) {
        self.permits.add_permits(1);
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    #[inline]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.permits.close();
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub type SharedDispatcher = Arc<Dispatcher>;

/// Пул воркеров и реестр запросов. Отправка, отмена и sweep дедлайнов идут через него
pub struct Dispatcher {
    inject: Injector<Task>,
    global_notify: Notify,
    cancellation_token: CancellationToken,
    registry: Registry,
    slots: Arc<Slots>,
    idle_workers: AtomicUsize,
    config: Config,
}

impl Dispatcher {
    pub fn new(workers: usize, queue_bound: usize) -> DispatchResult<SharedDispatcher> {
        let config = Config {
            workers,
            queue_bound,
            ..Default::default()
        };
        Self::with_config(config)
    }

    /// Запускает воркеры и sweeper (если включён) на текущем tokio runtime
    pub fn with_config(config: Config) -> DispatchResult<SharedDispatcher> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;

        let dispatcher = Arc::new(Dispatcher {
            inject: Injector::new(),
            global_notify: Notify::new(),
            cancellation_token: CancellationToken::new(),
            registry: Registry::new(),
            slots: Arc::new(Slots::new(config.capacity())),
            idle_workers: AtomicUsize::new(0),
            config,
        });

        // Запускаем воркеры
        for worker in 0..dispatcher.config.workers {
            let dispatcher_clone = Arc::clone(&dispatcher);
            runtime.spawn(async move {
                dispatcher_clone.worker_loop(worker).await;
            });
        }

        if let Some(interval) = dispatcher.config.sweep_interval {
            dispatcher.start_sweeper(&runtime, interval);
        }

        info!(
            workers = dispatcher.config.workers,
            capacity = dispatcher.config.capacity(),
            "dispatcher started"
        );
        Ok(dispatcher)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    fn push_task(&self, task: Task) {
        self.inject.push(task);
        self.global_notify.notify_one();
    }

    async fn worker_loop(&self, worker: usize) {
        debug!(worker, "worker started");

        'outer: loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            if let Some(task) = self.inject.steal().success() {
                task.await;
                continue;
            }

            self.idle_workers.fetch_add(1, Ordering::AcqRel);

            for _ in 0..2 {
                if !self.inject.is_empty() {
                    self.idle_workers.fetch_sub(1, Ordering::AcqRel);
                    continue 'outer;
                }
                std::hint::spin_loop();
            }

            tokio::select! {
                _ = self.global_notify.notified() => {
                    self.idle_workers.fetch_sub(1, Ordering::AcqRel);
                }
                _ = self.cancellation_token.cancelled() => {
                    self.idle_workers.fetch_sub(1, Ordering::AcqRel);
                    break 'outer;
                }
            }
        }

        debug!(worker, "worker stopped");
    }

    /// Регистрирует `work` и ставит его в очередь. Никогда не блокирует.
    ///
    /// `deadline` отсчитывается от отправки. **`None` означает
    /// [`Config::default_deadline`], а не отсутствие дедлайна**; для запроса
    /// без дедлайна есть [`submit_without_deadline`](Self::submit_without_deadline).
    /// Если в работе уже `workers + queue_bound` запросов, возвращает
    /// [`DispatchError::CapacityExceeded`] и ничего не ставит в очередь.
    pub fn submit<W: WorkUnit>(
        &self,
        work: W,
        deadline: Option<Duration>,
    ) -> DispatchResult<AbortableFuture<W>> {
        self.enqueue(work, deadline.or(self.config.default_deadline))
    }

    /// Как [`submit`](Self::submit), но запрос не ограничен по времени
    /// независимо от [`Config::default_deadline`]
    pub fn submit_without_deadline<W: WorkUnit>(&self, work: W) -> DispatchResult<AbortableFuture<W>> {
        self.enqueue(work, None)
    }

    fn enqueue<W: WorkUnit>(
        &self,
        work: W,
        deadline: Option<Duration>,
    ) -> DispatchResult<AbortableFuture<W>> {
        if let Err(err) = self.slots.try_acquire() {
            debug!(%err, "submission rejected");
            return Err(err);
        }

        let state = Arc::new(RequestState::new(Arc::new(work), deadline, Arc::clone(&self.slots)));
        Counters::bump(&self.slots.counters.submitted);
        self.registry.insert(state.clone());

        let future = AbortableFuture::new(Arc::clone(&state));
        self.push_task(Box::pin(state.run()));

        debug!(request_id = %future.id(), ?deadline, "request submitted");
        Ok(future)
    }

    /// Отмена по id: запрос из очереди не запустится, выполняющийся
    /// переводится в aborted и получает `abort`
    pub fn cancel(&self, id: &RequestId) -> DispatchResult<CancelOutcome> {
        let request = self
            .registry
            .get(id)
            .ok_or(DispatchError::UnknownRequest(*id))?;
        Ok(request.cancel_and_abort(CancelCause::Requested))
    }

    /// Как [`cancel`](Self::cancel), но по handle, даже после удаления из реестра
    pub fn cancel_future<W: WorkUnit>(&self, future: &AbortableFuture<W>) -> CancelOutcome {
        future.state().cancel_and_abort(CancelCause::Requested)
    }

    /// Отменяет все запросы в реестре. Возвращает число изменивших состояние
    pub fn cancel_all(&self) -> usize {
        self.cancel_all_with(CancelCause::Requested)
    }

    fn cancel_all_with(&self, cause: CancelCause) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|request| request.cancel_and_abort(cause) != CancelOutcome::AlreadyTerminal)
            .count()
    }

    /// Прерывает запросы с истёкшим дедлайном и выполняющиеся запросы,
    /// у которых handle запросил отмену. Возвращает число завершённых
    pub fn sweep_timeouts(&self) -> usize {
        let now = Instant::now();
        let mut swept = 0;

        for request in self.registry.snapshot() {
            let status = request.status();
            if status.is_terminal() {
                continue;
            }

            if request.is_overdue(now) {
                if request.cancel_and_abort(CancelCause::DeadlineExceeded) != CancelOutcome::AlreadyTerminal {
                    warn!(request_id = %request.id(), ?status, "request exceeded its deadline");
                    swept += 1;
                }
            } else if status == RequestStatus::Running
                && request.is_cancel_requested()
                && request.cancel_and_abort(CancelCause::Requested) == CancelOutcome::Aborted
            {
                swept += 1;
            }
        }

        swept
    }

    /// Удаляет записи, завершённые раньше чем [`Config::retention`] назад
    pub fn evict_settled(&self) -> usize {
        let evicted = self.registry.evict_settled(Instant::now(), self.config.retention);
        if evicted > 0 {
            debug!(evicted, "evicted settled requests");
        }
        evicted
    }

    /// Ждёт `future` и забирает ответ по значению. Если `timeout` истёк
    /// раньше, запрос отменяется через abort и возвращается тот терминальный
    /// ответ, который победил.
    pub async fn await_response<W: WorkUnit>(
        &self,
        future: AbortableFuture<W>,
        timeout: Option<Duration>,
    ) -> Response<W::Output> {
        let Some(timeout) = timeout else {
            return future.into_response().await;
        };

        let state = Arc::clone(future.state());
        let request_id = future.id();
        match tokio::time::timeout(timeout, future.into_response()).await {
            Ok(response) => response,
            Err(_) => {
                let outcome = state.cancel_and_abort(CancelCause::AwaitTimeout);
                debug!(%request_id, ?outcome, "await timed out");
                AbortableFuture::new(state).into_response().await
            }
        }
    }

    pub fn status(&self, id: &RequestId) -> Option<RequestStatus> {
        self.registry.get(id).map(|request| request.status())
    }

    /// Типизированный handle по id. `None`, если id неизвестен, удалён
    /// или относится к другому типу unit
    pub fn find<W: WorkUnit>(&self, id: &RequestId) -> Option<AbortableFuture<W>> {
        let request: TrackedRef = self.registry.get(id)?;
        request
            .into_any()
            .downcast::<RequestState<W>>()
            .ok()
            .map(AbortableFuture::new)
    }

    /// Убирает запрос из реестра, не трогая его состояние
    pub fn forget(&self, id: &RequestId) -> bool {
        self.registry.remove(id).is_some()
    }

    pub fn tracked(&self) -> usize {
        self.registry.len()
    }

    #[inline]
    pub fn metrics(&self) -> DispatcherMetrics {
        let counters = &self.slots.counters;
        let in_flight = self.slots.in_flight();
        let running = Counters::read(&counters.running);
        DispatcherMetrics {
            queued: in_flight.saturating_sub(running),
            running,
            idle_workers: self.idle_workers.load(Ordering::Relaxed),
            in_flight,
            tracked: self.registry.len(),
            total_submitted: Counters::read(&counters.submitted),
            completed: Counters::read(&counters.completed),
            failed: Counters::read(&counters.failed),
            cancelled: Counters::read(&counters.cancelled),
            aborted: Counters::read(&counters.aborted),
            timed_out: Counters::read(&counters.timed_out),
            rejected: Counters::read(&counters.rejected),
        }
    }

    /// Ждёт, пока не освободятся все слоты. Прерванный unit держит слот,
    /// пока его `execute` не вернётся
    pub async fn join_all(&self) {
        self.slots.wait_drained().await;
    }

    pub async fn join_all_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.join_all()).await.is_ok()
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Перестаёт принимать работу, ждёт всё в полёте, затем останавливает
    /// воркеры и sweeper
    pub async fn shutdown(&self) {
        self.slots.close();
        self.join_all().await;
        self.cancellation_token.cancel();
        info!("dispatcher shut down");
    }

    /// Как [`shutdown`](Self::shutdown), но после `timeout` прерывает всё,
    /// что ещё выполняется, и возвращает `false`
    pub async fn shutdown_timeout(&self, timeout: Duration) -> bool {
        self.slots.close();
        if !self.join_all_timeout(timeout).await {
            let aborted = self.cancel_all_with(CancelCause::Shutdown);
            warn!(aborted, "requests still in flight at shutdown were cancelled");
            self.cancellation_token.cancel();
            return false;
        }
        self.cancellation_token.cancel();
        info!("dispatcher shut down");
        true
    }

    fn start_sweeper(self: &Arc<Self>, runtime: &Handle, interval: Duration) {
        let dispatcher = Arc::clone(self);

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        dispatcher.sweep_timeouts();
                        dispatcher.evict_settled();
                    }
                    _ = dispatcher.cancellation_token.cancelled() => {
                        break;
                    }
                }
            }
        });
    }

    /// Мониторинг метрик с callback
    /// ВАЖНО: отмените возвращённый token, чтобы остановить мониторинг и освободить ссылку
    pub fn start_monitoring<F>(self: &Arc<Self>, interval: Duration, callback: F) -> CancellationToken
    where
        F: Fn(DispatcherMetrics) + Send + 'static,
    {
        let dispatcher = Arc::clone(self);
        let token = CancellationToken::new();
        let token_clone = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        callback(dispatcher.metrics());
                    }
                    _ = token_clone.cancelled() => {
                        drop(dispatcher);
                        break;
                    }
                }
            }
        });

        token
    }

    pub fn stop_monitoring(token: CancellationToken) {
        token.cancel();
    }
}
