//! Диспетчер прерываемых вызовов на ограниченном пуле воркеров
//!
//! # Features
//! - Неблокирующая отправка с немедленным отказом при переполнении
//! - Handles с доступом к work unit для прямого `abort`
//! - Отмена из очереди без запуска, прерывание выполняющихся
//! - Дедлайны запросов через фоновый sweep
//! - Ровно одно терминальное состояние на запрос даже при гонках
//! - Метрики и периодический мониторинг

pub mod dispatcher;
pub mod errors;
pub mod handle;
pub mod model;
mod registry;
pub mod response;
pub mod work;

pub use dispatcher::{Config, Dispatcher, SharedDispatcher};
pub use errors::{DispatchError, DispatchResult};
pub use handle::AbortableFuture;
pub use model::{CancelOutcome, DispatcherMetrics, RequestId, RequestStatus};
pub use response::{CancelCause, CancelStage, Cancellation, Failure, FailureKind, Response};
pub use work::{CallableRequest, WorkUnit};
