use call_dispatch::{Config, Dispatcher, Response, WorkUnit};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
#[error("remote call interrupted")]
struct Interrupted;

/// Имитация блокирующего удалённого вызова, проверяющего abort между чтениями
struct RemoteCall {
    latency: Duration,
    reply: u64,
    aborted: AtomicBool,
}

impl WorkUnit for RemoteCall {
    type Output = u64;
    type Error = Interrupted;

    fn execute(&self) -> Result<u64, Interrupted> {
        let started = Instant::now();
        while started.elapsed() < self.latency {
            if self.aborted.load(Ordering::Acquire) {
                return Err(Interrupted);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(self.reply)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::default()
        .with_workers(4)
        .with_queue_bound(4)
        .with_sweep_interval(Some(Duration::from_millis(50)));
    let dispatcher = Dispatcher::with_config(config)?;

    let fast = dispatcher.submit_without_deadline(
        RemoteCall { latency: Duration::from_millis(200), reply: 42, aborted: AtomicBool::new(false) },
    )?;
    let stuck = dispatcher.submit(
        RemoteCall { latency: Duration::from_secs(60), reply: 0, aborted: AtomicBool::new(false) },
        Some(Duration::from_millis(500)),
    )?;

    for (call, response) in [
        ("fast", dispatcher.await_response(fast, Some(Duration::from_secs(2))).await),
        ("stuck", dispatcher.await_response(stuck, None).await),
    ] {
        match response {
            Response::Success(value) => info!(call, value, "call succeeded"),
            Response::Failure(failure) => info!(call, %failure, "call failed"),
            Response::Cancelled(cancellation) => info!(call, %cancellation, "call cancelled"),
        }
    }

    let metrics = dispatcher.metrics();
    info!(
        submitted = metrics.total_submitted,
        completed = metrics.completed,
        timed_out = metrics.timed_out,
        "done"
    );

    dispatcher.shutdown().await;
    Ok(())
}
