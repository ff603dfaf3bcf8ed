use futures::Future;
use std::fmt;
use tracing::{debug, error};

/// The reason a process is shutting down, propagated from any task to the
/// binary's main loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShutdownReason {
    /// The process exited on its own terms (e.g. an operator signal).
    Success(&'static str),
    /// The process must exit because it cannot operate safely.
    Failure(&'static str),
}

impl ShutdownReason {
    pub fn message(&self) -> &'static str {
        match self {
            ShutdownReason::Success(msg) => msg,
            ShutdownReason::Failure(msg) => msg,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// A wrapper over a runtime handle which spawns named tasks that stop when
/// the process-wide exit signal fires.
#[derive(Clone)]
pub struct TaskExecutor {
    handle: tokio::runtime::Handle,
    /// The sender half is dropped on shutdown, waking every task waiting
    /// on the receiver.
    exit: async_channel::Receiver<()>,
    /// Sends a shutdown request to the binary's main loop.
    shutdown_tx: async_channel::Sender<ShutdownReason>,
}

impl TaskExecutor {
    pub fn new(
        handle: tokio::runtime::Handle,
        exit: async_channel::Receiver<()>,
        shutdown_tx: async_channel::Sender<ShutdownReason>,
    ) -> Self {
        Self {
            handle,
            exit,
            shutdown_tx,
        }
    }

    /// A future that resolves when the process begins shutting down.
    pub fn exit(&self) -> impl Future<Output = ()> {
        let exit = self.exit.clone();
        async move {
            let _ = exit.recv().await;
        }
    }

    pub fn shutdown_sender(&self) -> async_channel::Sender<ShutdownReason> {
        self.shutdown_tx.clone()
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Spawn a future, stopping it when the exit signal fires.
    pub fn spawn(&self, task: impl Future<Output = ()> + Send + 'static, name: &'static str) {
        let exit = self.exit();
        self.handle.spawn(async move {
            futures::pin_mut!(task);
            futures::pin_mut!(exit);
            match futures::future::select(task, exit).await {
                futures::future::Either::Left(_) => debug!(task = name, "Task completed"),
                futures::future::Either::Right(_) => debug!(task = name, "Task shutdown"),
            }
        });
    }

    /// Like `spawn`, for tasks whose `Result` has already been logged at
    /// the point of error.
    pub fn spawn_ignoring_error<E: Send + 'static>(
        &self,
        task: impl Future<Output = Result<(), E>> + Send + 'static,
        name: &'static str,
    ) {
        self.spawn(
            async move {
                let _ = task.await;
            },
            name,
        )
    }

    /// Spawn a blocking closure on the runtime's blocking pool.
    pub fn spawn_blocking<F>(&self, task: F, name: &'static str)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn_blocking(move || {
            task();
            debug!(task = name, "Blocking task completed");
        });
    }

    /// Requests a process-wide shutdown. Used by tasks which detect a
    /// condition under which the client must not keep operating.
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.shutdown_tx.try_send(reason).is_err() {
            error!(reason = reason.message(), "Unable to send shutdown signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn executor() -> (TaskExecutor, async_channel::Sender<()>, async_channel::Receiver<ShutdownReason>) {
        let (exit_tx, exit_rx) = async_channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);
        let executor = TaskExecutor::new(tokio::runtime::Handle::current(), exit_rx, shutdown_tx);
        (executor, exit_tx, shutdown_rx)
    }

    #[tokio::test]
    async fn tasks_stop_on_exit() {
        let (executor, exit_tx, _shutdown_rx) = executor();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_clone = finished.clone();

        executor.spawn(
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                finished_clone.store(true, Ordering::Relaxed);
            },
            "sleepy",
        );

        drop(exit_tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!finished.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn shutdown_reason_reaches_main_loop() {
        let (executor, _exit_tx, shutdown_rx) = executor();
        executor.shutdown(ShutdownReason::Failure("doppelganger detected"));
        let reason = shutdown_rx.recv().await.unwrap();
        assert_eq!(reason, ShutdownReason::Failure("doppelganger detected"));
    }
}
