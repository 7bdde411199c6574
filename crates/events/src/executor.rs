//! Dedicated pool for asynchronous command submission.
//!
//! ThreadPoolExecutor semantics on tokio: a fixed set of core workers
//! drains a bounded queue; when the queue is full, overflow workers spawn
//! up to the max pool size; past that the submitting task runs the command
//! itself, so back-pressure reaches the submitter and nothing is dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use soda_core::{BusError, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, info_span};

use crate::command_bus::CommandBus;
use crate::context_store::ContextStore;

/// Async command pool settings (`soda.event.async.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AsyncPoolConfig {
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub queue_capacity: usize,
    pub thread_name_prefix: String,
}

impl Default for AsyncPoolConfig {
    fn default() -> Self {
        Self {
            core_pool_size: 8,
            max_pool_size: 16,
            queue_capacity: 100,
            thread_name_prefix: "cqrs-async-".to_string(),
        }
    }
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Pool counters, exposed for observability and tests.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub caller_runs: AtomicU64,
}

/// Completion handle for an asynchronously submitted command.
pub struct CommandSubmission<R> {
    receiver: oneshot::Receiver<Result<R, BusError>>,
}

impl<R> Future for CommandSubmission<R> {
    type Output = Result<R, BusError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(BusError::transport("async command pool dropped the submission"))
            })
        })
    }
}

/// Bounded worker pool executing command sends off the caller's task.
pub struct AsyncCommandPool {
    queue: mpsc::Sender<Job>,
    overflow: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncCommandPool {
    pub fn new(config: &AsyncPoolConfig) -> Result<Self, BusError> {
        if config.core_pool_size == 0 || config.queue_capacity == 0 {
            return Err(BusError::contract(
                "async pool requires non-zero core-pool-size and queue-capacity",
            ));
        }
        if config.max_pool_size < config.core_pool_size {
            return Err(BusError::contract(
                "async pool max-pool-size must be >= core-pool-size",
            ));
        }

        let (queue, receiver) = mpsc::channel::<Job>(config.queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut workers = Vec::with_capacity(config.core_pool_size);
        for index in 0..config.core_pool_size {
            let receiver = receiver.clone();
            let span = info_span!(
                "async_command_worker",
                worker = %format!("{}{index}", config.thread_name_prefix)
            );
            workers.push(tokio::spawn(
                async move {
                    loop {
                        let job = {
                            let mut guard = receiver.lock().await;
                            guard.recv().await
                        };
                        match job {
                            Some(job) => job().await,
                            None => break,
                        }
                    }
                }
                .instrument(span),
            ));
        }

        Ok(Self {
            queue,
            overflow: Arc::new(Semaphore::new(
                config.max_pool_size - config.core_pool_size,
            )),
            stats: Arc::new(PoolStats::default()),
            workers,
        })
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Submit a command send for execution on the pool.
    ///
    /// The submitter's execution context is captured here and installed
    /// around the command body on the worker; workers never inherit
    /// task-locals implicitly. When both the queue and the overflow
    /// permits are exhausted, the command runs inline before this call
    /// returns.
    pub async fn submit<C: Command>(
        &self,
        bus: Arc<CommandBus>,
        command: C,
    ) -> CommandSubmission<C::Output> {
        let (sender, receiver) = oneshot::channel();
        let ctx = ContextStore::current();
        let stats = self.stats.clone();

        let job: Job = Box::new(move || {
            Box::pin(async move {
                let fut = bus.send(command);
                let result = match ctx {
                    Some(ctx) => ContextStore::scope(ctx, fut).await,
                    None => fut.await,
                };
                stats.completed.fetch_add(1, Ordering::Relaxed);
                let _ = sender.send(result);
            })
        });

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        match self.queue.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                match Arc::clone(&self.overflow).try_acquire_owned() {
                    Ok(permit) => {
                        tokio::spawn(async move {
                            job().await;
                            drop(permit);
                        });
                    }
                    Err(_) => {
                        // Caller-runs: back-pressure lands on the submitter.
                        self.stats.caller_runs.fetch_add(1, Ordering::Relaxed);
                        job().await;
                    }
                }
            }
            Err(TrySendError::Closed(job)) => {
                // Pool shut down; dropping the job closes the oneshot and
                // the submission resolves to a transport error.
                drop(job);
            }
        }

        CommandSubmission { receiver }
    }

    /// Stop accepting work and wait for the core workers to drain.
    pub async fn shutdown(self) {
        drop(self.queue);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::LocalEventBus;
    use crate::registry::{CommandHandler, CommandRegistry, EventRegistry};
    use async_trait::async_trait;
    use soda_core::{CommandMetadata, ExecutionContext, HandlerError};
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    struct Echo {
        meta: CommandMetadata,
    }

    impl Command for Echo {
        type Output = ();

        fn metadata(&self) -> &CommandMetadata {
            &self.meta
        }

        fn metadata_mut(&mut self) -> &mut CommandMetadata {
            &mut self.meta
        }
    }

    struct SlowEcho;

    #[async_trait]
    impl CommandHandler<Echo> for SlowEcho {
        async fn handle(&self, _command: Echo) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    }

    fn bus() -> Arc<CommandBus> {
        let registry = Arc::new(CommandRegistry::new());
        registry.register::<Echo, _>(SlowEcho).unwrap();
        Arc::new(CommandBus::new(
            registry,
            Arc::new(LocalEventBus::new(Arc::new(EventRegistry::new()))),
        ))
    }

    #[tokio::test]
    async fn zero_capacity_pool_is_rejected() {
        let config = AsyncPoolConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(AsyncCommandPool::new(&config).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submissions_complete_through_the_pool() {
        let pool = AsyncCommandPool::new(&AsyncPoolConfig::default()).unwrap();
        let bus = bus();

        let mut submissions = Vec::new();
        for _ in 0..16 {
            submissions.push(pool.submit(bus.clone(), Echo::default()).await);
        }
        for submission in submissions {
            submission.await.unwrap();
        }
        assert_eq!(pool.stats().completed.load(Ordering::Relaxed), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saturation_falls_back_to_caller_runs() {
        let config = AsyncPoolConfig {
            core_pool_size: 1,
            max_pool_size: 1,
            queue_capacity: 1,
            ..Default::default()
        };
        let pool = AsyncCommandPool::new(&config).unwrap();
        let bus = bus();

        let mut submissions = Vec::new();
        for _ in 0..8 {
            submissions.push(pool.submit(bus.clone(), Echo::default()).await);
        }
        for submission in submissions {
            submission.await.unwrap();
        }
        // with one worker and one queue slot, some of the 8 ran inline
        assert!(pool.stats().caller_runs.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workers_restore_the_submitter_context() {
        let pool = AsyncCommandPool::new(&AsyncPoolConfig::default()).unwrap();

        // handler that records the hop it observed via the context
        #[derive(Debug, Clone, Default)]
        struct Probe {
            meta: CommandMetadata,
        }

        impl Command for Probe {
            type Output = ();

            fn metadata(&self) -> &CommandMetadata {
                &self.meta
            }

            fn metadata_mut(&mut self) -> &mut CommandMetadata {
                &mut self.meta
            }
        }

        struct ProbeHandler;

        #[async_trait]
        impl CommandHandler<Probe> for ProbeHandler {
            async fn handle(&self, command: Probe) -> Result<(), HandlerError> {
                // context enrichment happened on the worker from the
                // submitter's captured context
                if command.metadata().request_id == "r-async" {
                    Ok(())
                } else {
                    Err(HandlerError::new("context was not propagated"))
                }
            }
        }

        let registry = Arc::new(CommandRegistry::new());
        registry.register::<Probe, _>(ProbeHandler).unwrap();
        let bus = Arc::new(CommandBus::new(
            registry,
            Arc::new(LocalEventBus::new(Arc::new(EventRegistry::new()))),
        ));

        let ctx = ExecutionContext {
            request_id: "r-async".into(),
            ..Default::default()
        };
        let submission = ContextStore::scope(ctx, pool.submit(bus, Probe::default())).await;
        submission.await.unwrap();
    }
}
