//! Worker scheduling capability.
//!
//! Stages never own threads. They ask a [`Scheduler`] for a [`Worker`] and hand it
//! tasks to run now, after a delay, or periodically. Tasks given to one worker run
//! one at a time in submission order, which is what lets a stage move its drain loop
//! onto a worker without further synchronization.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::Cancellable;

/// A one-shot unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work run on every tick of a periodic schedule.
pub type PeriodicTask = Box<dyn FnMut() + Send + 'static>;

/// Sequential executor handed out by a [`Scheduler`]. Cancelling the worker
/// disposes it together with everything still scheduled on it.
pub trait Worker: Cancellable {
    fn schedule(&self, task: Task) -> Arc<dyn Cancellable>;

    fn schedule_delayed(&self, task: Task, delay: Duration) -> Arc<dyn Cancellable>;

    fn schedule_periodic(
        &self,
        task: PeriodicTask,
        initial: Duration,
        period: Duration,
    ) -> Arc<dyn Cancellable>;
}

/// Factory of workers.
pub trait Scheduler: Send + Sync {
    fn create_worker(&self) -> Arc<dyn Worker>;
}

impl Cancellable for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self)
    }

    fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }
}

struct Job {
    task: Task,
    token: CancellationToken,
}

/// Scheduler backed by a tokio runtime: each worker is one spawned task draining
/// an unbounded channel.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// When called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn create_worker(&self) -> Arc<dyn Worker> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let token = CancellationToken::new();
        let stop = token.clone();

        self.handle.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) if !job.token.is_cancelled() => (job.task)(),
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            tracing::trace!("worker stopped");
        });

        Arc::new(TokioWorker {
            tx,
            token,
            handle: self.handle.clone(),
        })
    }
}

struct TokioWorker {
    tx: mpsc::UnboundedSender<Job>,
    token: CancellationToken,
    handle: Handle,
}

impl Cancellable for TokioWorker {
    fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::trace!("disposing worker");
            self.token.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Worker for TokioWorker {
    fn schedule(&self, task: Task) -> Arc<dyn Cancellable> {
        let token = self.token.child_token();
        if !token.is_cancelled() {
            let _ = self.tx.send(Job {
                task,
                token: token.clone(),
            });
        }
        Arc::new(token)
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> Arc<dyn Cancellable> {
        let token = self.token.child_token();
        let fire = token.clone();
        let tx = self.tx.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = fire.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Job { task, token: fire });
                }
            }
        });
        Arc::new(token)
    }

    fn schedule_periodic(
        &self,
        task: PeriodicTask,
        initial: Duration,
        period: Duration,
    ) -> Arc<dyn Cancellable> {
        let token = self.token.child_token();
        let fire = token.clone();
        let tx = self.tx.clone();
        let task = Arc::new(Mutex::new(task));
        let period = period.max(Duration::from_nanos(1));

        self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + initial;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = fire.cancelled() => break,
                    _ = ticker.tick() => {
                        let task = task.clone();
                        let job = Job {
                            task: Box::new(move || {
                                let mut f = task.lock();
                                (&mut **f)()
                            }),
                            token: fire.clone(),
                        };
                        if tx.send(job).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Arc::new(token)
    }
}
