use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info, warn, Instrument};

use crate::shutdown::ShutdownSignal;

/// Errors from [`join_group`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Long-lived task finished prematurely: {name}")]
    PrematureFinish { name: Cow<'static, str> },
    #[error("Tasks did not finish before the shutdown deadline: {names:?}")]
    Hung { names: Vec<String> },
}

/// A named wrapper around [`tokio::task::JoinHandle`] which (1) propagates
/// panics from the spawned task to whoever polls the handle and (2) is
/// `#[must_use]`, nudging callers towards joining every task they spawn.
/// Call [`Task::detach`] when a task intentionally outlives its handle.
#[must_use]
pub struct Task<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

/// Wraps a finished-or-not [`Task`] so that joining it logs the outcome and
/// yields the task name instead of the (discarded) output.
#[must_use]
pub struct LoggedTask(Task<()>);

impl<T> Task<T> {
    /// Spawn a named task. The current [`tracing::Span`] is propagated into
    /// the spawned future so its logs stay attributed to the caller.
    #[inline]
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self::spawn_with_span(name, tracing::Span::current(), future)
    }

    /// Spawn a named task inside an explicit span. Pass
    /// `info_span!(parent: None, "(my-task)")` to detach from the caller's
    /// span.
    #[inline]
    pub fn spawn_with_span<F>(
        name: impl Into<Cow<'static, str>>,
        span: tracing::Span,
        future: F,
    ) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        Self {
            handle: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    #[inline]
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Drop the handle, letting the task run on unsupervised. Prefer joining;
    /// a detached task can no longer report its result or its panic.
    #[inline]
    pub fn detach(self) {
        std::mem::drop(self)
    }
}

impl Task<()> {
    /// Instrument the task so its outcome is logged when it finishes.
    #[inline]
    pub fn logged(self) -> LoggedTask {
        LoggedTask(self)
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        Poll::Ready(match result {
            Ok(value) => Ok(value),
            Err(join_err) => match join_err.try_into_panic() {
                Ok(reason) => {
                    error!("Task '{}' panicked!", self.name());
                    std::panic::resume_unwind(reason)
                }
                Err(join_err) => Err(join_err),
            },
        })
    }
}

// --- impl LoggedTask --- //

impl LoggedTask {
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl Future for LoggedTask {
    type Output = Cow<'static, str>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            let name = self.0.name.clone();
            match result {
                Ok(()) => info!("Task '{name}' finished"),
                Err(e) if e.is_cancelled() =>
                    warn!("Task '{name}' was cancelled"),
                Err(e) => warn!("Task '{name}' failed to join: {e:#}"),
            }
            name
        })
    }
}

// --- Group join --- //

/// Drive a group of long-lived tasks until a shutdown signal arrives, then
/// wait up to `shutdown_timeout` for everything to wind down.
///
/// - `static_tasks` are expected to run until shutdown; if one finishes early
///   the whole group is shut down and an error is returned.
/// - Short-lived tasks (e.g. per-peer message loops) arrive over `eph_rx` and
///   may finish at any time.
/// - All handles are polled so panics propagate to the caller.
pub async fn join_group(
    static_tasks: Vec<Task<()>>,
    mut eph_rx: mpsc::Receiver<Task<()>>,
    mut shutdown: ShutdownSignal,
    shutdown_timeout: Duration,
) -> Result<(), Error> {
    let mut static_tasks = static_tasks
        .into_iter()
        .map(Task::logged)
        .collect::<FuturesUnordered<_>>();
    let mut eph_tasks = FuturesUnordered::new();

    let mut result = Ok(());

    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            Some(task) = eph_rx.recv() => {
                debug!("Watching task: {}", task.name());
                eph_tasks.push(task.logged());
            }
            Some(name) = eph_tasks.next() => {
                debug!("Task finished: {name}");
            }
            // `next()` yields `None` while there are no static tasks, which
            // just disables this branch.
            Some(name) = static_tasks.next() => {
                result = Err(Error::PrematureFinish { name });
                break shutdown.send();
            }
        }
    }

    let mut remaining = static_tasks
        .into_iter()
        .chain(eph_tasks.into_iter())
        .collect::<FuturesUnordered<_>>();

    let deadline = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(deadline);

    while !remaining.is_empty() {
        tokio::select! {
            Some(_name) = remaining.next() => (),
            () = &mut deadline => {
                let names = remaining
                    .iter()
                    .map(|t| t.name().to_owned())
                    .collect::<Vec<_>>();
                return Err(Error::Hung { names });
            }
        }
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn join_propagates_value() {
        let task = Task::spawn("answer", async { 42 });
        assert_eq!(task.await.unwrap(), 42);
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn join_propagates_panic() {
        let task = Task::spawn("bomb", async { panic!("boom") });
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn premature_finish_shuts_down_group() {
        let shutdown = ShutdownSignal::new();
        let (_eph_tx, eph_rx) = mpsc::channel(1);

        let quitter = Task::spawn("quitter", async {});
        let mut stayer_shutdown = shutdown.clone();
        let stayer =
            Task::spawn("stayer", async move { stayer_shutdown.recv().await });

        let result = join_group(
            vec![quitter, stayer],
            eph_rx,
            shutdown,
            Duration::from_secs(3),
        )
        .await;

        match result {
            Err(Error::PrematureFinish { name }) =>
                assert_eq!(name, "quitter"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ephemeral_tasks_join_before_shutdown_completes() {
        let shutdown = ShutdownSignal::new();
        let (eph_tx, eph_rx) = mpsc::channel(4);

        eph_tx.try_send(Task::spawn("eph", async {})).unwrap();

        let group = tokio::spawn(join_group(
            Vec::new(),
            eph_rx,
            shutdown.clone(),
            Duration::from_secs(3),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send();
        group.await.unwrap().expect("Group should shut down cleanly");
    }
}
