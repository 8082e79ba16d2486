//! Per-session event dispatch queue.
//!
//! Every handler invocation for a session and its streams is funneled
//! through one FIFO consumed by a single task, so no two handlers for
//! entities sharing a session ever run concurrently, and each stream's
//! events are delivered in the order its reader produced them.

use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Spawns the dispatch task. The task ends when every sender handle
    /// (session plus its stream reader tasks) is gone.
    pub(crate) fn spawn() -> Dispatcher {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Dispatcher { tx }
    }

    pub(crate) fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            tracing::debug!("session dispatcher stopped; event dropped");
        }
    }
}
