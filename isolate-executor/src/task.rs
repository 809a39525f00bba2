//! Background task bookkeeping and cancellation (component 6's
//! `background_tasks` registry and the `Task.cancel()` loop).
//!
//! A submitted task runs on its own tokio task. Cancelling it is
//! cooperative first - a [`CancellationToken`] is checked at the same
//! points the pump and the builder loop already yield control - with a
//! blunt fallback: if a bridge has been handed to the task, it gets
//! terminated outright, which unblocks anything still waiting on the
//! agent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::AgentStub;

/// The interval the cancel loop polls the task's join handle at, the
/// Rust analogue of the Python implementation's `future.exception(timeout=0.1)`
/// poll inside `Task.cancel()`.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct BackgroundTask {
    pub task_id: String,
    cancellation_token: CancellationToken,
    current_bridge: Arc<Mutex<Option<Arc<dyn AgentStub>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    /// Builds a registry entry from a [`TaskContext`] that was already
    /// handed to the tokio task `handle` is the join handle of. Taking
    /// the context (rather than creating one here) lets the caller
    /// spawn the pipeline - and thus obtain `handle` - before the
    /// registry entry exists, while still sharing the same
    /// cancellation token and bridge slot the spawned future observes.
    pub fn new(task_id: String, context: TaskContext, handle: JoinHandle<()>) -> Self {
        Self {
            task_id,
            cancellation_token: context.cancellation_token,
            current_bridge: context.current_bridge,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Convenience for callers that build the context and the task
    /// together and want both back, mirroring the shape of the
    /// constructor this replaced.
    pub fn new_with_context(task_id: String, handle: JoinHandle<()>) -> (Self, TaskContext) {
        let context = TaskContext::new();
        let task = Self::new(task_id, context.clone(), handle);
        (task, context)
    }

    /// Cancels the task and blocks until its tokio task has actually
    /// finished, terminating whatever bridge it is holding on every
    /// pass so a pump stuck reading from an unresponsive agent doesn't
    /// keep the cancel request waiting forever.
    pub async fn cancel(&self) {
        self.cancellation_token.cancel();

        loop {
            if let Some(bridge) = self.current_bridge.lock().await.as_ref() {
                bridge.terminate().await;
            }

            let mut handle_slot = self.handle.lock().await;
            match handle_slot.as_mut() {
                Some(handle) => {
                    if handle.is_finished() {
                        let handle = handle_slot.take().unwrap();
                        let _ = handle.await;
                        return;
                    }
                }
                None => return,
            }
            drop(handle_slot);

            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        }
    }
}

/// Handed to the task's own future so it can observe cancellation and
/// register the bridge it is currently using, without giving the
/// runner write access to the registry entry itself.
#[derive(Clone)]
pub struct TaskContext {
    pub cancellation_token: CancellationToken,
    current_bridge: Arc<Mutex<Option<Arc<dyn AgentStub>>>>,
}

impl TaskContext {
    /// A fresh, unshared context: a new cancellation token and an empty
    /// bridge slot. Used by the servicer before it knows the join
    /// handle of the tokio task it is about to spawn with this context.
    pub fn new() -> Self {
        Self {
            cancellation_token: CancellationToken::new(),
            current_bridge: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn set_current_bridge(&self, bridge: Option<Arc<dyn AgentStub>>) {
        *self.current_bridge.lock().await = bridge;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use isolate_api_grpc::proto::isolate::v1::FunctionCall;
    use tonic::Status;

    use crate::bridge::AgentResultStream;

    struct FakeStub {
        terminated: Arc<AtomicUsize>,
        alive: AtomicBool,
    }

    #[async_trait]
    impl AgentStub for FakeStub {
        async fn run(&self, _call: FunctionCall) -> Result<AgentResultStream, Status> {
            Ok(Box::pin(futures::stream::empty()))
        }

        fn check_connectivity(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn terminate(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn cancel_terminates_the_bridge_currently_in_use() {
        let terminated = Arc::new(AtomicUsize::new(0));
        let stub: Arc<dyn AgentStub> = Arc::new(FakeStub {
            terminated: terminated.clone(),
            alive: AtomicBool::new(true),
        });

        // The handle and context share one cancellation token once
        // `BackgroundTask::new` wires them up, so build the context
        // first and spawn the task that watches it before handing the
        // join handle to the registry entry.
        let cancellation_token = CancellationToken::new();
        let current_bridge: Arc<Mutex<Option<Arc<dyn AgentStub>>>> = Arc::new(Mutex::new(Some(stub)));
        let token_for_task = cancellation_token.clone();
        let handle = tokio::spawn(async move {
            // Stands in for a runner loop cooperatively observing
            // cancellation in between pump iterations.
            token_for_task.cancelled().await;
        });
        let task = BackgroundTask {
            task_id: "task-1".to_string(),
            cancellation_token: cancellation_token.clone(),
            current_bridge: current_bridge.clone(),
            handle: Mutex::new(Some(handle)),
        };
        let context = TaskContext {
            cancellation_token,
            current_bridge,
        };

        tokio::select! {
            _ = task.cancel() => {},
            _ = tokio::time::sleep(Duration::from_secs(2)) => panic!("cancel() did not return promptly"),
        }

        assert!(context.is_cancelled());
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_returns_once_the_task_finishes_naturally() {
        let handle = tokio::spawn(async {});
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (task, context) = BackgroundTask::new_with_context("task-2".to_string(), handle);

        task.cancel().await;
        assert!(context.is_cancelled());
    }
}
