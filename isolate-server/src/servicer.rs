//! The gRPC surface itself: `IsolateGrpcApi` implements the generated
//! `Isolate` service trait by wiring each RPC to `isolate_executor`'s
//! pipeline, the background-task registry, and the runner pool.
//!
//! `Run` drains its task's queue straight onto the outbound stream,
//! emitting a synthetic keep-alive element whenever the pipeline has
//! gone quiet for `empty_message_interval` (`ISOLATE_EMPTY_MESSAGE_INTERVAL`).
//! `Submit` discards the same queue and only keeps the terminal
//! outcome, relying on the registry and `List`/`Cancel` for visibility.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use isolate_api_grpc::proto::isolate::v1::isolate_server::Isolate;
use isolate_api_grpc::proto::isolate::v1::{
    BoundFunction, CancelRequest, CancelResponse, ListRequest, ListResponse, PartialRunResult, SubmitRequest,
    SubmitResponse, TaskInfo,
};
use isolate_executor::error::RunError;
use isolate_executor::queue::{channel, Drained, DEFAULT_QUEUE_CAPACITY};
use isolate_executor::runner::{run_pipeline, PipelineDeps};
use isolate_executor::task::{BackgroundTask, TaskContext};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::metrics::Metrics;
use crate::pool::RunnerPool;
use crate::registry::TaskRegistry;

pub struct IsolateGrpcApi {
    pipeline_deps: PipelineDeps,
    empty_message_interval: Duration,
    registry: Arc<TaskRegistry>,
    pool: Arc<RunnerPool>,
    metrics: Metrics,
}

impl IsolateGrpcApi {
    pub fn new(
        pipeline_deps: PipelineDeps,
        registry: Arc<TaskRegistry>,
        pool: Arc<RunnerPool>,
        metrics: Metrics,
    ) -> Self {
        let empty_message_interval = pipeline_deps.config.empty_message_interval;
        Self {
            pipeline_deps,
            empty_message_interval,
            registry,
            pool,
            metrics,
        }
    }

    fn outcome_label(result: &Result<(), RunError>) -> &'static str {
        match result {
            Ok(()) => "completed",
            Err(RunError::Cancelled) => "cancelled",
            Err(_) => "failed",
        }
    }
}

#[tonic::async_trait]
impl Isolate for IsolateGrpcApi {
    type RunStream = Pin<Box<dyn Stream<Item = Result<PartialRunResult, Status>> + Send + 'static>>;

    async fn run(&self, request: Request<BoundFunction>) -> Result<Response<Self::RunStream>, Status> {
        let bound_function = request.into_inner();
        let (queue, mut drainer) = channel(DEFAULT_QUEUE_CAPACITY);
        let ctx = TaskContext::new();
        let deps = self.pipeline_deps.clone();
        let pipeline_ctx = ctx.clone();
        let pipeline_handle = tokio::spawn(async move { run_pipeline(bound_function, &deps, queue, pipeline_ctx).await });

        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let empty_message_interval = self.empty_message_interval;
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            loop {
                match drainer.recv_with_keepalive(empty_message_interval).await {
                    Drained::Message(message) => {
                        let is_complete = message.is_complete;
                        if tx.send(Ok(message)).await.is_err() {
                            ctx.cancellation_token.cancel();
                            break;
                        }
                        if is_complete {
                            break;
                        }
                    }
                    Drained::KeepAlive => {
                        let keep_alive = PartialRunResult {
                            is_complete: false,
                            logs: vec![],
                            result: None,
                        };
                        if tx.send(Ok(keep_alive)).await.is_err() {
                            ctx.cancellation_token.cancel();
                            break;
                        }
                    }
                    // The pipeline finished without ever enqueuing an
                    // `is_complete` element (a failure before dispatch,
                    // e.g. a bad request or a cancellation) - stop
                    // polling and fall through to report its status.
                    Drained::Closed => break,
                }
            }

            let outcome = pipeline_handle.await;
            match outcome {
                Ok(result) => {
                    metrics.record_run_completion(Self::outcome_label(&result));
                    if let Err(run_error) = result {
                        let status: Status = run_error.into();
                        let _ = tx.send(Err(status)).await;
                    }
                }
                Err(join_error) => {
                    metrics.record_run_completion("failed");
                    let _ = tx
                        .send(Err(Status::unknown(format!("pipeline task panicked: {join_error}"))))
                        .await;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::RunStream))
    }

    async fn submit(&self, request: Request<SubmitRequest>) -> Result<Response<SubmitResponse>, Status> {
        let bound_function = request
            .into_inner()
            .function
            .ok_or_else(|| Status::invalid_argument("SubmitRequest.function is required"))?;

        let task_id = uuid::Uuid::new_v4().to_string();
        let (queue, mut drainer) = channel(DEFAULT_QUEUE_CAPACITY);
        let ctx = TaskContext::new();
        let deps = self.pipeline_deps.clone();
        let pipeline_ctx = ctx.clone();
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        let task_id_for_completion = task_id.clone();

        let handle = self.pool.spawn(async move {
            // Submit callers only ever learn the terminal outcome through
            // List/Cancel; anything the pipeline enqueues along the way
            // (logs, partial results) has no reader. But it still has to
            // be read as it arrives, not just mopped up afterwards - the
            // pump's `queue.put(...).await` blocks once the bounded
            // channel fills, so without a concurrent drain a long-running
            // function that emits more than the channel's capacity would
            // wedge the pipeline forever and leak both the task and its
            // runner-pool permit.
            let discard = tokio::spawn(async move { drainer.drain_until_closed().await });
            let result = run_pipeline(bound_function, &deps, queue, pipeline_ctx).await;
            let _ = discard.await;
            metrics.record_task_completion(Self::outcome_label(&result));
            registry.remove(&task_id_for_completion);
        });

        let task = Arc::new(BackgroundTask::new(task_id.clone(), ctx, handle));
        self.registry.insert(task);
        self.metrics.record_submission();

        Ok(Response::new(SubmitResponse { task_id }))
    }

    async fn list(&self, _request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        let tasks = self
            .registry
            .list_ids()
            .into_iter()
            .map(|task_id| TaskInfo { task_id })
            .collect();
        Ok(Response::new(ListResponse { tasks }))
    }

    async fn cancel(&self, request: Request<CancelRequest>) -> Result<Response<CancelResponse>, Status> {
        let task_id = request.into_inner().task_id;
        // Idempotent: an unknown id is silently accepted rather than
        // reported as an error, matching a client that races a Cancel
        // against the task's own natural completion.
        if let Some(task) = self.registry.get(&task_id) {
            task.cancel().await;
            self.registry.remove(&task_id);
        }
        Ok(Response::new(CancelResponse {}))
    }
}
