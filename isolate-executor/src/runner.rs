//! Component 5 (task runner): the build -> connect -> dispatch -> drain
//! pipeline for one request.
//!
//! This module owns everything in the spec's ordering contract except
//! the final hop to the outbound RPC stream - that belongs to whatever
//! drains the [`MessageQueue`] this pipeline writes into (the streaming
//! `Run` handler for a synchronous request, or a discard loop for a
//! `Submit`ted one). Keeping the drain external is what lets the same
//! pipeline serve both.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use isolate_api_grpc::proto::isolate::v1::{BoundFunction, FunctionCall, Log, PartialRunResult};
use tracing::warn;

use crate::bridge::{AgentCacheKey, AgentStub};
use crate::bridge_manager::BridgeManager;
use crate::environment::{decode_environment, Environment, LocalEnvironment, RunSettings, VirtualEnvironment};
use crate::error::RunError;
use crate::queue::MessageQueue;
use crate::task::TaskContext;

/// Process-wide knobs threaded through every pipeline run; the Rust
/// analogue of the module-level constants the reference server reads
/// once from the environment at startup (`ISOLATE_EMPTY_MESSAGE_INTERVAL`,
/// `ISOLATE_INHERIT_FROM_LOCAL`, `AGENT_REQUIREMENTS_TXT`). Bridge
/// acquisition's own timeout (`ISOLATE_MAX_GRPC_WAIT_TIMEOUT`) is baked
/// into the `AgentBridgeFactory` implementation instead, since it only
/// matters at the one call site that establishes a bridge from scratch.
#[derive(Clone)]
pub struct PipelineConfig {
    /// How long the drainer may block on an empty queue before emitting
    /// a synthetic keep-alive element. Read by the drainer, not by this
    /// module directly, but kept here since it is part of the same
    /// env-var-sourced configuration bundle.
    pub empty_message_interval: Duration,
    pub cache_root: PathBuf,
    pub inherit_from_local: bool,
    pub agent_requirements: Vec<String>,
}

/// The dependencies a pipeline run needs beyond the request itself.
#[derive(Clone)]
pub struct PipelineDeps {
    pub bridge_manager: Arc<BridgeManager>,
    pub config: PipelineConfig,
}

/// Runs one request to completion, writing every `PartialRunResult` it
/// produces into `queue`. Returns once the agent's stream has been
/// fully forwarded (success) or a step in the pipeline has failed.
///
/// Steps mirror the task runner's numbered list: decode/validate,
/// inject agent-requirements and local-inheritance environments, build
/// each environment in order while honoring cancellation, acquire a
/// pooled bridge keyed by the resulting paths, dispatch the call, and
/// classify whatever the pump reports.
pub async fn run_pipeline(
    request: BoundFunction,
    deps: &PipelineDeps,
    queue: MessageQueue,
    ctx: TaskContext,
) -> Result<(), RunError> {
    if request.environments.is_empty() {
        return Err(RunError::BadRequest(
            "At least one environment must be specified for a run!".to_string(),
        ));
    }

    let mut environments: Vec<(bool, Arc<dyn Environment>)> = request
        .environments
        .iter()
        .map(|def| decode_environment(def, &deps.config.cache_root))
        .collect::<Result<_, _>>()?;

    let serialization_method = request
        .function
        .as_ref()
        .map(|f| f.method.clone())
        .unwrap_or_default();

    let log_hook_queue = queue.clone();
    let log_hook = Arc::new(move |log: Log| {
        log_hook_queue.put_nowait(PartialRunResult {
            is_complete: false,
            logs: vec![log],
            result: None,
        });
    });

    let run_settings = RunSettings {
        log_hook,
        serialization_method,
    };

    // Step 3: a non-empty AGENT_REQUIREMENTS list becomes an extra
    // inheritance environment at index 1, so the primary (index 0)
    // keeps its own `force` flag untouched.
    if !deps.config.agent_requirements.is_empty() {
        let agent_environment: Arc<dyn Environment> = Arc::new(VirtualEnvironment {
            requirements: deps.config.agent_requirements.clone(),
            cache_root: deps.config.cache_root.clone(),
        });
        environments.insert(1, (false, agent_environment));
    }

    // Step 4: INHERIT_FROM_LOCAL appends the current host's runtime
    // after every declared inheritance path, rather than as an
    // environment that gets built - it already exists.
    let mut extra_inheritance_paths = Vec::new();
    if deps.config.inherit_from_local {
        extra_inheritance_paths.push(LocalEnvironment::current_host().runtime_path);
    }

    // Step 5: build sequentially, in order, honoring cancellation
    // between (not during) each build.
    let mut environment_paths = Vec::with_capacity(environments.len());
    for (force, environment) in &environments {
        let path = build_one(environment.as_ref(), *force, &run_settings, &ctx).await?;
        environment_paths.push(path);
    }

    let mut paths = environment_paths.into_iter();
    let primary_path = paths.next().expect("validated non-empty above");
    let inheritance_paths: Vec<PathBuf> = paths.chain(extra_inheritance_paths).collect();

    // Step 6: acquire a pooled bridge. The lease is held through
    // dispatch and either released (success) or left to drop
    // (failure), which terminates the agent - see `BridgeManager`.
    let key = AgentCacheKey::new(primary_path, &inheritance_paths);
    let lease = deps
        .bridge_manager
        .acquire(key)
        .await
        .map_err(|e| RunError::ServerBug(format!("failed to acquire an agent bridge: {e}")))?;
    let stub = lease.stub();
    ctx.set_current_bridge(Some(stub.clone())).await;

    let call = FunctionCall {
        function: request.function,
        setup_func: request.setup_func,
    };

    // Step 7/8: dispatch and classify. The pump is spawned on its own
    // task so that cancellation (a dropped outbound stream, or an
    // explicit `Cancel`) can race it instead of waiting for the agent
    // to notice on its own.
    let pump_queue = queue.clone();
    let pump_stub = stub.clone();
    let pump_handle = tokio::spawn(async move { pump(pump_stub, call, pump_queue).await });

    let outcome = tokio::select! {
        _ = ctx.cancellation_token.cancelled() => Err(RunError::Cancelled),
        joined = pump_handle => match joined {
            Ok(result) => result,
            Err(join_error) => {
                let message = format!("pump task panicked: {join_error}");
                queue
                    .put(error_log(&message))
                    .await;
                Err(RunError::ServerBug(message))
            }
        },
    };

    ctx.set_current_bridge(None).await;

    match outcome {
        Ok(()) => {
            deps.bridge_manager.release(lease).await;
            Ok(())
        }
        Err(err) => {
            // `lease` is dropped here without `release`, which
            // terminates the bridge rather than returning a possibly
            // wedged connection to the pool.
            Err(err)
        }
    }
}

async fn build_one(
    environment: &dyn Environment,
    force: bool,
    settings: &RunSettings,
    ctx: &TaskContext,
) -> Result<PathBuf, RunError> {
    let create = environment.create(force, settings);
    tokio::pin!(create);
    tokio::select! {
        _ = ctx.cancellation_token.cancelled() => Err(RunError::Cancelled),
        result = &mut create => result.map_err(|e| RunError::BuildFailure(e.0)),
    }
}

/// Forwards every element `stub.run(call)` yields into `queue`, in
/// order. The final element the agent sends (with `is_complete=true`
/// and a `result`) ends up on the stream exactly this way - there is no
/// separate "synthesize the terminal element" step on the success path.
async fn pump(stub: Arc<dyn AgentStub>, call: FunctionCall, queue: MessageQueue) -> Result<(), RunError> {
    use futures::StreamExt;

    let mut stream = stub.run(call).await?;
    while let Some(item) = stream.next().await {
        match item {
            Ok(message) => queue.put(message).await,
            Err(status) => return Err(classify_agent_status(status)),
        }
    }
    Ok(())
}

/// Distinguishes a structured agent-internal failure from a bare
/// transport-level `RpcError`. The out-of-scope agent process signals
/// the former by setting the `x-isolate-agent-error` trailer on the
/// status it returns (the one detail of its wire contract this crate
/// depends on); anything else is treated as a bridge/transport fault
/// and passed through with its original code.
fn classify_agent_status(status: tonic::Status) -> RunError {
    let is_agent_error = status
        .metadata()
        .get("x-isolate-agent-error")
        .map(|v| v.as_bytes() == b"1")
        .unwrap_or(false);

    if is_agent_error {
        RunError::AgentFailure(status.message().to_string())
    } else {
        warn!(code = ?status.code(), "agent bridge returned a transport-level error");
        RunError::BridgeFailure { status }
    }
}

fn error_log(message: &str) -> PartialRunResult {
    use isolate_api_grpc::proto::isolate::v1::{LogLevel, LogSource};

    PartialRunResult {
        is_complete: false,
        logs: vec![Log {
            message: message.to_string(),
            level: LogLevel::Error as i32,
            source: LogSource::Bridge as i32,
        }],
        result: None,
    }
}
