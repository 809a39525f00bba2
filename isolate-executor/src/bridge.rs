//! Component 2 (agent bridge) and the collaborator interfaces component
//! 3 (bridge manager) pools.
//!
//! An agent bridge is a live connection to a worker-agent process that
//! has already loaded a particular environment. Spawning and wiring up
//! that process is an external concern - [`AgentBridgeFactory`] is the
//! seam - but once connected, every bridge looks the same to the rest
//! of this crate: it implements [`AgentStub`], and it knows how to
//! check whether it is still alive and how to shut itself down.

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use isolate_api_grpc::proto::isolate::v1::{FunctionCall, PartialRunResult};
use tonic::Status;

use crate::error::BridgeError;

pub type AgentResultStream = Pin<Box<dyn Stream<Item = Result<PartialRunResult, Status>> + Send>>;

/// The order-sensitive key the bridge manager pools agents by: the
/// primary environment path followed by every inheritance path, in the
/// order they were supplied. Two requests that name the same
/// environments in a different order are deliberately treated as
/// different pools, matching the tuple identity used upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentCacheKey(pub Vec<PathBuf>);

impl AgentCacheKey {
    pub fn new(primary_path: PathBuf, inheritance_paths: &[PathBuf]) -> Self {
        let mut paths = Vec::with_capacity(1 + inheritance_paths.len());
        paths.push(primary_path);
        paths.extend_from_slice(inheritance_paths);
        Self(paths)
    }
}

/// A live connection to a worker-agent process. `run` is called exactly
/// once per bridge (a fresh bridge is handed out per task); the bridge
/// is returned to the pool, or terminated, once the task that borrowed
/// it is done with it.
#[async_trait]
pub trait AgentStub: Send + Sync {
    async fn run(&self, call: FunctionCall) -> Result<AgentResultStream, Status>;

    /// Cheap liveness probe used by the bridge manager to decide
    /// whether a pooled bridge can be reused or must be replaced.
    fn check_connectivity(&self) -> bool;

    async fn terminate(&self);
}

/// Builds (and owns the lifecycle of) the worker-agent process behind a
/// bridge. Kept abstract so the orchestration pipeline can be tested
/// against an in-process fake instead of spawning a real subprocess.
#[async_trait]
pub trait AgentBridgeFactory: Send + Sync {
    async fn establish(
        &self,
        key: &AgentCacheKey,
    ) -> Result<std::sync::Arc<dyn AgentStub>, BridgeError>;
}

pub mod process {
    //! The production [`AgentBridgeFactory`]: spawns a worker-agent
    //! subprocess rooted at the primary environment's interpreter and
    //! connects to it over a Unix domain socket. Kept in its own module
    //! since it pulls in process-spawning and transport concerns that
    //! the rest of the crate doesn't need to know about.

    use std::path::PathBuf;
    use std::process::Stdio;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use isolate_api_grpc::proto::isolate::v1::FunctionCall;
    use tokio::net::UnixStream;
    use tokio::process::{Child, Command};
    use tonic::transport::{Channel, Endpoint, Uri};
    use tower::service_fn;
    use tracing::{debug, warn};

    use super::{AgentCacheKey, AgentResultStream, AgentStub};
    use crate::error::BridgeError;

    /// Path to the worker-agent executable to spawn. A thin wrapper so
    /// tests can point this at a stub binary.
    #[derive(Clone)]
    pub struct AgentBinary(pub PathBuf);

    pub struct ProcessAgentBridgeFactory {
        agent_binary: AgentBinary,
        socket_root: PathBuf,
        connect_timeout: Duration,
    }

    impl ProcessAgentBridgeFactory {
        pub fn new(agent_binary: AgentBinary, socket_root: PathBuf, connect_timeout: Duration) -> Self {
            Self {
                agent_binary,
                socket_root,
                connect_timeout,
            }
        }
    }

    #[async_trait]
    impl AgentBridgeFactory for ProcessAgentBridgeFactory {
        async fn establish(&self, key: &AgentCacheKey) -> Result<std::sync::Arc<dyn AgentStub>, BridgeError> {
            let primary_path = key
                .0
                .first()
                .ok_or_else(|| BridgeError::Establish("cache key has no primary path".to_string()))?;

            let socket_path = self.socket_root.join(format!("agent-{}.sock", uuid::Uuid::new_v4()));
            let _ = tokio::fs::remove_file(&socket_path).await;

            let mut command = Command::new(&self.agent_binary.0);
            command
                .arg("--socket")
                .arg(&socket_path)
                .env("PATH", primary_path)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);

            for inheritance_path in &key.0[1..] {
                command.env(
                    format!("ISOLATE_INHERIT_{}", key.0.iter().position(|p| p == inheritance_path).unwrap_or(0)),
                    inheritance_path,
                );
            }

            let child = command
                .spawn()
                .map_err(|e| BridgeError::Establish(format!("failed to spawn agent process: {e}")))?;

            let channel = connect_with_retry(&socket_path, self.connect_timeout)
                .await
                .map_err(|e| BridgeError::Establish(format!("failed to connect to agent over {socket_path:?}: {e}")))?;

            Ok(std::sync::Arc::new(ProcessAgentStub {
                channel,
                child: tokio::sync::Mutex::new(Some(child)),
                alive: AtomicBool::new(true),
            }))
        }
    }

    async fn connect_with_retry(socket_path: &PathBuf, timeout: Duration) -> Result<Channel, tonic::transport::Error> {
        let socket_path = socket_path.clone();
        // The URI is unused by the UDS connector; tonic requires one.
        Endpoint::try_from("http://[::]:50051")
            .expect("static URI is always valid")
            .connect_timeout(timeout)
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket_path = socket_path.clone();
                async move { UnixStream::connect(socket_path).await.map(hyper_util::rt::TokioIo::new) }
            }))
            .await
    }

    struct ProcessAgentStub {
        channel: Channel,
        child: tokio::sync::Mutex<Option<Child>>,
        alive: AtomicBool,
    }

    #[async_trait]
    impl AgentStub for ProcessAgentStub {
        async fn run(&self, call: FunctionCall) -> Result<AgentResultStream, tonic::Status> {
            use isolate_api_grpc::proto::isolate::v1::agent_client::AgentClient;

            let mut client = AgentClient::new(self.channel.clone());
            let response = client.run(call).await?;
            let stream = response.into_inner();
            Ok(Box::pin(stream) as AgentResultStream)
        }

        fn check_connectivity(&self) -> bool {
            self.alive.load(Ordering::Relaxed)
        }

        async fn terminate(&self) {
            self.alive.store(false, Ordering::Relaxed);
            if let Some(mut child) = self.child.lock().await.take() {
                if let Err(e) = child.kill().await {
                    warn!("failed to kill agent process: {e}");
                } else {
                    debug!("terminated agent process");
                }
            }
        }
    }
}
