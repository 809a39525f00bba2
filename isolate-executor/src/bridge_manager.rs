//! Component 3 (bridge manager): pools agent bridges by
//! [`AgentCacheKey`], reusing a previously established connection
//! whenever one is available and still reports itself healthy.
//!
//! The pool is a plain `HashMap<AgentCacheKey, Vec<Box<dyn AgentStub>>>`
//! behind a mutex. Every critical section is a handful of `Vec`
//! operations - nothing async happens while the lock is held.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::bridge::{AgentBridgeFactory, AgentCacheKey, AgentStub};
use crate::error::BridgeError;

#[derive(Default)]
struct Pools {
    agents: HashMap<AgentCacheKey, Vec<Arc<dyn AgentStub>>>,
}

pub struct BridgeManager {
    factory: Arc<dyn AgentBridgeFactory>,
    pools: Mutex<Pools>,
}

/// A bridge borrowed from the manager. Dropping it without calling
/// [`Lease::release`] terminates the underlying agent rather than
/// risking a half-used connection re-entering the pool; callers that
/// finish cleanly should release explicitly.
pub struct Lease {
    key: AgentCacheKey,
    stub: Option<Arc<dyn AgentStub>>,
}

impl Lease {
    pub fn stub(&self) -> Arc<dyn AgentStub> {
        self.stub.clone().expect("lease used after release")
    }
}

impl BridgeManager {
    pub fn new(factory: Arc<dyn AgentBridgeFactory>) -> Self {
        Self {
            factory,
            pools: Mutex::new(Pools::default()),
        }
    }

    /// Hands out a healthy bridge for `key`, reusing one from the pool
    /// when possible. Stale entries (failed connectivity check) are
    /// terminated and dropped as the pool is walked.
    pub async fn acquire(&self, key: AgentCacheKey) -> Result<Lease, BridgeError> {
        let reused = {
            let mut pools = self.pools.lock().await;
            let bucket = pools.agents.entry(key.clone()).or_default();
            let mut found = None;
            while let Some(candidate) = bucket.pop() {
                if candidate.check_connectivity() {
                    found = Some(candidate);
                    break;
                } else {
                    candidate.terminate().await;
                }
            }
            found
        };

        let stub = match reused {
            Some(stub) => {
                debug!(?key, "reusing pooled agent bridge");
                stub
            }
            None => {
                debug!(?key, "establishing new agent bridge");
                self.factory.establish(&key).await?
            }
        };

        Ok(Lease {
            key,
            stub: Some(stub),
        })
    }

    /// Returns a bridge to the pool for future reuse. Call this instead
    /// of letting the lease drop once a task is done with its bridge
    /// and the bridge is still healthy.
    pub async fn release(&self, mut lease: Lease) {
        if let Some(stub) = lease.stub.take() {
            let mut pools = self.pools.lock().await;
            pools.agents.entry(lease.key).or_default().push(stub);
        }
    }

    /// Terminates every pooled bridge. Called on shutdown.
    pub async fn terminate_all(&self) {
        let mut pools = self.pools.lock().await;
        for (_, bucket) in pools.agents.drain() {
            for agent in bucket {
                agent.terminate().await;
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(stub) = self.stub.take() {
            // Dropped without an explicit `release`: treat as abandoned
            // rather than leaking the underlying process. `terminate`
            // is async, so this has to be fire-and-forget from a sync
            // `Drop`; `tokio::spawn` only works inside a runtime, which
            // every caller of `acquire` is already running in.
            tokio::spawn(async move {
                stub.terminate().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use isolate_api_grpc::proto::isolate::v1::FunctionCall;
    use tonic::Status;

    use crate::bridge::AgentResultStream;

    struct FakeStub {
        alive: AtomicBool,
        terminated: Arc<AtomicUsize>,
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

    struct FakeFactory {
        established: Arc<AtomicUsize>,
        terminated: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentBridgeFactory for FakeFactory {
        async fn establish(&self, _key: &AgentCacheKey) -> Result<Arc<dyn AgentStub>, BridgeError> {
            self.established.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeStub {
                alive: AtomicBool::new(true),
                terminated: self.terminated.clone(),
            }))
        }
    }

    fn key(n: u8) -> AgentCacheKey {
        AgentCacheKey::new(PathBuf::from(format!("/env/{n}")), &[])
    }

    #[tokio::test]
    async fn reuses_a_released_bridge_instead_of_establishing_a_new_one() {
        let established = Arc::new(AtomicUsize::new(0));
        let terminated = Arc::new(AtomicUsize::new(0));
        let manager = BridgeManager::new(Arc::new(FakeFactory {
            established: established.clone(),
            terminated: terminated.clone(),
        }));

        let lease = manager.acquire(key(1)).await.unwrap();
        manager.release(lease).await;

        let _lease = manager.acquire(key(1)).await.unwrap();
        assert_eq!(established.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_cache_keys_get_independent_pools() {
        let established = Arc::new(AtomicUsize::new(0));
        let terminated = Arc::new(AtomicUsize::new(0));
        let manager = BridgeManager::new(Arc::new(FakeFactory {
            established: established.clone(),
            terminated: terminated.clone(),
        }));

        let a = manager.acquire(key(1)).await.unwrap();
        let b = manager.acquire(key(2)).await.unwrap();
        manager.release(a).await;
        manager.release(b).await;

        assert_eq!(established.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminate_all_drains_every_pooled_bridge() {
        let established = Arc::new(AtomicUsize::new(0));
        let terminated = Arc::new(AtomicUsize::new(0));
        let manager = BridgeManager::new(Arc::new(FakeFactory {
            established: established.clone(),
            terminated: terminated.clone(),
        }));

        let lease = manager.acquire(key(1)).await.unwrap();
        manager.release(lease).await;
        manager.terminate_all().await;

        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }
}
