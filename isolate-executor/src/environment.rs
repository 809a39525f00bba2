//! Component 1 (Environment handle).
//!
//! The real builders - virtualenv creation, package installation, path
//! layout - are out of scope for this crate; they are external
//! collaborators reached through the [`Environment`] trait. What lives
//! here is the trait itself, the registry that turns a wire-level
//! `EnvironmentDefinition` into a concrete builder, and two lightweight
//! reference implementations (`virtualenv`, `local`) that are enough to
//! drive the orchestration pipeline end to end in tests and in a
//! single-host deployment.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use isolate_api_grpc::proto::isolate::v1::{EnvironmentDefinition, Log, LogLevel, LogSource};
use sha2::{Digest, Sha256};

use crate::error::{EnvironmentCreationError, RunError};

pub type LogHook = Arc<dyn Fn(Log) + Send + Sync>;

/// Everything a builder needs in order to make its emitted logs land on
/// the caller's stream, and to know how the function it will eventually
/// run was serialized.
#[derive(Clone)]
pub struct RunSettings {
    pub log_hook: LogHook,
    pub serialization_method: String,
}

impl RunSettings {
    fn log(&self, message: impl Into<String>, level: LogLevel) {
        (self.log_hook)(Log {
            message: message.into(),
            level: level as i32,
            source: LogSource::Builder as i32,
        });
    }
}

#[async_trait]
pub trait Environment: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Materializes the environment on disk, returning the filesystem
    /// path new agent processes should be rooted at. Must be safe to
    /// call repeatedly; `force` requests a from-scratch rebuild even if
    /// a cached copy exists.
    async fn create(
        &self,
        force: bool,
        settings: &RunSettings,
    ) -> Result<PathBuf, EnvironmentCreationError>;
}

/// Builds (or reuses) a virtualenv-shaped directory keyed by a hash of
/// its requirement list. Standing in for a real package installer: it
/// writes a manifest and emits a couple of `BUILDER` log lines per
/// requirement rather than invoking a package manager.
pub struct VirtualEnvironment {
    pub requirements: Vec<String>,
    pub cache_root: PathBuf,
}

#[async_trait]
impl Environment for VirtualEnvironment {
    fn kind(&self) -> &'static str {
        "virtualenv"
    }

    async fn create(
        &self,
        force: bool,
        settings: &RunSettings,
    ) -> Result<PathBuf, EnvironmentCreationError> {
        let mut hasher = Sha256::new();
        for requirement in &self.requirements {
            hasher.update(requirement.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hex::encode(hasher.finalize());
        let path = self.cache_root.join("virtualenv").join(digest);

        if force && path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| EnvironmentCreationError(format!("failed to clear {path:?}: {e}")))?;
        }

        if path.exists() {
            settings.log(format!("Reusing cached virtualenv at {}", path.display()), LogLevel::Debug);
            return Ok(path);
        }

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| EnvironmentCreationError(format!("failed to create {path:?}: {e}")))?;

        settings.log(
            format!("Creating virtualenv with {} requirement(s)", self.requirements.len()),
            LogLevel::Info,
        );
        for requirement in &self.requirements {
            settings.log(format!("Installing {requirement}"), LogLevel::Debug);
        }

        let manifest = path.join("requirements.txt");
        tokio::fs::write(&manifest, self.requirements.join("\n"))
            .await
            .map_err(|e| EnvironmentCreationError(format!("failed to write manifest: {e}")))?;

        Ok(path)
    }
}

/// Inherits the current host's runtime in place rather than building
/// anything; used for `ISOLATE_INHERIT_FROM_LOCAL` and as a fallback
/// when an environment kind doesn't need isolation at all.
pub struct LocalEnvironment {
    pub runtime_path: PathBuf,
}

impl LocalEnvironment {
    pub fn current_host() -> Self {
        let runtime_path = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self { runtime_path }
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn create(
        &self,
        _force: bool,
        _settings: &RunSettings,
    ) -> Result<PathBuf, EnvironmentCreationError> {
        Ok(self.runtime_path.clone())
    }
}

/// Decodes one wire-level `EnvironmentDefinition` into `(force,
/// environment)`. The only two kinds known to this crate are
/// `virtualenv` and `local`; anything else is a `BadRequest`, matching
/// the "unknown environment kind" scenario in the spec.
pub fn decode_environment(
    def: &EnvironmentDefinition,
    cache_root: &Path,
) -> Result<(bool, Arc<dyn Environment>), RunError> {
    match def.kind.as_str() {
        "virtualenv" => {
            let requirements = def
                .configuration
                .as_ref()
                .and_then(|s| s.fields.get("requirements"))
                .and_then(|v| v.kind.as_ref())
                .map(|kind| match kind {
                    prost_types::value::Kind::ListValue(list) => list
                        .values
                        .iter()
                        .filter_map(|v| match &v.kind {
                            Some(prost_types::value::Kind::StringValue(s)) => Some(s.clone()),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                    _ => Vec::new(),
                })
                .unwrap_or_default();

            Ok((
                def.force,
                Arc::new(VirtualEnvironment {
                    requirements,
                    cache_root: cache_root.to_path_buf(),
                }),
            ))
        }
        "local" => Ok((def.force, Arc::new(LocalEnvironment::current_host()))),
        other => Err(RunError::BadRequest(format!(
            "Unknown environment kind: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn noop_settings() -> RunSettings {
        RunSettings {
            log_hook: Arc::new(|_| {}),
            serialization_method: "pickle".to_string(),
        }
    }

    #[tokio::test]
    async fn virtualenv_create_is_idempotent_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let env = VirtualEnvironment {
            requirements: vec!["pyjokes".to_string()],
            cache_root: dir.path().to_path_buf(),
        };
        let settings = noop_settings();
        let first = env.create(false, &settings).await.unwrap();
        let second = env.create(false, &settings).await.unwrap();
        assert_eq!(first, second);
        assert!(first.join("requirements.txt").exists());
    }

    #[tokio::test]
    async fn virtualenv_force_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let env = VirtualEnvironment {
            requirements: vec!["pyjokes".to_string()],
            cache_root: dir.path().to_path_buf(),
        };
        let settings = noop_settings();
        let path = env.create(false, &settings).await.unwrap();
        tokio::fs::write(path.join("marker"), b"x").await.unwrap();
        let rebuilt = env.create(true, &settings).await.unwrap();
        assert_eq!(path, rebuilt);
        assert!(!rebuilt.join("marker").exists());
    }

    #[tokio::test]
    async fn virtualenv_emits_logs() {
        let dir = tempfile::tempdir().unwrap();
        let env = VirtualEnvironment {
            requirements: vec!["a".to_string(), "b".to_string()],
            cache_root: dir.path().to_path_buf(),
        };
        let logs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let logs2 = logs.clone();
        let settings = RunSettings {
            log_hook: Arc::new(move |log| logs2.lock().unwrap().push(log.message)),
            serialization_method: "pickle".to_string(),
        };
        env.create(false, &settings).await.unwrap();
        let logged = logs.lock().unwrap();
        assert!(logged.iter().any(|l| l.contains("Installing a")));
        assert!(logged.iter().any(|l| l.contains("Installing b")));
    }

    #[test]
    fn decode_unknown_kind_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let def = EnvironmentDefinition {
            kind: "does-not-exist".to_string(),
            configuration: None,
            force: false,
        };
        let err = decode_environment(&def, dir.path()).unwrap_err();
        assert!(matches!(err, RunError::BadRequest(msg) if msg.contains("does-not-exist")));
    }
}
