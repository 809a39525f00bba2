use std::path::PathBuf;
use std::time::Duration;

use isolate_common::config::ConfigLoader;
use isolate_common::tracing::TracingConfig;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IsolateServerConfig {
    pub tracing: TracingConfig,
    pub grpc_host: String,
    pub grpc_port: u16,
    #[serde(with = "humantime_serde")]
    pub empty_message_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_grpc_wait_timeout: Duration,
    pub inherit_from_local: bool,
    pub max_threads: usize,
    pub agent_requirements_txt: Option<PathBuf>,
    pub cache_root: PathBuf,
    pub socket_root: PathBuf,
    pub agent_binary: PathBuf,
}

impl Default for IsolateServerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("isolate-server"),
            grpc_host: "[::]".to_string(),
            grpc_port: 50001,
            empty_message_interval: Duration::from_secs(600),
            max_grpc_wait_timeout: Duration::from_secs(10),
            inherit_from_local: false,
            max_threads: 5,
            agent_requirements_txt: None,
            cache_root: PathBuf::from("/tmp/isolate/envs"),
            socket_root: PathBuf::from("/tmp/isolate/sockets"),
            agent_binary: PathBuf::from("isolate-agent"),
        }
    }
}

impl IsolateServerConfig {
    pub fn grpc_address(&self) -> String {
        format!("{}:{}", self.grpc_host, self.grpc_port)
    }

    /// The extra inheritance requirements `AGENT_REQUIREMENTS_TXT`
    /// names, one per line, skipping blanks. Missing or unreadable
    /// files are treated the same as "not configured" rather than a
    /// startup error, since the variable is optional.
    pub fn agent_requirements(&self) -> Vec<String> {
        self.agent_requirements_txt
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|contents| {
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Applies the five environment variables the service's external
    /// interface names verbatim (`ISOLATE_EMPTY_MESSAGE_INTERVAL`,
    /// `ISOLATE_MAX_GRPC_WAIT_TIMEOUT`, `ISOLATE_INHERIT_FROM_LOCAL`,
    /// `MAX_THREADS`, `AGENT_REQUIREMENTS_TXT`) on top of whatever the
    /// figment-layered config produced. They predate - and don't
    /// follow - this crate's `ISOLATE__`-nested env convention, so they
    /// are layered on as an explicit override pass instead.
    pub fn with_spec_env_overrides(mut self) -> Self {
        if let Some(secs) = parse_env_f64("ISOLATE_EMPTY_MESSAGE_INTERVAL") {
            self.empty_message_interval = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = parse_env_f64("ISOLATE_MAX_GRPC_WAIT_TIMEOUT") {
            self.max_grpc_wait_timeout = Duration::from_secs_f64(secs);
        }
        if std::env::var("ISOLATE_INHERIT_FROM_LOCAL").as_deref() == Ok("1") {
            self.inherit_from_local = true;
        }
        if let Ok(value) = std::env::var("MAX_THREADS") {
            if let Ok(n) = value.parse::<usize>() {
                self.max_threads = n;
            }
        }
        if let Ok(value) = std::env::var("AGENT_REQUIREMENTS_TXT") {
            self.agent_requirements_txt = Some(PathBuf::from(value));
        }
        self
    }
}

fn parse_env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|v| v.parse::<f64>().ok())
}

pub fn make_config_loader() -> ConfigLoader<IsolateServerConfig> {
    ConfigLoader::new(&PathBuf::from("config/isolate-server.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_is_loadable() {
        make_config_loader().load().expect("failed to load config");
    }

    #[test]
    fn spec_env_overrides_take_precedence() {
        std::env::set_var("MAX_THREADS", "11");
        std::env::set_var("ISOLATE_INHERIT_FROM_LOCAL", "1");

        let config = IsolateServerConfig::default().with_spec_env_overrides();

        assert_eq!(config.max_threads, 11);
        assert!(config.inherit_from_local);

        std::env::remove_var("MAX_THREADS");
        std::env::remove_var("ISOLATE_INHERIT_FROM_LOCAL");
    }

    #[test]
    fn agent_requirements_reads_lines_from_the_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requirements.txt");
        std::fs::write(&path, "pyjokes\n\nrequests\n").unwrap();

        let mut config = IsolateServerConfig::default();
        config.agent_requirements_txt = Some(path);

        assert_eq!(config.agent_requirements(), vec!["pyjokes", "requests"]);
    }

    #[test]
    fn agent_requirements_is_empty_when_unset() {
        let config = IsolateServerConfig::default();
        assert!(config.agent_requirements().is_empty());
    }
}
