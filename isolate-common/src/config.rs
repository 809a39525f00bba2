use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bound implemented by every service's top-level config struct: it must
/// be constructible with reasonable defaults so a fresh checkout can run
/// without a config file at all.
pub trait ConfigLoaderConfig: Default + Serialize + DeserializeOwned {}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoaderConfig for T {}

/// Loads a `T` by layering, in increasing priority: the struct's
/// `Default`, an optional TOML file, and environment variables prefixed
/// with `ISOLATE__` (double underscore separates nesting, e.g.
/// `ISOLATE__TRACING__LEVEL`).
pub struct ConfigLoader<T> {
    pub config_file_name: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> Self {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn load(&self) -> figment::Result<T> {
        let mut figment = Figment::from(Serialized::defaults(T::default()));

        if self.config_file_name.exists() {
            figment = figment.merge(Toml::file(&self.config_file_name));
        }

        figment
            .merge(Env::prefixed("ISOLATE__").split("__"))
            .extract()
    }

    /// Loads the config, unless `--dump-config` (or `DUMP_CONFIG=1`) was
    /// passed, in which case the effective config is printed as TOML to
    /// stdout and `None` is returned so the caller can exit without
    /// starting the server.
    pub fn load_or_dump_config(&self) -> Option<T> {
        let dump_requested = std::env::args().any(|arg| arg == "--dump-config")
            || std::env::var("DUMP_CONFIG").as_deref() == Ok("1");

        if dump_requested {
            let config = self.load().expect("Failed to load config for dumping");
            println!(
                "{}",
                toml::to_string_pretty(&config).expect("Failed to serialize config")
            );
            None
        } else {
            Some(self.load().expect("Failed to load config"))
        }
    }
}
