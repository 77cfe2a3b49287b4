//! Runtime configuration.
//!
//! Every field carries a default, so an empty file (or no file at all) gives
//! a working setup. Values are layered: optional config file first, then
//! `ASTRO_`-prefixed environment variables, where `__` separates sections,
//! e.g. `ASTRO_FETCH__WORKER_THREADS=8`.

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{AstroError, Result};

pub const ENV_PREFIX: &str = "ASTRO";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AstroConfig {
    /// Worker pool and HTTP client settings.
    pub fetch: FetchConfig,
    /// Consumer-side grid settings.
    pub gallery: GalleryConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Threads in the fetch worker pool.
    pub worker_threads: usize,
    /// Whole-request timeout; an elapsed timeout is reported as a transport
    /// failure.
    pub request_timeout_ms: u64,
    pub pool_max_idle_per_host: usize,
    pub user_agent: String,
    /// Rewrite `http` image links to `https` before fetching.
    pub upgrade_to_https: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            request_timeout_ms: 30_000,
            pool_max_idle_per_host: 10,
            user_agent: concat!("astro-gallery/", env!("CARGO_PKG_VERSION"))
                .to_string(),
            upgrade_to_https: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
    /// Number of reusable display slots.
    pub slots: usize,
    /// How long the consumer waits for deliveries before moving on.
    pub drain_wait_ms: u64,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            slots: 6,
            drain_wait_ms: 1_500,
        }
    }
}

impl AstroConfig {
    /// Load from an optional file plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config: AstroConfig =
            builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch.worker_threads == 0 {
            return Err(AstroError::InvalidConfig(
                "fetch.worker_threads must be at least 1".to_string(),
            ));
        }
        if self.fetch.request_timeout_ms == 0 {
            return Err(AstroError::InvalidConfig(
                "fetch.request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.gallery.slots == 0 {
            return Err(AstroError::InvalidConfig(
                "gallery.slots must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
