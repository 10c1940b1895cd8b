//! Configuration loading for extraction-run.

use crate::{CoordinatorOptions, DEFAULT_RETAINED_RUNS};
use anyhow::{Context, Result};
use extraction_core::InvocationKind;
use extraction_storage::{S3Config, DEFAULT_LIST_PAGE_SIZE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    pub storage: Option<StorageConfig>,
    pub invoker: Option<InvokerConfig>,
    pub pipeline: Option<PipelineConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Local,
    S3,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct StorageConfig {
    pub backend: Option<StorageBackend>,
    pub root: Option<PathBuf>,
    pub s3: Option<S3Section>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct S3Section {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub prefix: Option<String>,
}

/// One external command line per invocation kind
#[derive(Debug, Deserialize, Default, Clone)]
pub struct InvokerConfig {
    pub split: Option<Vec<String>>,
    pub embed: Option<Vec<String>>,
    pub search: Option<Vec<String>>,
    pub extract: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub split_timeout_secs: Option<u64>,
    pub embed_timeout_secs: Option<u64>,
    pub search_timeout_secs: Option<u64>,
    pub extract_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct PipelineConfig {
    pub fail_fast: Option<bool>,
    pub run_timeout_secs: Option<u64>,
    pub list_page_size: Option<usize>,
    pub retained_runs: Option<usize>,
}

/// Default staging directory for the local backend
pub const DEFAULT_STAGING_ROOT: &str = "staging";

/// Default per-invocation timeout (15 minutes)
pub const DEFAULT_INVOCATION_TIMEOUT_SECS: u64 = 900;

impl InvokerConfig {
    pub fn command(&self, kind: InvocationKind) -> Option<&[String]> {
        match kind {
            InvocationKind::Split => self.split.as_deref(),
            InvocationKind::Embed => self.embed.as_deref(),
            InvocationKind::Search => self.search.as_deref(),
            InvocationKind::Extract => self.extract.as_deref(),
        }
    }

    /// Kind-specific timeout, else the shared one, else the default
    pub fn timeout(&self, kind: InvocationKind) -> Duration {
        let specific = match kind {
            InvocationKind::Split => self.split_timeout_secs,
            InvocationKind::Embed => self.embed_timeout_secs,
            InvocationKind::Search => self.search_timeout_secs,
            InvocationKind::Extract => self.extract_timeout_secs,
        };
        Duration::from_secs(
            specific
                .or(self.timeout_secs)
                .unwrap_or(DEFAULT_INVOCATION_TIMEOUT_SECS),
        )
    }
}

impl Config {
    pub fn storage_backend(&self) -> StorageBackend {
        self.storage
            .as_ref()
            .and_then(|storage| storage.backend)
            .unwrap_or_default()
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|storage| storage.root.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_ROOT))
    }

    /// S3 settings layered over [`S3Config::default`]
    pub fn s3_config(&self) -> S3Config {
        let mut config = S3Config::default();
        let Some(section) = self.storage.as_ref().and_then(|s| s.s3.as_ref()) else {
            return config;
        };
        if let Some(bucket) = &section.bucket {
            config.bucket = bucket.clone();
        }
        if let Some(region) = &section.region {
            config.region = region.clone();
        }
        if section.endpoint.is_some() {
            config.endpoint = section.endpoint.clone();
        }
        if let Some(key) = &section.access_key_id {
            config.access_key_id = key.clone();
        }
        if let Some(secret) = &section.secret_access_key {
            config.secret_access_key = secret.clone();
        }
        if let Some(prefix) = &section.prefix {
            config.prefix = prefix.clone();
        }
        config
    }

    pub fn invoker(&self) -> InvokerConfig {
        self.invoker.clone().unwrap_or_default()
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        let pipeline = self.pipeline.clone().unwrap_or_default();
        CoordinatorOptions {
            fail_fast: pipeline.fail_fast.unwrap_or(false),
            run_timeout: pipeline.run_timeout_secs.map(Duration::from_secs),
            list_page_size: pipeline
                .list_page_size
                .unwrap_or(DEFAULT_LIST_PAGE_SIZE)
                .max(1),
            retained_runs: pipeline.retained_runs.unwrap_or(DEFAULT_RETAINED_RUNS),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config =
        toml::from_str(&contents).context("Failed to parse config file as TOML")?;
    Ok(config)
}
