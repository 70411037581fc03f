//! # Flow Manager Configuration
//!
//! Typed configuration for the job execution manager, loaded from a base
//! TOML file overlaid by an environment-specific TOML file and `FLOW_*` /
//! `RESOLWE_*` / `CELERY_*` environment variables via the `config` crate.
//! The reference codebase splits configuration across a web/worker
//! hierarchy; this crate has no such split, so everything collapses into a
//! single [`FlowManagerConfig`].

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};

/// Executor-facing configuration: directories, permission bits, the
/// interpreter to invoke, and extra environment variables for the script.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Dotted module name of the executor package. Defaults to the bundled
    /// local executor.
    pub name: String,
    pub data_dir: String,
    pub runtime_dir: String,
    pub data_dir_mode: u32,
    pub runtime_dir_mode: u32,
    /// Interpreter command used in the launch argv.
    pub python: String,
    /// Extra environment variables prepended to the generated script.
    pub set_env: HashMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "flowexec.executors.local".to_string(),
            data_dir: "/var/lib/flowexec/data".to_string(),
            runtime_dir: "/var/lib/flowexec/runtime".to_string(),
            data_dir_mode: 0o755,
            runtime_dir_mode: 0o755,
            python: "python3".to_string(),
            set_env: HashMap::new(),
        }
    }
}

/// Manager-level toggles that do not belong to any one component.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Retain runtime directories after `FINISH` instead of removing them.
    pub keep_data: bool,
    /// Clear the content-type cache on every `COMMUNICATE`.
    pub disable_ctype_cache: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            keep_data: false,
            disable_ctype_cache: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowManagerConfig {
    pub executor: ExecutorConfig,
    pub manager: ManagerConfig,
    /// Ordered list of expression-engine module names.
    pub expression_engines: Vec<String>,
    /// Ordered list of execution-engine module names.
    pub execution_engines: Vec<String>,
    /// Exported into the generated script's environment as `RESOLWE_HOST_URL`.
    pub host_url: String,
    /// Passthrough map for any `FLOW_*` / `RESOLWE_*` / `CELERY_*` key this
    /// struct does not name explicitly, serialized verbatim into the
    /// effective-settings bundle.
    pub extras: HashMap<String, serde_json::Value>,
}

impl Default for FlowManagerConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            manager: ManagerConfig::default(),
            expression_engines: vec!["flowexec.expression_engines.jinja2".to_string()],
            execution_engines: vec!["flowexec.execution_engines.bash".to_string()],
            host_url: "localhost".to_string(),
            extras: HashMap::new(),
        }
    }
}

impl FlowManagerConfig {
    /// Load configuration from `<config_dir>/base.toml`, overlaid by
    /// `<config_dir>/<environment>.toml` (if present), overlaid by
    /// `FLOW_`/`RESOLWE_`/`CELERY_`-prefixed environment variables.
    pub fn load(config_dir: &Path, environment: &str) -> FlowResult<Self> {
        let base = config_dir.join("base.toml");
        let env_file = config_dir.join(format!("{environment}.toml"));

        let mut builder = config::Config::builder()
            .add_source(config::File::from(base.as_path()).required(false))
            .add_source(config::File::from(env_file.as_path()).required(false));

        for prefix in ["FLOW", "RESOLWE", "CELERY"] {
            builder = builder.add_source(
                config::Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Every `FLOW_`/`RESOLWE_`/`CELERY_` host environment variable,
    /// serialized verbatim, used as the lowest-precedence layer of effective
    /// settings composed by the command loop.
    pub fn host_environment_settings() -> HashMap<String, serde_json::Value> {
        let mut out = HashMap::new();
        for (key, value) in std::env::vars() {
            if key.starts_with("FLOW_") || key.starts_with("RESOLWE_") || key.starts_with("CELERY_")
            {
                out.insert(key, serde_json::Value::String(value));
            }
        }
        out
    }
}
