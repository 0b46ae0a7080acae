//! Orchestrator configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `REVO_*` environment variables. [`OrchestratorConfig::validate`] runs last.
//!
//! ```toml
//! worker_pool_size = 8
//! request_deadline_ms = 120000
//!
//! [stage_defaults]
//! timeout_ms = 30000
//! max_attempts = 3
//!
//! [graph]
//! shape = "parallel"
//! analysis_stages = ["retrieve_context", "analyze_code"]
//!
//! [graph.requirements]
//! retrieve_context = "optional"
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::delivery::DeliverySettings;
use crate::domain::error::{OrchestratorError, Result};
use crate::graph::builder::{GraphOptions, GraphShape, StageDefaults, TaskGraphBuilder};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent stage invocations across all requests.
    pub worker_pool_size: usize,
    /// Overall budget per request, from acceptance.
    pub request_deadline_ms: u64,
    /// How long finished requests and delivery receipts are remembered.
    pub retention_secs: u64,
    pub stage_defaults: StageDefaults,
    pub delivery: DeliverySettings,
    pub graph: GraphOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            request_deadline_ms: 120_000,
            retention_secs: 3_600,
            stage_defaults: StageDefaults::default(),
            delivery: DeliverySettings::default(),
            graph: GraphOptions::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| OrchestratorError::Config(format!("invalid TOML: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults or `path`, then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `REVO_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Recognised keys:
    /// `REVO_WORKER_POOL_SIZE`, `REVO_REQUEST_DEADLINE_MS`, `REVO_RETENTION_SECS`,
    /// `REVO_STAGE_TIMEOUT_MS`, `REVO_STAGE_MAX_ATTEMPTS`,
    /// `REVO_DELIVERY_MAX_ATTEMPTS`, `REVO_DELIVERY_TIMEOUT_MS`, `REVO_GRAPH_SHAPE`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("REVO_WORKER_POOL_SIZE") {
            self.worker_pool_size = parse_var("REVO_WORKER_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("REVO_REQUEST_DEADLINE_MS") {
            self.request_deadline_ms = parse_var("REVO_REQUEST_DEADLINE_MS", &v)?;
        }
        if let Some(v) = lookup("REVO_RETENTION_SECS") {
            self.retention_secs = parse_var("REVO_RETENTION_SECS", &v)?;
        }
        if let Some(v) = lookup("REVO_STAGE_TIMEOUT_MS") {
            self.stage_defaults.timeout_ms = parse_var("REVO_STAGE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("REVO_STAGE_MAX_ATTEMPTS") {
            self.stage_defaults.max_attempts = parse_var("REVO_STAGE_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("REVO_DELIVERY_MAX_ATTEMPTS") {
            self.delivery.max_attempts = parse_var("REVO_DELIVERY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("REVO_DELIVERY_TIMEOUT_MS") {
            self.delivery.timeout_ms = parse_var("REVO_DELIVERY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("REVO_GRAPH_SHAPE") {
            self.graph.shape = GraphShape::from_str(v.trim())?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(OrchestratorError::Config(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.request_deadline_ms == 0 {
            return Err(OrchestratorError::Config(
                "request_deadline_ms must be positive".to_string(),
            ));
        }
        if self.stage_defaults.timeout_ms == 0 {
            return Err(OrchestratorError::Config(
                "stage_defaults.timeout_ms must be positive".to_string(),
            ));
        }
        if self.delivery.timeout_ms == 0 {
            return Err(OrchestratorError::Config(
                "delivery.timeout_ms must be positive".to_string(),
            ));
        }
        if self.stage_defaults.max_attempts == 0 || self.delivery.max_attempts == 0 {
            return Err(OrchestratorError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.stage_defaults.backoff_ceiling_ms < self.stage_defaults.backoff_base_ms {
            return Err(OrchestratorError::Config(
                "stage_defaults.backoff_ceiling_ms is below backoff_base_ms".to_string(),
            ));
        }
        self.graph.validate()
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn graph_builder(&self) -> TaskGraphBuilder {
        TaskGraphBuilder::new(self.graph.clone(), self.stage_defaults.clone())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| OrchestratorError::Config(format!("{key}='{value}' is not a valid value")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use crate::graph::stage::Requirement;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = OrchestratorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.worker_pool_size, 8);
        assert_eq!(cfg.request_deadline(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let cfg = OrchestratorConfig::from_toml_str(
            r#"
            worker_pool_size = 2

            [stage_defaults]
            timeout_ms = 1000

            [graph]
            shape = "sequential"
            analysis_stages = ["analyze_code"]

            [graph.overrides.analyze_code]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.worker_pool_size, 2);
        assert_eq!(cfg.stage_defaults.timeout_ms, 1000);
        assert_eq!(cfg.stage_defaults.max_attempts, 3);
        assert_eq!(cfg.graph.shape, GraphShape::Sequential);
        assert_eq!(cfg.delivery.timeout_ms, 2_500);
        assert_eq!(cfg.graph.overrides["analyze_code"].max_attempts, Some(5));
        assert_eq!(
            cfg.graph.requirements.get("analyze_code"),
            Some(&Requirement::Required)
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = OrchestratorConfig::from_toml_str("worker_pool_size = \"many\"").unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn test_from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "retention_secs = 10").unwrap();
        let cfg = OrchestratorConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.retention(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = OrchestratorConfig::from_file(Path::new("/nonexistent/revo.toml")).unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn test_overrides_apply_and_reject_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("REVO_WORKER_POOL_SIZE", "1"),
            ("REVO_GRAPH_SHAPE", "sequential"),
            ("REVO_DELIVERY_TIMEOUT_MS", "2500"),
        ]);
        let mut cfg = OrchestratorConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.worker_pool_size, 1);
        assert_eq!(cfg.graph.shape, GraphShape::Sequential);

        let mut cfg = OrchestratorConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "REVO_REQUEST_DEADLINE_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("REVO_REQUEST_DEADLINE_MS"));
    }

    #[test]
    fn test_zero_pool_is_rejected() {
        let cfg = OrchestratorConfig {
            worker_pool_size: 0,
            ..OrchestratorConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn test_zero_delivery_timeout_is_rejected() {
        let mut cfg = OrchestratorConfig::default();
        cfg.delivery.timeout_ms = 0;
        assert!(matches!(cfg.validate(), Err(OrchestratorError::Config(_))));
    }
}
