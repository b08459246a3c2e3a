//! Daemon configuration: engine knobs plus the target cluster context.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use medic_engine::EngineConfig;
use serde::{Deserialize, Serialize};

/// Top-level `medic.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicdConfig {
    /// Engine configuration (thresholds, pool sizes, policies)
    pub engine: EngineConfig,
    /// Target cluster context
    pub target: TargetConfig,
}

/// The cluster context probes and actions run against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Cluster identity, threaded into every command's variable map
    pub cluster: String,
    /// Default namespace template variable
    pub namespace: String,
    /// Extra template variables available to command templates
    pub vars: BTreeMap<String, String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            cluster: "default".to_string(),
            namespace: "default".to_string(),
            vars: BTreeMap::new(),
        }
    }
}

impl MedicdConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Load from an optional path, falling back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = MedicdConfig::load_or_default(None).unwrap();
        assert_eq!(config.target.cluster, "default");
        assert_eq!(config.engine.workers, 8);
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("medic.toml");
        std::fs::write(
            &path,
            r#"
[engine]
workers = 2

[target]
cluster = "prod-east"
namespace = "payments"

[target.vars]
region = "us-east-1"
"#,
        )
        .unwrap();

        let config = MedicdConfig::load(&path).unwrap();
        assert_eq!(config.engine.workers, 2);
        assert!((config.engine.confirmation_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.target.cluster, "prod-east");
        assert_eq!(config.target.vars["region"], "us-east-1");
    }
}
