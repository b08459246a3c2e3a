//! Production target context: rendered command lines run through the
//! local shell, the way an on-call engineer would run them.

use async_trait::async_trait;
use medic_engine::{CommandOutput, TargetContext, TargetError};
use serde_json::Value;
use tracing::debug;

use crate::config::TargetConfig;

/// Runs commands against the kubectl context of the host the daemon is
/// deployed on. One instance per cluster; sessions targeting different
/// clusters get different instances.
pub struct KubectlContext {
    cluster: String,
    vars: serde_json::Map<String, Value>,
}

impl KubectlContext {
    /// Build from the daemon's target configuration.
    #[must_use]
    pub fn new(config: &TargetConfig) -> Self {
        let mut vars = serde_json::Map::new();
        vars.insert(
            "namespace".to_string(),
            Value::String(config.namespace.clone()),
        );
        for (key, value) in &config.vars {
            vars.insert(key.clone(), Value::String(value.clone()));
        }
        Self {
            cluster: config.cluster.clone(),
            vars,
        }
    }
}

#[async_trait]
impl TargetContext for KubectlContext {
    fn name(&self) -> &str {
        &self.cluster
    }

    fn vars(&self) -> serde_json::Map<String, Value> {
        self.vars.clone()
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, TargetError> {
        debug!(cluster = %self.cluster, command, "running target command");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| TargetError::Spawn(e.to_string()))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_shell_commands() {
        let context = KubectlContext::new(&TargetConfig::default());
        let output = context.run("echo signal=ok").await.unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("signal=ok"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_not_errored() {
        let context = KubectlContext::new(&TargetConfig::default());
        let output = context.run("exit 3").await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[test]
    fn test_vars_carry_namespace_and_extras() {
        let config = TargetConfig {
            namespace: "payments".to_string(),
            vars: std::collections::BTreeMap::from([(
                "region".to_string(),
                "eu-west-1".to_string(),
            )]),
            ..TargetConfig::default()
        };
        let context = KubectlContext::new(&config);
        let vars = context.vars();
        assert_eq!(vars["namespace"], "payments");
        assert_eq!(vars["region"], "eu-west-1");
    }
}
