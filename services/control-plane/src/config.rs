use std::time::Duration;

use jobmgr_reconcile::{DEFAULT_RECONCILE_INTERVAL, DEFAULT_RESCHEDULE_INTERVAL};
use thiserror::Error;

use crate::controller::ClusterTarget;
use crate::db::DbConfig;

const DEFAULT_NOTEBOOK_MAX_QUEUED_TIME: Duration = Duration::from_secs(600);
const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ARTIFACT_PREFIX: &str = "models";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name}: invalid value {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("JOBMGR_CLUSTER_AGENTS: invalid entry {0:?} (want tenant/cluster=url)")]
    InvalidAgent(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Where the controllers reach one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub target: ClusterTarget,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub reconcile_interval: Duration,
    pub reschedule_interval: Duration,
    pub notebook_max_queued_time: Duration,
    pub model_registry_url: Option<String>,
    pub model_artifact_prefix: String,
    pub cluster_agents: Vec<AgentEndpoint>,
    pub agent_timeout: Duration,
}

impl Config {
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::from_lookup(|name| std::env::var(name).ok())?;
        config.database = DbConfig::from_env();
        Ok(config)
    }

    /// Builds the non-database settings from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let secs = |name: &'static str, default: Duration| -> ConfigResult<Duration> {
            match var(name) {
                None => Ok(default),
                Some(value) => match value.trim().parse::<u64>() {
                    Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
                    _ => Err(ConfigError::InvalidValue { name, value }),
                },
            }
        };

        let dev_mode = var("JOBMGR_DEV_MODE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            log_level: var("JOBMGR_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            dev_mode,
            database: DbConfig::default(),
            reconcile_interval: secs("JOBMGR_RECONCILE_INTERVAL_SECS", DEFAULT_RECONCILE_INTERVAL)?,
            reschedule_interval: secs("JOBMGR_RESCHEDULE_INTERVAL_SECS", DEFAULT_RESCHEDULE_INTERVAL)?,
            notebook_max_queued_time: secs(
                "JOBMGR_NOTEBOOK_MAX_QUEUED_SECS",
                DEFAULT_NOTEBOOK_MAX_QUEUED_TIME,
            )?,
            model_registry_url: var("JOBMGR_MODEL_REGISTRY_URL"),
            model_artifact_prefix: var("JOBMGR_MODEL_ARTIFACT_PREFIX")
                .unwrap_or_else(|| DEFAULT_ARTIFACT_PREFIX.to_string()),
            cluster_agents: parse_agents(&var("JOBMGR_CLUSTER_AGENTS").unwrap_or_default())?,
            agent_timeout: secs("JOBMGR_AGENT_TIMEOUT_SECS", DEFAULT_AGENT_TIMEOUT)?,
        })
    }

    pub fn targets(&self) -> Vec<ClusterTarget> {
        self.cluster_agents.iter().map(|a| a.target.clone()).collect()
    }
}

/// Parses `tenant/cluster=url` entries separated by commas.
fn parse_agents(raw: &str) -> ConfigResult<Vec<AgentEndpoint>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || ConfigError::InvalidAgent(entry.to_string());
            let (target, url) = entry.split_once('=').ok_or_else(invalid)?;
            let (tenant_id, cluster_id) = target.trim().split_once('/').ok_or_else(invalid)?;
            let url = url.trim();
            if tenant_id.is_empty() || cluster_id.is_empty() || url.is_empty() {
                return Err(invalid());
            }
            Ok(AgentEndpoint {
                target: ClusterTarget::new(tenant_id, cluster_id),
                base_url: url.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.log_level, "info");
        assert!(!config.dev_mode);
        assert_eq!(config.reconcile_interval, Duration::from_secs(5));
        assert_eq!(config.reschedule_interval, Duration::from_secs(10));
        assert_eq!(config.notebook_max_queued_time, Duration::from_secs(600));
        assert_eq!(config.model_registry_url, None);
        assert_eq!(config.model_artifact_prefix, "models");
        assert!(config.cluster_agents.is_empty());
    }

    #[test]
    fn test_overrides_and_agents() {
        let config = Config::from_lookup(lookup(&[
            ("JOBMGR_DEV_MODE", "TRUE"),
            ("JOBMGR_NOTEBOOK_MAX_QUEUED_SECS", "120"),
            ("JOBMGR_MODEL_REGISTRY_URL", "http://registry:8080"),
            (
                "JOBMGR_CLUSTER_AGENTS",
                "tenant-a/c1=http://agent-1:7000, tenant-b/c2=http://agent-2:7000",
            ),
        ]))
        .unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.notebook_max_queued_time, Duration::from_secs(120));
        assert_eq!(config.model_registry_url.as_deref(), Some("http://registry:8080"));
        assert_eq!(
            config.targets(),
            vec![ClusterTarget::new("tenant-a", "c1"), ClusterTarget::new("tenant-b", "c2")]
        );
        assert_eq!(config.cluster_agents[1].base_url, "http://agent-2:7000");
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[("JOBMGR_RECONCILE_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "JOBMGR_RECONCILE_INTERVAL_SECS", .. }));

        let err = Config::from_lookup(lookup(&[("JOBMGR_CLUSTER_AGENTS", "c1=http://agent")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAgent(_)));
    }
}
