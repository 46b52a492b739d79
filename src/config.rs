//! Config field definitions for the pool manager and the drain worker.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer};

use crate::core::resources::Resources;

/// Per-pool configuration namespace, read once at manager construction.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PoolConfig {
    #[serde(default)]
    pub draining_enabled: bool,
    pub scaling_limits: ScalingLimits,
    /// Ordered list of single-key mappings `{<backend tag>: <backend config>}`.
    /// Malformed entries and unknown tags are logged and skipped at reload.
    #[serde(default)]
    pub resource_groups: Vec<BTreeMap<String, serde_yaml::Value>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScalingLimits {
    pub min_capacity_cpus: f64,
    pub min_capacity_mem: f64,
    pub min_capacity_disk: f64,
    pub min_capacity_gpus: f64,

    pub max_capacity_cpus: f64,
    pub max_capacity_mem: f64,
    pub max_capacity_disk: f64,
    pub max_capacity_gpus: f64,

    pub max_cpus_to_add: f64,
    pub max_mem_to_add: f64,
    pub max_disk_to_add: f64,
    pub max_gpus_to_add: f64,

    pub max_cpus_to_remove: f64,
    pub max_mem_to_remove: f64,
    pub max_disk_to_remove: f64,
    pub max_gpus_to_remove: f64,

    /// Integer, or the string "inf" for no limit.
    #[serde(
        default = "max_tasks_to_kill_default",
        deserialize_with = "deserialize_int_or_inf"
    )]
    pub max_tasks_to_kill: f64,
}

fn max_tasks_to_kill_default() -> f64 {
    0.0
}

impl ScalingLimits {
    pub fn min_capacity(&self) -> Resources {
        Resources::new(
            self.min_capacity_cpus,
            self.min_capacity_mem,
            self.min_capacity_disk,
            self.min_capacity_gpus,
        )
    }

    pub fn max_capacity(&self) -> Resources {
        Resources::new(
            self.max_capacity_cpus,
            self.max_capacity_mem,
            self.max_capacity_disk,
            self.max_capacity_gpus,
        )
    }

    pub fn max_capacity_to_add(&self) -> Resources {
        Resources::new(
            self.max_cpus_to_add,
            self.max_mem_to_add,
            self.max_disk_to_add,
            self.max_gpus_to_add,
        )
    }

    pub fn max_capacity_to_remove(&self) -> Resources {
        Resources::new(
            self.max_cpus_to_remove,
            self.max_mem_to_remove,
            self.max_disk_to_remove,
            self.max_gpus_to_remove,
        )
    }
}

fn deserialize_int_or_inf<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrInf {
        Count(u64),
        Text(String),
    }

    match IntOrInf::deserialize(deserializer)? {
        IntOrInf::Count(count) => Ok(count as f64),
        IntOrInf::Text(text) if text == "inf" => Ok(f64::INFINITY),
        IntOrInf::Text(text) => Err(serde::de::Error::custom(format!(
            "expected an integer or \"inf\", got {:?}",
            text
        ))),
    }
}

/// Cluster-wide configuration for the drain worker, read from the env
/// config file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DrainWorkerConfig {
    pub mesos_clusters: HashMap<String, MesosClusterConfig>,
    /// Per-sender delay before a termination message becomes visible.
    #[serde(default)]
    pub drain_termination_timeout_seconds: HashMap<String, u64>,
    #[serde(default = "mesos_maintenance_timeout_seconds_default")]
    pub mesos_maintenance_timeout_seconds: u64,
    /// If not set, logs go to stderr.
    pub logs_filepath: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MesosClusterConfig {
    pub drain_queue_url: String,
    pub termination_queue_url: String,
    pub fqdn: String,
    pub aws_region: String,
}

fn mesos_maintenance_timeout_seconds_default() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config_yaml(max_tasks_to_kill: &str) -> String {
        format!(
            r#"
            draining_enabled: true
            scaling_limits:
              min_capacity_cpus: 1
              min_capacity_mem: 4
              min_capacity_disk: 0
              min_capacity_gpus: 0
              max_capacity_cpus: 100
              max_capacity_mem: 400
              max_capacity_disk: 1000
              max_capacity_gpus: 8
              max_cpus_to_add: 20
              max_mem_to_add: 80
              max_disk_to_add: 200
              max_gpus_to_add: 2
              max_cpus_to_remove: 10
              max_mem_to_remove: 40
              max_disk_to_remove: 100
              max_gpus_to_remove: 1
              max_tasks_to_kill: {}
            resource_groups:
              - sfr: {{group_ids: [sfr-1, sfr-2]}}
              - asg: {{group_ids: [asg-1]}}
            "#,
            max_tasks_to_kill
        )
    }

    #[test]
    fn test_pool_config_parses() {
        let config: PoolConfig = serde_yaml::from_str(&pool_config_yaml("100")).unwrap();
        assert!(config.draining_enabled);
        assert_eq!(100.0, config.scaling_limits.max_tasks_to_kill);
        assert_eq!(
            Resources::new(1.0, 4.0, 0.0, 0.0),
            config.scaling_limits.min_capacity()
        );
        assert_eq!(
            Resources::new(20.0, 80.0, 200.0, 2.0),
            config.scaling_limits.max_capacity_to_add()
        );
        assert_eq!(2, config.resource_groups.len());
        assert!(config.resource_groups[0].contains_key("sfr"));
    }

    #[test]
    fn test_max_tasks_to_kill_inf() {
        let config: PoolConfig = serde_yaml::from_str(&pool_config_yaml("inf")).unwrap();
        assert_eq!(f64::INFINITY, config.scaling_limits.max_tasks_to_kill);
    }

    #[test]
    fn test_max_tasks_to_kill_rejects_other_strings() {
        assert!(serde_yaml::from_str::<PoolConfig>(&pool_config_yaml("unlimited")).is_err());
    }

    #[test]
    fn test_drain_worker_config_defaults() {
        let config: DrainWorkerConfig = serde_yaml::from_str(
            r#"
            mesos_clusters:
              westeros-prod:
                drain_queue_url: "https://queue/drain"
                termination_queue_url: "https://queue/terminate"
                fqdn: "mesos.example.com"
                aws_region: "us-west-2"
            "#,
        )
        .unwrap();
        assert_eq!(600, config.mesos_maintenance_timeout_seconds);
        assert!(config.drain_termination_timeout_seconds.is_empty());
        assert_eq!(
            "mesos.example.com",
            config.mesos_clusters["westeros-prod"].fqdn
        );
    }
}
