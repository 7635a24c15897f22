//! Configuration layer. Loads the `thingsboard.*` and `storage.*` keys
//! described in spec §6 via layered file + environment providers, using
//! `figment` to merge a base file with environment overrides.

use std::path::PathBuf;

use async_trait::async_trait;
use figment::providers::{Env, Format, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::attributes::RemoteConfigurator;

fn default_max_payload_size_bytes() -> usize {
    4096
}

fn default_min_pack_send_delay_ms() -> u64 {
    500
}

fn default_stats_send_period_seconds() -> u64 {
    3600
}

fn default_check_connectors_configuration_seconds() -> u64 {
    60
}

fn default_updates_check_period_ms() -> u64 {
    300_000
}

/// `thingsboard.*` configuration keys (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThingsboardConfig {
    #[serde(default = "default_max_payload_size_bytes")]
    pub max_payload_size_bytes: usize,
    #[serde(default = "default_min_pack_send_delay_ms")]
    pub min_pack_send_delay_ms: u64,
    #[serde(default = "default_stats_send_period_seconds")]
    pub stats_send_period_in_seconds: u64,
    #[serde(default = "default_check_connectors_configuration_seconds")]
    pub check_connectors_configuration_in_seconds: u64,
    #[serde(default = "default_updates_check_period_ms")]
    pub updates_check_period_ms: u64,
    #[serde(default)]
    pub remote_shell: bool,
    #[serde(default)]
    pub remote_configuration: bool,
}

impl Default for ThingsboardConfig {
    fn default() -> Self {
        ThingsboardConfig {
            max_payload_size_bytes: default_max_payload_size_bytes(),
            min_pack_send_delay_ms: default_min_pack_send_delay_ms(),
            stats_send_period_in_seconds: default_stats_send_period_seconds(),
            check_connectors_configuration_in_seconds:
                default_check_connectors_configuration_seconds(),
            updates_check_period_ms: default_updates_check_period_ms(),
            remote_shell: false,
            remote_configuration: false,
        }
    }
}

/// `storage.*` configuration: selects and configures one of the three
/// Event Storage backends (spec §4.1, SPEC_FULL §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory {
        #[serde(default = "default_max_records_count")]
        max_records_count: usize,
    },
    File {
        data_folder_path: PathBuf,
        #[serde(default = "default_max_file_count")]
        max_file_count: usize,
        #[serde(default = "default_max_records_per_file")]
        max_records_per_file: usize,
    },
    Sqlite {
        data_file_path: PathBuf,
        #[serde(default = "default_max_records_count")]
        max_records_count: usize,
    },
}

fn default_max_records_count() -> usize {
    100_000
}

fn default_max_file_count() -> usize {
    10
}

fn default_max_records_per_file() -> usize {
    10_000
}

/// The batch size used for `getEventPack` checkouts (spec §4.1).
fn default_batch_size() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub thingsboard: ThingsboardConfig,
    pub storage: StorageConfig,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl GatewayConfig {
    /// Loads configuration layering a base TOML/YAML file under
    /// `{config_dir}/config.{toml,yaml}` with `GATEWAY_`-prefixed
    /// environment variable overrides.
    pub fn load(config_dir: &std::path::Path) -> Result<Self, figment::Error> {
        let toml_path = config_dir.join("config.toml");
        let yaml_path = config_dir.join("config.yaml");

        Figment::new()
            .merge(Toml::file(toml_path))
            .merge(Yaml::file(yaml_path))
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .extract()
    }
}

/// A `RemoteConfigurator` that treats each pushed `configuration` shared
/// attribute as an RFC 7396 JSON Merge Patch against the last-known
/// document, rather than a full replacement (spec §4.7: the cloud is free
/// to push a partial update). Suitable as a default for gateways whose
/// remote configuration is itself plain JSON rather than connector files.
pub struct MergePatchConfigurator {
    current: Mutex<Value>,
}

impl MergePatchConfigurator {
    pub fn new(initial: Value) -> Self {
        MergePatchConfigurator {
            current: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl RemoteConfigurator for MergePatchConfigurator {
    async fn apply(&self, configuration: Value) -> anyhow::Result<()> {
        let mut current = self.current.lock().await;
        json_patch::merge(&mut current, &configuration);
        Ok(())
    }

    async fn current(&self) -> Value {
        self.current.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_defaults_with_only_storage_specified() {
        crate::test_log::init();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[storage]\ntype = \"memory\"\n",
        )
        .unwrap();

        let config = GatewayConfig::load(dir.path()).unwrap();
        assert_eq!(config.thingsboard.max_payload_size_bytes, 4096);
        assert_eq!(config.thingsboard.min_pack_send_delay_ms, 500);
        match config.storage {
            StorageConfig::Memory { max_records_count } => {
                assert_eq!(max_records_count, 100_000);
            }
            _ => panic!("expected memory storage"),
        }
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[storage]\ntype = \"memory\"\n[thingsboard]\nmax_payload_size_bytes = 4096\n",
        )
        .unwrap();

        std::env::set_var("GATEWAY_THINGSBOARD__MAX_PAYLOAD_SIZE_BYTES", "2048");
        let config = GatewayConfig::load(dir.path()).unwrap();
        std::env::remove_var("GATEWAY_THINGSBOARD__MAX_PAYLOAD_SIZE_BYTES");

        assert_eq!(config.thingsboard.max_payload_size_bytes, 2048);
    }

    #[tokio::test]
    async fn merge_patch_configurator_merges_partial_updates() {
        use serde_json::json;

        let configurator =
            MergePatchConfigurator::new(json!({"pollPeriod": 10, "threshold": 5}));
        configurator
            .apply(json!({"pollPeriod": 20}))
            .await
            .unwrap();

        let current = configurator.current().await;
        assert_eq!(current["pollPeriod"], json!(20));
        assert_eq!(current["threshold"], json!(5));
    }

    #[tokio::test]
    async fn merge_patch_configurator_removes_keys_set_to_null() {
        use serde_json::json;

        let configurator = MergePatchConfigurator::new(json!({"pollPeriod": 10}));
        configurator
            .apply(json!({"pollPeriod": null}))
            .await
            .unwrap();

        let current = configurator.current().await;
        assert!(current.get("pollPeriod").is_none());
    }
}
