//! Process configuration and CLI (spec.md §6 "Configuration (enumerated)"),
//! mirroring `persist-client/src/bin/main.rs`'s `clap::Parser` usage.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "cm", about = "Communication Manager: mediates between the cloud control plane and the SM fleet")]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/cm/cm.toml")]
    pub config: PathBuf,
}

fn default_cert_storage() -> String {
    "online".to_string()
}

fn default_cloud_response_wait_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_cm_reconnect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

/// Every field named in spec.md §6's Configuration list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub service_discovery_url: Url,
    /// Address the SM controller's gRPC server binds to.
    pub cm_server_url: String,
    pub ca_cert: PathBuf,

    #[serde(default = "default_cert_storage")]
    pub cert_storage: String,

    #[serde(default = "default_cloud_response_wait_timeout", deserialize_with = "duration_secs")]
    pub cloud_response_wait_timeout: Duration,

    #[serde(default = "default_cm_reconnect_timeout", deserialize_with = "duration_secs")]
    pub cm_reconnect_timeout: Duration,

    pub start_provisioning_cmd: Option<String>,
    pub finish_provisioning_cmd: Option<String>,
    /// Run by a future deprovision operation; no inbound message currently
    /// triggers one (see DESIGN.md).
    #[allow(dead_code)]
    pub deprovision_cmd: Option<String>,
    pub disk_encryption_cmd: Option<String>,

    pub working_dir: PathBuf,
    /// Consumed by the real storage backend's own migration step; the core
    /// only owns an in-memory `NetworkManagerStorage` (see DESIGN.md).
    #[allow(dead_code)]
    pub migration_path: Option<PathBuf>,
    #[allow(dead_code)]
    pub merged_migration_path: Option<PathBuf>,
}

impl Config {
    /// Missing required fields surface as a `toml` deserialize error, which
    /// `main` turns into exit code 1 (spec.md §6 "non-zero only on init
    /// failure (configuration...)").
    pub fn load(path: &std::path::Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&text).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn cert_storage_dir(&self) -> PathBuf {
        self.working_dir.join(&self.cert_storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        serviceDiscoveryUrl = "https://discovery.example/"
        cmServerUrl = "0.0.0.0:8443"
        caCert = "/etc/cm/ca.pem"
        workingDir = "/var/lib/cm"
    "#;

    #[test]
    fn required_fields_load_and_the_rest_default() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.cert_storage, "online");
        assert_eq!(config.cloud_response_wait_timeout, Duration::from_secs(5));
        assert_eq!(config.cm_reconnect_timeout, Duration::from_secs(10));
        assert!(config.start_provisioning_cmd.is_none());
    }

    #[test]
    fn a_missing_required_field_fails_to_parse() {
        let without_working_dir = r#"
            serviceDiscoveryUrl = "https://discovery.example/"
            cmServerUrl = "0.0.0.0:8443"
            caCert = "/etc/cm/ca.pem"
        "#;
        assert!(toml::from_str::<Config>(without_working_dir).is_err());
    }

    #[test]
    fn overridden_timeouts_are_read_in_seconds() {
        let with_timeouts = format!("{MINIMAL}\ncloudResponseWaitTimeout = 7\ncmReconnectTimeout = 30\n");
        let config: Config = toml::from_str(&with_timeouts).unwrap();
        assert_eq!(config.cloud_response_wait_timeout, Duration::from_secs(7));
        assert_eq!(config.cm_reconnect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn cert_storage_dir_joins_working_dir_and_storage_name() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.cert_storage_dir(), PathBuf::from("/var/lib/cm/online"));
    }
}
